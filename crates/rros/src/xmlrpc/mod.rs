// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XMLRPC codec for the control plane.
//!
//! Everything the master and the peer slave APIs speak: a typed parameter
//! vector ([`Value`]) encoded into `<methodCall>`/`<methodResponse>`
//! envelopes, wrapped in HTTP/1.0 with `Content-Length` framing.

mod codec;
mod value;

pub use codec::{
    decode_request, decode_response, encode_fault, encode_request, encode_response,
    response_status_ok, try_split_http, HttpMessage,
};
pub use value::Value;
