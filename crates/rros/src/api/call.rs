// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Call records and typed call constructors.
//!
//! Each record carries the method selector, the encoded argument vector,
//! the target endpoint, an internal continuation (what the engine does with
//! the decoded result) and at most one user result callback. The callback
//! fires exactly once: with the decoded parameter vector on success, with
//! `None` on failure or cancellation.

use std::fmt;

use crate::error::{Result, RosError};
use crate::xmlrpc::Value;

/// Method selector for every RPC this node issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    RegisterPublisher,
    UnregisterPublisher,
    RegisterSubscriber,
    UnregisterSubscriber,
    RegisterService,
    UnregisterService,
    LookupService,
    RequestTopic,
    GetParam,
    SetParam,
    DeleteParam,
    HasParam,
    GetPid,
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterPublisher => "registerPublisher",
            Self::UnregisterPublisher => "unregisterPublisher",
            Self::RegisterSubscriber => "registerSubscriber",
            Self::UnregisterSubscriber => "unregisterSubscriber",
            Self::RegisterService => "registerService",
            Self::UnregisterService => "unregisterService",
            Self::LookupService => "lookupService",
            Self::RequestTopic => "requestTopic",
            Self::GetParam => "getParam",
            Self::SetParam => "setParam",
            Self::DeleteParam => "deleteParam",
            Self::HasParam => "hasParam",
            Self::GetPid => "getPid",
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine does when the call completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Continuation {
    /// Nothing beyond the user callback.
    None,

    /// `registerPublisher` answered; nothing to chain, subscribers connect
    /// to us.
    RegisteredPublisher { pub_idx: usize },

    /// `registerSubscriber` answered with the current publisher list.
    RegisteredSubscriber { sub_idx: usize },

    /// A peer answered `requestTopic` for this subscription.
    RequestedTopic { sub_idx: usize, peer_uri: String },

    /// `lookupService` answered with the provider endpoint.
    LookedUpService { caller_idx: usize },

    /// The periodic master ping answered.
    Pinged,
}

/// Exactly-once result callback: decoded parameter vector on success,
/// `None` on failure or cancellation.
pub type ResultCallback = Box<dyn FnMut(u64, Option<&[Value]>)>;

/// One pending or in-flight outbound RPC.
pub struct ApiCall {
    /// Progressive id, assigned at enqueue time.
    pub id: u64,

    pub method: ApiMethod,
    pub params: Vec<Value>,

    /// Target endpoint (master or peer).
    pub host: String,
    pub port: u16,

    pub(crate) continuation: Continuation,
    pub(crate) on_result: Option<ResultCallback>,
}

impl ApiCall {
    pub fn new(
        method: ApiMethod,
        params: Vec<Value>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: 0,
            method,
            params,
            host: host.into(),
            port,
            continuation: Continuation::None,
            on_result: None,
        }
    }

    pub(crate) fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_callback(mut self, cb: ResultCallback) -> Self {
        self.on_result = Some(cb);
        self
    }

    /// Target endpoint key used for in-flight serialization.
    pub fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("endpoint", &format_args!("{}:{}", self.host, self.port))
            .finish_non_exhaustive()
    }
}

/// Split the standard master reply `[code, statusMessage, payload]`.
pub(crate) fn parse_ros_triple(params: &[Value]) -> Result<(i32, String, Value)> {
    let triple = params
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| RosError::xmlrpc("malformed frame: response is not a triple"))?;
    if triple.len() < 3 {
        return Err(RosError::xmlrpc(format!(
            "malformed frame: triple has {} elements",
            triple.len()
        )));
    }
    let code = triple[0]
        .as_i32()
        .ok_or_else(|| RosError::xmlrpc("malformed frame: status code is not an integer"))?;
    let status = triple[1].as_str().unwrap_or("").to_string();
    Ok((code, status, triple[2].clone()))
}

/// Parse `http://host:port/` into an endpoint.
pub(crate) fn parse_http_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| RosError::xmlrpc(format!("not an http uri: {:?}", uri)))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest
        .split_once(':')
        .ok_or_else(|| RosError::xmlrpc(format!("uri without port: {:?}", uri)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RosError::xmlrpc(format!("bad port in uri: {:?}", uri)))?;
    if host.is_empty() {
        return Err(RosError::xmlrpc(format!("uri without host: {:?}", uri)));
    }
    Ok((host.to_string(), port))
}

/// Parse `rosrpc://host:port` into an endpoint.
pub(crate) fn parse_rosrpc_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("rosrpc://")
        .ok_or_else(|| RosError::xmlrpc(format!("not a rosrpc uri: {:?}", uri)))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest
        .split_once(':')
        .ok_or_else(|| RosError::xmlrpc(format!("uri without port: {:?}", uri)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RosError::xmlrpc(format!("bad port in uri: {:?}", uri)))?;
    Ok((host.to_string(), port))
}
