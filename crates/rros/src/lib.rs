// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rros - single-threaded ROS1 client node runtime
//!
//! A pure Rust node runtime for the ROS1 publish/subscribe and service
//! middleware: register with a master, advertise and subscribe to topics,
//! provide and invoke services.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use rros::{Node, StaticSchemaDb};
//!
//! fn main() -> rros::Result<()> {
//!     let mut db = StaticSchemaDb::new();
//!     db.insert_message("std_msgs/String", "992ce8a1687cec8c8bd883ec73ca41d1", "string data\n");
//!
//!     let mut node = Node::new("/listener", "127.0.0.1", "127.0.0.1", 11311, Box::new(db))?;
//!     node.register_subscriber("/chatter", "std_msgs/String", false, |payload| {
//!         println!("heard {} bytes", payload.len());
//!     })?;
//!
//!     let exit = AtomicBool::new(false);
//!     node.run(None, &exit)
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                              Node                                  |
//! |   registry (pubs / subs / providers / callers, slot-indexed)       |
//! +--------------------------------------------------------------------+
//! |  Control plane (XMLRPC/HTTP 1.0)   |  Data plane (TCPROS)          |
//! |  call queue -> dispatcher flows    |  per-peer sessions:           |
//! |  inbound slave API server          |  handshake -> stream / rpc    |
//! +--------------------------------------------------------------------+
//! |            Event engine: one mio poll loop, timer wheel            |
//! +--------------------------------------------------------------------+
//! ```
//!
//! The engine is **single-threaded cooperative**: every socket and timer is
//! multiplexed over one poll, callbacks run inline and must not block, and
//! the host controls lifetime through the exit flag handed to
//! [`Node::run`]. Payload serialization is the host's business - the
//! runtime moves opaque byte frames and only needs type digests, supplied
//! through the [`SchemaDb`] collaborator.

/// Control-plane call machinery (queue, dispatcher, slave API server).
pub mod api;
/// Monotonic clock and timer wheel.
pub mod clock;
/// Node configuration and protocol constants.
pub mod config;
/// Error taxonomy.
pub mod error;
/// The node, its registry, and the event engine.
pub mod node;
/// mio-based readiness multiplexing and buffered socket I/O.
pub mod reactor;
/// Message-schema collaborator interface.
pub mod schema;
/// TCPROS data-plane protocol (framing, headers, sessions).
pub mod tcpros;
/// XMLRPC codec for the control plane.
pub mod xmlrpc;

pub use config::NodeConfig;
pub use error::{ErrorKind, Result, RosError};
pub use node::registry::{CallerEvent, PublishCallback, ServiceHandler};
pub use node::{wait_port_open, Message, Node, NodeCommand, NodeHandle};
pub use schema::{DirSchemaDb, MessageSchema, SchemaDb, ServiceSchema, StaticSchemaDb};
pub use xmlrpc::Value;

/// Crate version string, also advertised in HTTP headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
