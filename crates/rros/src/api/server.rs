// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound XMLRPC endpoint (the ROS "slave API").
//!
//! Each accepted connection carries exactly one call: read the HTTP/1.0
//! request, dispatch by method name, write the response, close. Handlers
//! mutate the registry directly - the engine is single-threaded, so there
//! is nothing to lock. Side effects that need engine machinery (tearing
//! down sessions, stopping the loop) are returned as [`SlaveAction`]s.

use std::collections::HashMap;

use mio::net::TcpStream;
use mio::Token;

use crate::config::TCPROS_PROTOCOL;
use crate::error::RosError;
use crate::node::registry::Registry;
use crate::reactor::{self, ReadOutcome, WriteOutcome};
use crate::tcpros::{Session, SessionRole};
use crate::xmlrpc::{self, Value};

// ============================================================================
// Connection flow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Reading,
    Writing,
}

/// Result of advancing an inbound connection.
pub(crate) enum ServerConnStatus {
    Pending,

    /// A complete request body is available; the engine dispatches it and
    /// calls [`ServerConn::set_response`].
    Request(String),

    /// Response fully flushed; close the socket.
    Done,

    Failed(RosError),
}

pub(crate) struct ServerConn {
    pub token: Token,
    pub stream: TcpStream,

    /// Drop-dead deadline for slow or silent clients (absolute, µs).
    pub deadline: u64,

    state: ConnState,
    inbuf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
}

impl ServerConn {
    pub(crate) fn new(token: Token, stream: TcpStream, deadline: u64) -> Self {
        Self {
            token,
            stream,
            deadline,
            state: ConnState::Reading,
            inbuf: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
        }
    }

    pub(crate) fn wants(&self) -> (bool, bool) {
        match self.state {
            ConnState::Reading => (true, false),
            ConnState::Writing => (false, true),
        }
    }

    pub(crate) fn set_response(&mut self, bytes: Vec<u8>) {
        self.out = bytes;
        self.out_pos = 0;
        self.state = ConnState::Writing;
    }

    pub(crate) fn advance(&mut self, readable: bool, writable: bool) -> ServerConnStatus {
        match self.state {
            ConnState::Reading => {
                if !readable {
                    return ServerConnStatus::Pending;
                }
                let outcome = match reactor::drain_read(&mut self.stream, &mut self.inbuf) {
                    Ok((_, o)) => o,
                    Err(e) => {
                        return ServerConnStatus::Failed(RosError::from_io(e, "slave request read"))
                    }
                };
                match xmlrpc::try_split_http(&self.inbuf) {
                    Ok(Some(msg)) => {
                        ServerConnStatus::Request(String::from_utf8_lossy(&msg.body).into_owned())
                    }
                    Ok(None) if outcome == ReadOutcome::Eof => ServerConnStatus::Failed(
                        RosError::xmlrpc("truncated body: client closed early"),
                    ),
                    Ok(None) => ServerConnStatus::Pending,
                    Err(e) => ServerConnStatus::Failed(e),
                }
            }
            ConnState::Writing => {
                if !writable && self.out_pos >= self.out.len() {
                    return ServerConnStatus::Pending;
                }
                match reactor::flush_write(&mut self.stream, &self.out, &mut self.out_pos) {
                    Ok(WriteOutcome::Flushed) => ServerConnStatus::Done,
                    Ok(WriteOutcome::Pending) => ServerConnStatus::Pending,
                    Err(e) => ServerConnStatus::Failed(RosError::from_io(e, "slave response write")),
                }
            }
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Engine-level side effects requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlaveAction {
    /// `shutdown` was called; stop the loop.
    RequestExit,

    /// A subscription's publisher list changed; reconcile its sessions.
    SyncSubscription(usize),
}

pub(crate) struct SlaveCtx<'a> {
    pub registry: &'a mut Registry,
    pub sessions: &'a HashMap<u64, Session>,
    pub node_name: &'a str,
    pub advertised_host: &'a str,
    pub tcpros_port: u16,
    pub actions: &'a mut Vec<SlaveAction>,
}

fn triple(code: i32, status: impl Into<String>, payload: Value) -> Vec<u8> {
    xmlrpc::encode_response(&[Value::Array(vec![
        Value::Int(code),
        Value::Str(status.into()),
        payload,
    ])])
}

/// Dispatch one decoded request body to its handler.
///
/// Always produces a complete HTTP response; protocol-level failures become
/// XMLRPC faults with code `-1`.
pub(crate) fn dispatch(body: &str, ctx: &mut SlaveCtx<'_>) -> Vec<u8> {
    let (method, params) = match xmlrpc::decode_request(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("[slave] rejecting unparseable request: {}", e);
            return xmlrpc::encode_fault(-1, &format!("bad request: {}", e));
        }
    };
    log::debug!("[slave] {}({} params)", method, params.len());

    match method.as_str() {
        "publisherUpdate" => publisher_update(&params, ctx),
        "requestTopic" => request_topic(&params, ctx),
        "getPid" => triple(1, "", Value::Int(std::process::id() as i32)),
        "getBusInfo" => triple(1, "bus info", bus_info(ctx)),
        "getBusStats" => triple(1, "bus stats", bus_stats(ctx)),
        "getSubscriptions" => triple(
            1,
            "subscriptions",
            Value::Array(
                ctx.registry
                    .subscriptions()
                    .map(|(_, s)| {
                        Value::Array(vec![
                            Value::string(&s.topic),
                            Value::string(&s.msg_type),
                        ])
                    })
                    .collect(),
            ),
        ),
        "getPublications" => triple(
            1,
            "publications",
            Value::Array(
                ctx.registry
                    .publications()
                    .map(|(_, p)| {
                        Value::Array(vec![
                            Value::string(&p.topic),
                            Value::string(&p.msg_type),
                        ])
                    })
                    .collect(),
            ),
        ),
        "shutdown" => {
            let reason = params
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("(no reason)");
            log::info!("[slave] shutdown requested: {}", reason);
            ctx.actions.push(SlaveAction::RequestExit);
            triple(1, "shutting down", Value::Int(0))
        }
        other => xmlrpc::encode_fault(-1, &format!("unknown method {:?}", other)),
    }
}

fn publisher_update(params: &[Value], ctx: &mut SlaveCtx<'_>) -> Vec<u8> {
    let Some(topic) = params.get(1).and_then(Value::as_str) else {
        return xmlrpc::encode_fault(-1, "publisherUpdate: missing topic");
    };
    let Some(list) = params.get(2).and_then(Value::as_array) else {
        return xmlrpc::encode_fault(-1, "publisherUpdate: missing publisher list");
    };

    let Some((sub_idx, _)) = ctx.registry.find_subscription(topic) else {
        return triple(0, format!("not subscribed to {}", topic), Value::Int(0));
    };

    let uris: Vec<String> = list
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    log::debug!("[slave] publisherUpdate {}: {} publishers", topic, uris.len());

    if let Ok(sub) = ctx.registry.subscription_mut(sub_idx) {
        sub.publishers = uris;
    }
    ctx.actions.push(SlaveAction::SyncSubscription(sub_idx));
    triple(1, "publisher list updated", Value::Int(0))
}

fn request_topic(params: &[Value], ctx: &mut SlaveCtx<'_>) -> Vec<u8> {
    let Some(topic) = params.get(1).and_then(Value::as_str) else {
        return xmlrpc::encode_fault(-1, "requestTopic: missing topic");
    };
    let Some(protocols) = params.get(2).and_then(Value::as_array) else {
        return xmlrpc::encode_fault(-1, "requestTopic: missing protocol list");
    };

    if ctx.registry.find_publication(topic).is_none() {
        return triple(
            0,
            format!("topic {} is not published by this node", topic),
            Value::Array(Vec::new()),
        );
    }

    let tcpros_offered = protocols.iter().any(|p| {
        p.as_array()
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            == Some(TCPROS_PROTOCOL)
    });
    if !tcpros_offered {
        return triple(0, "no supported protocol", Value::Array(Vec::new()));
    }

    triple(
        1,
        format!("ready on {}:{}", ctx.advertised_host, ctx.tcpros_port),
        Value::Array(vec![
            Value::string(TCPROS_PROTOCOL),
            Value::string(ctx.advertised_host),
            Value::Int(i32::from(ctx.tcpros_port)),
        ]),
    )
}

fn bus_info(ctx: &SlaveCtx<'_>) -> Value {
    let mut rows = Vec::new();
    for session in ctx.sessions.values() {
        let direction = match session.role {
            SessionRole::TopicPublisher | SessionRole::ServiceServer => "o",
            SessionRole::TopicSubscriber | SessionRole::ServiceClient => "i",
        };
        let name = match session.role {
            SessionRole::TopicPublisher => ctx
                .registry
                .publication(session.provider_idx)
                .map(|p| p.topic.clone()),
            SessionRole::TopicSubscriber => ctx
                .registry
                .subscription(session.provider_idx)
                .map(|s| s.topic.clone()),
            SessionRole::ServiceServer => ctx
                .registry
                .provider(session.provider_idx)
                .map(|p| p.service.clone()),
            SessionRole::ServiceClient => ctx
                .registry
                .caller(session.provider_idx)
                .map(|c| c.service.clone()),
        }
        .unwrap_or_else(|_| "(unbound)".to_string());

        let destination = session
            .caller_id
            .clone()
            .unwrap_or_else(|| session.peer_uri.clone());

        rows.push(Value::Array(vec![
            Value::Int(session.id as i32),
            Value::Str(destination),
            Value::string(direction),
            Value::string(TCPROS_PROTOCOL),
            Value::Str(name),
            Value::Bool(!session.is_closed()),
        ]));
    }
    Value::Array(rows)
}

fn bus_stats(ctx: &SlaveCtx<'_>) -> Value {
    let publish: Vec<Value> = ctx
        .registry
        .publications()
        .map(|(_, p)| {
            Value::Array(vec![
                Value::string(&p.topic),
                Value::Int(p.sent_count as i32),
            ])
        })
        .collect();
    let subscribe: Vec<Value> = ctx
        .registry
        .subscriptions()
        .map(|(_, s)| {
            Value::Array(vec![
                Value::string(&s.topic),
                Value::Int(s.received_count as i32),
            ])
        })
        .collect();
    let service: Vec<Value> = ctx
        .registry
        .providers()
        .map(|(_, p)| {
            Value::Array(vec![
                Value::string(&p.service),
                Value::Int(p.served_count as i32),
            ])
        })
        .collect();
    Value::Array(vec![
        Value::Array(publish),
        Value::Array(subscribe),
        Value::Array(service),
    ])
}

// ============================================================================
// Tests
// ============================================================================
