// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound RPC client flows.
//!
//! One [`RpcFlow`] drives one call through its conversational lifecycle:
//!
//! ```text
//! Connecting -> WritingRequest -> ReadingResponse -> Done/Failed
//! ```
//!
//! The [`Dispatcher`] owns the in-flight flows and enforces the policy of
//! at most one flow per target endpoint; everything else for a busy
//! endpoint stays queued in arrival order.

use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;

use mio::net::TcpStream;
use mio::Token;

use crate::api::call::ApiCall;
use crate::error::{Result, RosError};
use crate::reactor::{self, ReadOutcome, WriteOutcome};
use crate::xmlrpc::{self, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcFlowState {
    Connecting,
    WritingRequest,
    ReadingResponse,
}

/// Result of advancing a flow.
pub(crate) enum FlowStatus {
    Pending,
    Done(Vec<Value>),
    Failed(RosError),
}

pub(crate) struct RpcFlow {
    pub call: ApiCall,
    pub token: Token,
    pub stream: TcpStream,

    /// Whole-conversation deadline (absolute, µs).
    pub deadline: u64,

    state: RpcFlowState,
    out: Vec<u8>,
    out_pos: usize,
    inbuf: Vec<u8>,
}

impl RpcFlow {
    /// Resolve the target and start the non-blocking connect.
    ///
    /// On failure the call record is handed back so its callback can still
    /// fire exactly once.
    pub(crate) fn start(
        call: ApiCall,
        token: Token,
        now: u64,
        rpc_timeout_usec: u64,
    ) -> std::result::Result<Self, (ApiCall, RosError)> {
        let addr = match (call.host.as_str(), call.port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(a) => a,
                None => {
                    let e =
                        RosError::transport(format!("no address for {}:{}", call.host, call.port));
                    return Err((call, e));
                }
            },
            Err(e) => {
                let e = RosError::from_io(e, &format!("resolve {}:{}", call.host, call.port));
                return Err((call, e));
            }
        };

        let stream = match reactor::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                let e = RosError::from_io(e, &format!("connect {}:{}", call.host, call.port));
                return Err((call, e));
            }
        };

        let out = xmlrpc::encode_request(call.method.as_str(), &call.params, &call.host, call.port);

        Ok(Self {
            call,
            token,
            stream,
            deadline: now + rpc_timeout_usec,
            state: RpcFlowState::Connecting,
            out,
            out_pos: 0,
            inbuf: Vec::new(),
        })
    }

    /// Drive the conversation one non-blocking step.
    pub(crate) fn advance(&mut self, readable: bool, writable: bool) -> FlowStatus {
        match self.drive(readable, writable) {
            Ok(status) => status,
            Err(e) => FlowStatus::Failed(e),
        }
    }

    fn drive(&mut self, readable: bool, writable: bool) -> Result<FlowStatus> {
        if self.state == RpcFlowState::Connecting {
            if !writable {
                return Ok(FlowStatus::Pending);
            }
            match reactor::connect_complete(&self.stream) {
                Ok(true) => self.state = RpcFlowState::WritingRequest,
                Ok(false) => return Ok(FlowStatus::Pending),
                Err(e) => {
                    return Err(RosError::from_io(
                        e,
                        &format!("connect {}:{}", self.call.host, self.call.port),
                    ))
                }
            }
        }

        if self.state == RpcFlowState::WritingRequest {
            match reactor::flush_write(&mut self.stream, &self.out, &mut self.out_pos)
                .map_err(|e| RosError::from_io(e, "rpc request write"))?
            {
                WriteOutcome::Flushed => self.state = RpcFlowState::ReadingResponse,
                WriteOutcome::Pending => return Ok(FlowStatus::Pending),
            }
        }

        // ReadingResponse
        if !readable {
            return Ok(FlowStatus::Pending);
        }
        let (_, outcome) = reactor::drain_read(&mut self.stream, &mut self.inbuf)
            .map_err(|e| RosError::from_io(e, "rpc response read"))?;

        if let Some(msg) = xmlrpc::try_split_http(&self.inbuf)? {
            if !xmlrpc::response_status_ok(&msg.head) {
                return Err(RosError::xmlrpc(format!(
                    "{} answered non-200: {:?}",
                    self.call.host,
                    msg.head.lines().next().unwrap_or("")
                )));
            }
            let body = String::from_utf8_lossy(&msg.body);
            let params = xmlrpc::decode_response(&body)?;
            return Ok(FlowStatus::Done(params));
        }

        if outcome == ReadOutcome::Eof {
            return Err(RosError::xmlrpc("truncated body: peer closed early")
                .with_cause(RosError::transport(format!(
                    "{}:{} closed the control connection",
                    self.call.host, self.call.port
                ))));
        }
        Ok(FlowStatus::Pending)
    }
}

/// In-flight flow table, keyed by poll token.
#[derive(Default)]
pub(crate) struct Dispatcher {
    flows: HashMap<Token, RpcFlow>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints that already have a call in flight.
    pub fn busy_endpoints(&self) -> HashSet<(String, u16)> {
        self.flows.values().map(|f| f.call.endpoint()).collect()
    }

    pub fn insert(&mut self, flow: RpcFlow) {
        self.flows.insert(flow.token, flow);
    }

    pub fn remove(&mut self, token: Token) -> Option<RpcFlow> {
        self.flows.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.flows.contains_key(&token)
    }

    /// Tokens of flows whose deadline has passed.
    pub fn expired(&self, now: u64) -> Vec<Token> {
        self.flows
            .values()
            .filter(|f| f.deadline <= now)
            .map(|f| f.token)
            .collect()
    }

    /// Earliest flow deadline, for the poll-timeout computation.
    pub fn next_deadline(&self) -> Option<u64> {
        self.flows.values().map(|f| f.deadline).min()
    }

    pub fn drain(&mut self) -> Vec<RpcFlow> {
        self.flows.drain().map(|(_, f)| f).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
