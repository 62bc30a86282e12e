// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer data-plane state machine.
//!
//! One `Session` drives one TCP connection through handshake and data
//! phases. The same machine serves all four roles:
//!
//! ```text
//! outbound subscriber : Connecting -> WritingHeader -> ReadingHeader -> Streaming
//! inbound publisher   : ReadingHeader -> WritingHeader -> Streaming
//! outbound svc client : Connecting -> WritingHeader -> ReadingHeader -> AwaitingResponse
//!                       -> (persistent) Idle -> AwaitingResponse -> ...
//! inbound svc server  : ReadingHeader -> WritingHeader -> AwaitingRequest
//!                       -> WritingResponse -> (persistent) AwaitingRequest
//! ```
//!
//! Transitions are synchronous and non-blocking up to `WouldBlock`; the
//! engine calls [`Session::advance`] whenever the socket reports readiness
//! and the machine chains phases as far as buffered bytes allow.

use mio::net::TcpStream;
use mio::Token;

use crate::error::{Result, RosError};
use crate::node::registry::{CallerEvent, Registry};
use crate::reactor::{self, ReadOutcome, WriteOutcome};
use crate::tcpros::frame::{encode_frame_into, FrameReader};
use crate::tcpros::header::TcprosHeader;

/// Which end opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What the session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Server side of a topic: we publish to a remote subscriber.
    TopicPublisher,

    /// Client side of a topic: we subscribe to a remote publisher.
    TopicSubscriber,

    /// Server side of a service: we answer remote calls.
    ServiceServer,

    /// Client side of a service: we invoke a remote provider.
    ServiceClient,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Non-blocking connect in progress (client only).
    Connecting,

    /// Flushing our header (client hello or server reply).
    WritingHeader,

    /// Waiting for the peer's header block.
    ReadingHeader,

    /// Topic data phase.
    Streaming,

    /// Service server waiting for a request frame.
    AwaitingRequest,

    /// Service server flushing ok-byte + response frame.
    WritingResponse,

    /// Service client waiting for ok-byte + response frame.
    AwaitingResponse,

    /// Persistent service client between invocations.
    Idle,

    /// Terminal.
    Closed,
}

/// What the engine should do with the session after an advance.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Keep the session registered.
    Continue,

    /// Tear the session down; an error worth recording, if any.
    Close(Option<RosError>),
}

/// Context handed to `advance`: everything a transition may touch.
pub(crate) struct SessionCtx<'a> {
    pub registry: &'a mut Registry,
    pub node_name: &'a str,
    pub now: u64,
}

pub struct Session {
    pub id: u64,
    pub token: Token,
    pub direction: Direction,
    pub role: SessionRole,
    pub state: SessionState,

    /// Slot index of the owning publisher/subscriber/provider/caller.
    /// Inbound sessions resolve this from the header.
    pub provider_idx: usize,

    /// For subscriber sessions: the publisher's XMLRPC URI this session was
    /// opened for. Otherwise the peer address, for diagnostics.
    pub peer_uri: String,

    pub stream: TcpStream,
    reader: FrameReader,
    out: Vec<u8>,
    out_pos: usize,

    /// Service-response ok-byte read ahead of its frame.
    ok_byte: Option<u8>,

    /// Error to report once the fault header has been flushed.
    close_after_flush: Option<RosError>,

    pub persistent: bool,

    /// Peer's callerid from its header (bus introspection).
    pub caller_id: Option<String>,

    pub last_activity: u64,
    pub connect_deadline: Option<u64>,
}

impl Session {
    /// Outbound session subscribing to a remote publisher.
    pub(crate) fn outbound_subscriber(
        id: u64,
        token: Token,
        stream: TcpStream,
        sub_idx: usize,
        peer_uri: String,
        now: u64,
        connect_timeout_usec: u64,
        max_frame: usize,
    ) -> Self {
        Self {
            id,
            token,
            direction: Direction::Outbound,
            role: SessionRole::TopicSubscriber,
            state: SessionState::Connecting,
            provider_idx: sub_idx,
            peer_uri,
            stream,
            reader: FrameReader::new(max_frame),
            out: Vec::new(),
            out_pos: 0,
            ok_byte: None,
            close_after_flush: None,
            persistent: false,
            caller_id: None,
            last_activity: now,
            connect_deadline: Some(now + connect_timeout_usec),
        }
    }

    /// Outbound session invoking a remote service provider.
    pub(crate) fn outbound_service_client(
        id: u64,
        token: Token,
        stream: TcpStream,
        caller_idx: usize,
        peer_uri: String,
        persistent: bool,
        now: u64,
        connect_timeout_usec: u64,
        max_frame: usize,
    ) -> Self {
        Self {
            id,
            token,
            direction: Direction::Outbound,
            role: SessionRole::ServiceClient,
            state: SessionState::Connecting,
            provider_idx: caller_idx,
            peer_uri,
            stream,
            reader: FrameReader::new(max_frame),
            out: Vec::new(),
            out_pos: 0,
            ok_byte: None,
            close_after_flush: None,
            persistent,
            caller_id: None,
            last_activity: now,
            connect_deadline: Some(now + connect_timeout_usec),
        }
    }

    /// Inbound session; role is resolved from the peer's header.
    pub(crate) fn inbound(
        id: u64,
        token: Token,
        stream: TcpStream,
        peer_uri: String,
        now: u64,
        max_frame: usize,
    ) -> Self {
        Self {
            id,
            token,
            direction: Direction::Inbound,
            // Placeholder until the header names a topic or a service.
            role: SessionRole::TopicPublisher,
            state: SessionState::ReadingHeader,
            provider_idx: usize::MAX,
            peer_uri,
            stream,
            reader: FrameReader::new(max_frame),
            out: Vec::new(),
            out_pos: 0,
            ok_byte: None,
            close_after_flush: None,
            persistent: false,
            caller_id: None,
            last_activity: now,
            connect_deadline: None,
        }
    }

    /// Interests the engine should keep registered for this session.
    pub fn wants(&self) -> (bool, bool) {
        let read = self.state != SessionState::Connecting;
        let write = self.state == SessionState::Connecting || self.out_pos < self.out.len();
        (read, write)
    }

    /// Bytes queued but not yet handed to the kernel.
    pub fn out_pending(&self) -> usize {
        self.out.len() - self.out_pos
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Queue one topic message frame and push what the socket will take.
    pub(crate) fn queue_message(&mut self, payload: &[u8]) -> Result<()> {
        encode_frame_into(payload, &mut self.out);
        self.pump_out()
            .map(|_| ())
            .map_err(|e| RosError::from_io(e, "topic send"))
    }

    /// Queue a service request on an idle persistent session.
    pub(crate) fn queue_service_request(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(RosError::usage("service session is busy"));
        }
        encode_frame_into(payload, &mut self.out);
        self.state = SessionState::AwaitingResponse;
        self.pump_out()
            .map(|_| ())
            .map_err(|e| RosError::from_io(e, "service request send"))
    }

    /// Advance the machine as far as buffered bytes and the socket allow.
    pub(crate) fn advance(
        &mut self,
        readable: bool,
        writable: bool,
        ctx: &mut SessionCtx<'_>,
    ) -> SessionOutcome {
        match self.drive(readable, writable, ctx) {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome::Close(Some(e)),
        }
    }

    fn drive(
        &mut self,
        readable: bool,
        writable: bool,
        ctx: &mut SessionCtx<'_>,
    ) -> Result<SessionOutcome> {
        let mut eof = false;

        if readable && self.state != SessionState::Connecting {
            let mut chunk = Vec::new();
            let (_, outcome) = reactor::drain_read(&mut self.stream, &mut chunk)
                .map_err(|e| RosError::from_io(e, "session read"))?;
            self.reader.feed(&chunk);
            eof = outcome == ReadOutcome::Eof;
        }

        if self.state == SessionState::Connecting {
            if !writable {
                return Ok(SessionOutcome::Continue);
            }
            match reactor::connect_complete(&self.stream) {
                Ok(true) => {
                    self.build_client_header(ctx)?;
                    self.connect_deadline = None;
                    self.state = SessionState::WritingHeader;
                }
                Ok(false) => return Ok(SessionOutcome::Continue),
                Err(e) => {
                    return Err(RosError::from_io(e, &format!("connect to {}", self.peer_uri)))
                }
            }
        }

        loop {
            match self.state {
                SessionState::Connecting | SessionState::Closed => break,

                SessionState::WritingHeader => {
                    if !self
                        .pump_out()
                        .map_err(|e| RosError::from_io(e, "header write"))?
                    {
                        break;
                    }
                    if let Some(err) = self.close_after_flush.take() {
                        self.state = SessionState::Closed;
                        return Ok(SessionOutcome::Close(Some(err)));
                    }
                    match (self.direction, self.role) {
                        (Direction::Outbound, _) => self.state = SessionState::ReadingHeader,
                        (Direction::Inbound, SessionRole::TopicPublisher) => {
                            self.enter_publisher_streaming(ctx)?;
                            self.state = SessionState::Streaming;
                        }
                        (Direction::Inbound, _) => self.state = SessionState::AwaitingRequest,
                    }
                }

                SessionState::ReadingHeader => {
                    let Some(frame) = self.reader.next_frame()? else {
                        break;
                    };
                    self.last_activity = ctx.now;
                    match self.direction {
                        Direction::Inbound => self.handle_inbound_header(&frame, ctx)?,
                        Direction::Outbound => {
                            if let Some(outcome) = self.handle_reply_header(&frame, ctx)? {
                                return Ok(outcome);
                            }
                        }
                    }
                }

                SessionState::Streaming => {
                    if self.role == SessionRole::TopicSubscriber {
                        while let Some(frame) = self.reader.next_frame()? {
                            self.last_activity = ctx.now;
                            self.deliver_topic_frame(&frame, ctx);
                        }
                    } else {
                        self.pump_out()
                            .map_err(|e| RosError::from_io(e, "topic write"))?;
                    }
                    break;
                }

                SessionState::AwaitingRequest => {
                    let Some(frame) = self.reader.next_frame()? else {
                        break;
                    };
                    self.last_activity = ctx.now;
                    self.serve_request(&frame, ctx);
                    self.state = SessionState::WritingResponse;
                }

                SessionState::WritingResponse => {
                    if !self
                        .pump_out()
                        .map_err(|e| RosError::from_io(e, "response write"))?
                    {
                        break;
                    }
                    if self.persistent {
                        self.state = SessionState::AwaitingRequest;
                    } else {
                        // Non-persistent sessions have a zero idle budget.
                        self.state = SessionState::Closed;
                        return Ok(SessionOutcome::Close(None));
                    }
                }

                SessionState::AwaitingResponse => {
                    self.pump_out()
                        .map_err(|e| RosError::from_io(e, "request write"))?;
                    if self.ok_byte.is_none() {
                        self.ok_byte = self.reader.take_byte();
                    }
                    let Some(ok) = self.ok_byte else { break };
                    let Some(frame) = self.reader.next_frame()? else {
                        break;
                    };
                    self.ok_byte = None;
                    self.last_activity = ctx.now;

                    if ok == 1 {
                        self.deliver_caller_response(&frame, ctx);
                        if self.persistent {
                            self.state = SessionState::Idle;
                        } else {
                            self.state = SessionState::Closed;
                            return Ok(SessionOutcome::Close(None));
                        }
                    } else {
                        let err = RosError::service_failed(
                            String::from_utf8_lossy(&frame).into_owned(),
                        );
                        self.deliver_caller_failure(err, ctx);
                        // Close even when persistent: the stream position
                        // after a user error is not trustworthy.
                        self.state = SessionState::Closed;
                        return Ok(SessionOutcome::Close(None));
                    }
                }

                SessionState::Idle => break,
            }
        }

        if eof && self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            let err = if self.reader.available() > 0 || self.ok_byte.is_some() {
                Some(RosError::transport(format!(
                    "{} closed mid-frame",
                    self.peer_uri
                )))
            } else {
                None
            };
            return Ok(SessionOutcome::Close(err));
        }

        Ok(SessionOutcome::Continue)
    }

    /// Flush queued bytes; true when the buffer is fully drained.
    fn pump_out(&mut self) -> std::io::Result<bool> {
        if self.out_pos >= self.out.len() {
            self.out.clear();
            self.out_pos = 0;
            return Ok(true);
        }
        match reactor::flush_write(&mut self.stream, &self.out, &mut self.out_pos)? {
            WriteOutcome::Flushed => {
                self.out.clear();
                self.out_pos = 0;
                Ok(true)
            }
            WriteOutcome::Pending => Ok(false),
        }
    }

    fn build_client_header(&mut self, ctx: &mut SessionCtx<'_>) -> Result<()> {
        let header = match self.role {
            SessionRole::TopicSubscriber => {
                let sub = ctx.registry.subscription(self.provider_idx)?;
                TcprosHeader::new()
                    .with("callerid", ctx.node_name)
                    .with("topic", &sub.topic)
                    .with("type", &sub.msg_type)
                    .with("md5sum", &sub.md5sum)
                    .with("message_definition", &sub.definition)
                    .with("tcp_nodelay", if sub.tcp_nodelay { "1" } else { "0" })
            }
            SessionRole::ServiceClient => {
                let caller = ctx.registry.caller(self.provider_idx)?;
                let mut h = TcprosHeader::new()
                    .with("callerid", ctx.node_name)
                    .with("service", &caller.service)
                    .with("md5sum", &caller.md5sum);
                if caller.persistent {
                    h.push("persistent", "1");
                }
                h
            }
            _ => return Err(RosError::usage("inbound session cannot send a hello")),
        };
        self.out = header.encode();
        self.out_pos = 0;
        Ok(())
    }

    /// Inbound hello: resolve role and provider, validate, queue the reply.
    fn handle_inbound_header(&mut self, frame: &[u8], ctx: &mut SessionCtx<'_>) -> Result<()> {
        let header = match TcprosHeader::parse(frame) {
            Ok(h) => h,
            Err(e) => {
                self.queue_fault(e);
                return Ok(());
            }
        };
        self.caller_id = header.get("callerid").map(str::to_string);

        if let Some(topic) = header.get("topic") {
            let Some((idx, _)) = ctx.registry.find_publication(topic) else {
                self.queue_fault(RosError::protocol_header(format!(
                    "topic {} is not published by this node",
                    topic
                )));
                return Ok(());
            };
            self.role = SessionRole::TopicPublisher;
            self.provider_idx = idx;

            let publication = ctx.registry.publication(idx)?;
            if let Err(e) = header.validate(&publication.md5sum, &publication.msg_type, true) {
                self.queue_fault(e);
                return Ok(());
            }
            if header.get("tcp_nodelay") == Some("1") {
                let _ = self.stream.set_nodelay(true);
            }

            let reply = TcprosHeader::new()
                .with("callerid", ctx.node_name)
                .with("type", &publication.msg_type)
                .with("md5sum", &publication.md5sum)
                .with("message_definition", &publication.definition)
                .with("latching", if publication.latching { "1" } else { "0" });
            self.out = reply.encode();
            self.out_pos = 0;
            self.state = SessionState::WritingHeader;
            return Ok(());
        }

        if let Some(service) = header.get("service") {
            let Some((idx, _)) = ctx.registry.find_provider(service) else {
                self.queue_fault(RosError::protocol_header(format!(
                    "service {} is not provided by this node",
                    service
                )));
                return Ok(());
            };
            self.role = SessionRole::ServiceServer;
            self.provider_idx = idx;
            self.persistent = header.get("persistent") == Some("1");

            let provider = ctx.registry.provider(idx)?;
            if let Err(e) = header.validate(&provider.md5sum, &provider.srv_type, true) {
                self.queue_fault(e);
                return Ok(());
            }

            let reply = TcprosHeader::new()
                .with("callerid", ctx.node_name)
                .with("type", &provider.srv_type)
                .with("md5sum", &provider.md5sum)
                .with("request_type", &provider.request_type)
                .with("response_type", &provider.response_type);
            self.out = reply.encode();
            self.out_pos = 0;
            self.state = SessionState::WritingHeader;
            return Ok(());
        }

        self.queue_fault(RosError::protocol_header(
            "header names neither topic nor service",
        ));
        Ok(())
    }

    /// Outbound: the peer's reply header arrived.
    fn handle_reply_header(
        &mut self,
        frame: &[u8],
        ctx: &mut SessionCtx<'_>,
    ) -> Result<Option<SessionOutcome>> {
        let header = TcprosHeader::parse(frame)?;
        if let Some(msg) = header.get("error") {
            return Err(RosError::protocol_header(format!(
                "{} refused handshake: {}",
                self.peer_uri, msg
            )));
        }

        match self.role {
            SessionRole::TopicSubscriber => {
                let sub = ctx.registry.subscription(self.provider_idx)?;
                header.validate(&sub.md5sum, &sub.msg_type, true)?;
                self.state = SessionState::Streaming;
                Ok(None)
            }
            SessionRole::ServiceClient => {
                let caller = ctx.registry.caller(self.provider_idx)?;
                header.validate(&caller.md5sum, &caller.srv_type, true)?;
                self.queue_pending_request(ctx)?;
                Ok(None)
            }
            _ => Err(RosError::usage("reply header on an inbound session")),
        }
    }

    /// Move the caller's pending request (or ask the callback for one) onto
    /// the wire and start waiting for the response.
    fn queue_pending_request(&mut self, ctx: &mut SessionCtx<'_>) -> Result<()> {
        let pending = ctx
            .registry
            .caller_mut(self.provider_idx)?
            .pending_request
            .take();
        let request = match pending {
            Some(r) => r,
            None => {
                let mut buf = Vec::new();
                let cb = ctx.registry.caller_mut(self.provider_idx)?.callback.take();
                if let Some(mut cb) = cb {
                    cb(CallerEvent::BuildRequest(&mut buf));
                    if let Ok(c) = ctx.registry.caller_mut(self.provider_idx) {
                        c.callback = Some(cb);
                    }
                }
                buf
            }
        };
        encode_frame_into(&request, &mut self.out);
        self.state = SessionState::AwaitingResponse;
        Ok(())
    }

    fn queue_fault(&mut self, err: RosError) {
        log::warn!("[tcpros] {}: {}", self.peer_uri, err);
        self.out = TcprosHeader::fault(err.detail()).encode();
        self.out_pos = 0;
        self.close_after_flush = Some(err);
        self.state = SessionState::WritingHeader;
    }

    fn enter_publisher_streaming(&mut self, ctx: &mut SessionCtx<'_>) -> Result<()> {
        let id = self.id;
        let publication = ctx.registry.publication_mut(self.provider_idx)?;
        if !publication.sessions.contains(&id) {
            publication.sessions.push(id);
        }
        // Latched topics replay the last payload to late joiners.
        if publication.latching {
            if let Some(payload) = publication.last_payload.clone() {
                encode_frame_into(&payload, &mut self.out);
            }
        }
        Ok(())
    }

    fn deliver_topic_frame(&mut self, frame: &[u8], ctx: &mut SessionCtx<'_>) {
        if let Ok(sub) = ctx.registry.subscription_mut(self.provider_idx) {
            sub.received_count += 1;
        }
        let cb = ctx
            .registry
            .subscription_mut(self.provider_idx)
            .ok()
            .and_then(|s| s.on_message.take());
        if let Some(mut cb) = cb {
            cb(frame);
            if let Ok(s) = ctx.registry.subscription_mut(self.provider_idx) {
                s.on_message = Some(cb);
            }
        }
    }

    fn serve_request(&mut self, frame: &[u8], ctx: &mut SessionCtx<'_>) {
        let handler = ctx
            .registry
            .provider_mut(self.provider_idx)
            .ok()
            .and_then(|p| p.handler.take());
        let result = match handler {
            Some(mut h) => {
                let r = h(frame);
                if let Ok(p) = ctx.registry.provider_mut(self.provider_idx) {
                    p.handler = Some(h);
                    p.served_count += 1;
                }
                r
            }
            None => Err("service handler unavailable".to_string()),
        };
        match result {
            Ok(response) => {
                self.out.push(1);
                encode_frame_into(&response, &mut self.out);
            }
            Err(msg) => {
                self.out.push(0);
                encode_frame_into(msg.as_bytes(), &mut self.out);
            }
        }
    }

    fn deliver_caller_response(&mut self, frame: &[u8], ctx: &mut SessionCtx<'_>) {
        let Ok(caller) = ctx.registry.caller_mut(self.provider_idx) else {
            return;
        };
        if caller.sync_waiting {
            caller.sync_result = Some(Ok(frame.to_vec()));
            return;
        }
        let cb = caller.callback.take();
        if let Some(mut cb) = cb {
            cb(CallerEvent::Response(frame));
            if let Ok(c) = ctx.registry.caller_mut(self.provider_idx) {
                c.callback = Some(cb);
            }
        }
    }

    fn deliver_caller_failure(&mut self, err: RosError, ctx: &mut SessionCtx<'_>) {
        let Ok(caller) = ctx.registry.caller_mut(self.provider_idx) else {
            return;
        };
        if caller.sync_waiting {
            caller.sync_result = Some(Err(err));
            return;
        }
        let cb = caller.callback.take();
        if let Some(mut cb) = cb {
            cb(CallerEvent::Failed(&err));
            if let Ok(c) = ctx.registry.caller_mut(self.provider_idx) {
                c.callback = Some(cb);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::registry::{Publication, ServiceProvider, Subscription};
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::time::Duration;

    const MAX: usize = 1024 * 1024;

    /// Accepted mio stream + the std peer driving the other end.
    fn socket_pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = StdStream::connect(addr).unwrap();
        let (ours, _) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        (TcpStream::from_std(ours), peer)
    }

    fn pump(session: &mut Session, reg: &mut Registry) -> Option<SessionOutcome> {
        let mut ctx = SessionCtx {
            registry: reg,
            node_name: "/unit",
            now: 1,
        };
        for _ in 0..50 {
            match session.advance(true, true, &mut ctx) {
                SessionOutcome::Continue => std::thread::sleep(Duration::from_millis(2)),
                out @ SessionOutcome::Close(_) => return Some(out),
            }
            if session.state == SessionState::Streaming
                || session.state == SessionState::AwaitingRequest
            {
                return None;
            }
        }
        None
    }

    fn read_header_block(peer: &mut StdStream) -> TcprosHeader {
        let mut len = [0u8; 4];
        peer.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        peer.read_exact(&mut body).unwrap();
        TcprosHeader::parse(&body).unwrap()
    }

    fn sub_hello(md5: &str) -> Vec<u8> {
        TcprosHeader::new()
            .with("callerid", "/remote_listener")
            .with("topic", "/chatter")
            .with("type", "std_msgs/String")
            .with("md5sum", md5)
            .with("message_definition", "string data\n")
            .encode()
    }

    #[test]
    fn test_inbound_publisher_handshake_and_stream() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        let idx = reg
            .add_publication(Publication::new("/chatter", "std_msgs/String", "abcd", ""))
            .unwrap();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&sub_hello("abcd")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        pump(&mut session, &mut reg);
        assert_eq!(session.state, SessionState::Streaming);
        assert_eq!(session.role, SessionRole::TopicPublisher);
        assert_eq!(session.provider_idx, idx);
        assert!(reg.publication(idx).unwrap().sessions.contains(&1));

        let reply = read_header_block(&mut peer);
        assert_eq!(reply.get("md5sum"), Some("abcd"));
        assert_eq!(reply.get("callerid"), Some("/unit"));
        assert_eq!(reply.get("latching"), Some("0"));

        // Stream one message to the subscriber.
        session.queue_message(b"hello world").unwrap();
        let mut ctx = SessionCtx {
            registry: &mut reg,
            node_name: "/unit",
            now: 2,
        };
        let _ = session.advance(false, true, &mut ctx);

        let mut len = [0u8; 4];
        peer.read_exact(&mut len).unwrap();
        assert_eq!(u32::from_le_bytes(len), 11);
        let mut body = vec![0u8; 11];
        peer.read_exact(&mut body).unwrap();
        assert_eq!(&body, b"hello world");
    }

    #[test]
    fn test_inbound_md5_mismatch_faults() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        reg.add_publication(Publication::new("/chatter", "std_msgs/String", "aaaa", ""))
            .unwrap();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&sub_hello("bbbb")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let outcome = pump(&mut session, &mut reg);
        let Some(SessionOutcome::Close(Some(err))) = outcome else {
            panic!("expected close with error, got {:?}", outcome);
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolHeader);
        assert!(err.detail().contains("aaaa") && err.detail().contains("bbbb"));

        // The peer got a fault header naming both digests.
        let fault = read_header_block(&mut peer);
        let msg = fault.get("error").unwrap();
        assert!(msg.contains("aaaa") && msg.contains("bbbb"));
    }

    #[test]
    fn test_inbound_wildcard_md5_accepted() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        reg.add_publication(Publication::new("/chatter", "std_msgs/String", "aaaa", ""))
            .unwrap();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&sub_hello("*")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        pump(&mut session, &mut reg);
        assert_eq!(session.state, SessionState::Streaming);
    }

    #[test]
    fn test_inbound_unknown_topic_faults() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&sub_hello("aaaa")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let outcome = pump(&mut session, &mut reg);
        assert!(matches!(outcome, Some(SessionOutcome::Close(Some(_)))));
        let fault = read_header_block(&mut peer);
        assert!(fault.get("error").unwrap().contains("not published"));
    }

    #[test]
    fn test_service_server_round_trip() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        reg.add_provider(ServiceProvider {
            service: "/sum".into(),
            srv_type: "roscpp_tutorials/TwoInts".into(),
            md5sum: "feed".into(),
            request_type: "roscpp_tutorials/TwoIntsRequest".into(),
            response_type: "roscpp_tutorials/TwoIntsResponse".into(),
            handler: Some(Box::new(|req| {
                assert_eq!(req, b"\x03\x04");
                Ok(b"\x07".to_vec())
            })),
            served_count: 0,
        })
        .unwrap();

        let hello = TcprosHeader::new()
            .with("callerid", "/remote_caller")
            .with("service", "/sum")
            .with("md5sum", "feed")
            .with("persistent", "1")
            .encode();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&hello).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pump(&mut session, &mut reg);
        assert_eq!(session.state, SessionState::AwaitingRequest);
        assert_eq!(session.role, SessionRole::ServiceServer);
        assert!(session.persistent);

        let reply = read_header_block(&mut peer);
        assert_eq!(reply.get("request_type"), Some("roscpp_tutorials/TwoIntsRequest"));

        // Send a request frame; expect ok-byte 1 + response frame.
        let mut wire = Vec::new();
        encode_frame_into(b"\x03\x04", &mut wire);
        peer.write_all(&wire).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut ctx = SessionCtx {
            registry: &mut reg,
            node_name: "/unit",
            now: 3,
        };
        let _ = session.advance(true, true, &mut ctx);
        // Persistent: stays open awaiting the next request.
        assert_eq!(session.state, SessionState::AwaitingRequest);

        let mut ok = [0u8; 1];
        peer.read_exact(&mut ok).unwrap();
        assert_eq!(ok[0], 1);
        let mut len = [0u8; 4];
        peer.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        peer.read_exact(&mut body).unwrap();
        assert_eq!(&body, b"\x07");
    }

    #[test]
    fn test_service_server_user_error_closes_when_not_persistent() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        reg.add_provider(ServiceProvider {
            service: "/sum".into(),
            srv_type: "roscpp_tutorials/TwoInts".into(),
            md5sum: "feed".into(),
            request_type: "r".into(),
            response_type: "s".into(),
            handler: Some(Box::new(|_| Err("overflow".to_string()))),
            served_count: 0,
        })
        .unwrap();

        let hello = TcprosHeader::new()
            .with("callerid", "/remote_caller")
            .with("service", "/sum")
            .with("md5sum", "feed")
            .encode();

        let mut session = Session::inbound(1, Token(9), ours, "peer".into(), 0, MAX);
        peer.write_all(&hello).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pump(&mut session, &mut reg);
        let _ = read_header_block(&mut peer);

        let mut wire = Vec::new();
        encode_frame_into(b"req", &mut wire);
        peer.write_all(&wire).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut ctx = SessionCtx {
            registry: &mut reg,
            node_name: "/unit",
            now: 3,
        };
        let outcome = session.advance(true, true, &mut ctx);
        assert!(matches!(outcome, SessionOutcome::Close(None)));

        let mut ok = [0u8; 1];
        peer.read_exact(&mut ok).unwrap();
        assert_eq!(ok[0], 0);
        let mut len = [0u8; 4];
        peer.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        peer.read_exact(&mut body).unwrap();
        assert_eq!(&body, b"overflow");
    }

    #[test]
    fn test_subscriber_peer_close_mid_frame_is_transport_error() {
        let (ours, mut peer) = socket_pair();
        let mut reg = Registry::new();
        let idx = reg
            .add_subscription(Subscription::new(
                "/chatter",
                "std_msgs/String",
                "aaaa",
                "",
                Box::new(|_| panic!("callback must not fire")),
                false,
            ))
            .unwrap();

        let (mut session, _) = {
            let mut s = Session::outbound_subscriber(
                1,
                Token(9),
                ours,
                idx,
                "http://h:1/".into(),
                0,
                5_000_000,
                MAX,
            );
            // Skip handshake plumbing; exercise the streaming error path.
            s.state = SessionState::Streaming;
            (s, ())
        };

        // Half a frame, then close.
        peer.write_all(&20u32.to_le_bytes()).unwrap();
        peer.write_all(b"short").unwrap();
        drop(peer);
        std::thread::sleep(Duration::from_millis(20));

        let mut ctx = SessionCtx {
            registry: &mut reg,
            node_name: "/unit",
            now: 3,
        };
        let outcome = session.advance(true, true, &mut ctx);
        let SessionOutcome::Close(Some(err)) = outcome else {
            panic!("expected transport error");
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
