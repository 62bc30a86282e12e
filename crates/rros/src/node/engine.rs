// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The event engine.
//!
//! One cooperative loop drives everything the node owns:
//!
//! ```text
//! turn():
//!   drain deferred commands
//!   dispatch queued RPCs (one in flight per endpoint)
//!   poll(min(next timer, next flow/session deadline, caller budget))
//!   route readiness -> listener accepts | rpc flows | slave conns | sessions
//!   fire due timers (publish ticks, caller ticks, master ping)
//!   expire overdue connects and silent clients
//! ```
//!
//! Each ready socket's state machine advances as far as buffered bytes
//! allow within the same iteration; the only suspension point is the poll.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::Token;

use crate::api::call::{self, ApiCall, ApiMethod, Continuation};
use crate::api::dispatcher::{FlowStatus, RpcFlow};
use crate::api::server::{self, ServerConn, ServerConnStatus, SlaveAction, SlaveCtx};
use crate::clock::{now_usec, TimerKey};
use crate::config::TCPROS_PROTOCOL;
use crate::error::{Result, RosError};
use crate::node::registry::CallerEvent;
use crate::node::{Message, Node, NodeCommand};
use crate::reactor::{self, Ready};
use crate::tcpros::{Session, SessionCtx, SessionOutcome, SessionRole, SessionState};
use crate::xmlrpc::Value;

/// Upper bound on one poll so the exit flag is sampled promptly.
const MAX_POLL_WAIT_USEC: u64 = 100_000;

fn resolve_endpoint(host: &str, port: u16) -> Option<SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port).to_socket_addrs().ok()?.next()
}

impl Node {
    // ==================================================================
    // Public entry points
    // ==================================================================

    /// Run the engine until the exit flag is set (graceful shutdown) or the
    /// timeout elapses (engine stays restartable). `None` runs forever.
    pub fn run(&mut self, timeout_ms: Option<u64>, exit_flag: &AtomicBool) -> Result<()> {
        self.ensure_live()?;
        let deadline = timeout_ms.map(|ms| now_usec() + ms.saturating_mul(1000));
        loop {
            if exit_flag.load(Ordering::Relaxed) || self.exit_requested {
                return self.shutdown();
            }
            let now = now_usec();
            if let Some(dl) = deadline {
                if now >= dl {
                    return Ok(());
                }
            }
            let mut budget = MAX_POLL_WAIT_USEC;
            if let Some(dl) = deadline {
                budget = budget.min(dl - now);
            }
            self.turn(budget)?;
        }
    }

    /// Graceful shutdown: stop accepting, flush unregister RPCs within the
    /// configured budget, cancel what is left, close every socket.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        log::info!("[node] {} shutting down", self.config.name);
        self.exit_requested = false;

        let _ = self.reactor.deregister(&mut self.xmlrpc_listener);
        let _ = self.reactor.deregister(&mut self.tcpros_listener);

        let caller_api = self.xmlrpc_uri();
        let service_api = self.service_uri();
        let master_host = self.config.master_host.clone();
        let master_port = self.config.master_port;
        let name = self.config.name.clone();

        let pub_topics: Vec<String> = self
            .registry
            .publications()
            .map(|(_, p)| p.topic.clone())
            .collect();
        let sub_topics: Vec<String> = self
            .registry
            .subscriptions()
            .map(|(_, s)| s.topic.clone())
            .collect();
        let services: Vec<String> = self
            .registry
            .providers()
            .map(|(_, p)| p.service.clone())
            .collect();

        for topic in pub_topics {
            self.queue.enqueue(ApiCall::new(
                ApiMethod::UnregisterPublisher,
                vec![
                    Value::string(&name),
                    Value::Str(topic),
                    Value::string(&caller_api),
                ],
                &master_host,
                master_port,
            ));
        }
        for topic in sub_topics {
            self.queue.enqueue(ApiCall::new(
                ApiMethod::UnregisterSubscriber,
                vec![
                    Value::string(&name),
                    Value::Str(topic),
                    Value::string(&caller_api),
                ],
                &master_host,
                master_port,
            ));
        }
        for service in services {
            self.queue.enqueue(ApiCall::new(
                ApiMethod::UnregisterService,
                vec![
                    Value::string(&name),
                    Value::Str(service),
                    Value::string(&service_api),
                ],
                &master_host,
                master_port,
            ));
        }

        let deadline = now_usec() + self.config.shutdown_timeout.as_micros() as u64;
        while (!self.queue.is_empty() || !self.dispatcher.is_empty()) && now_usec() < deadline {
            if self.turn(20_000).is_err() {
                break;
            }
        }

        // Abandon whatever did not make it; callback-once still holds.
        for call in self.queue.drain() {
            log::debug!("[node] cancelling {} #{}", call.method, call.id);
            self.complete_call(call, None);
        }
        for mut flow in self.dispatcher.drain() {
            let _ = self.reactor.deregister(&mut flow.stream);
            log::debug!("[node] cancelling in-flight {} #{}", flow.call.method, flow.call.id);
            self.complete_call(flow.call, None);
        }

        // Callers still blocked in a synchronous invocation get Cancelled
        // before their sessions disappear under them.
        let waiting: Vec<usize> = self
            .registry
            .callers()
            .filter(|(_, c)| c.sync_waiting && c.sync_result.is_none())
            .map(|(i, _)| i)
            .collect();
        for idx in waiting {
            self.fail_caller(idx, RosError::cancelled("node shutting down"));
        }

        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id, None);
        }
        let tokens: Vec<Token> = self.server_conns.keys().copied().collect();
        for token in tokens {
            if let Some(mut conn) = self.server_conns.remove(&token) {
                let _ = self.reactor.deregister(&mut conn.stream);
            }
        }

        self.destroyed = true;
        Ok(())
    }

    /// Broadcast one message to all connected subscribers of a publication
    /// and spin the engine until the frames are handed to the kernel or the
    /// timeout elapses.
    pub fn send_topic_message(
        &mut self,
        pub_idx: usize,
        msg: &Message,
        timeout_ms: u64,
    ) -> Result<()> {
        self.ensure_live()?;
        self.registry.publication(pub_idx)?;
        self.broadcast_topic(pub_idx, msg.bytes.clone());

        let deadline = now_usec() + timeout_ms.saturating_mul(1000);
        loop {
            let pending = match self.registry.publication(pub_idx) {
                Ok(p) => p.sessions.iter().any(|sid| {
                    self.sessions
                        .get(sid)
                        .map(|s| s.out_pending() > 0)
                        .unwrap_or(false)
                }),
                Err(_) => false,
            };
            if !pending {
                return Ok(());
            }
            let now = now_usec();
            if now >= deadline {
                return Err(RosError::timeout("topic send did not drain in time"));
            }
            self.turn((deadline - now).min(MAX_POLL_WAIT_USEC))?;
        }
    }

    /// Invoke a remote service synchronously through a caller slot.
    pub fn call_service(
        &mut self,
        caller_idx: usize,
        request: &[u8],
        timeout_ms: u64,
    ) -> Result<Vec<u8>> {
        self.ensure_live()?;
        {
            let caller = self.registry.caller_mut(caller_idx)?;
            if caller.sync_waiting {
                return Err(RosError::usage("service call already in progress"));
            }
            caller.sync_waiting = true;
            caller.sync_result = None;
            caller.pending_request = Some(request.to_vec());
        }
        self.kick_caller(caller_idx);

        let deadline = now_usec() + timeout_ms.saturating_mul(1000);
        loop {
            match self.registry.caller_mut(caller_idx) {
                Ok(caller) => {
                    if let Some(result) = caller.sync_result.take() {
                        caller.sync_waiting = false;
                        return result;
                    }
                }
                Err(_) => {
                    return Err(RosError::usage("service caller unregistered during call"));
                }
            }
            let now = now_usec();
            if now >= deadline {
                if let Ok(caller) = self.registry.caller_mut(caller_idx) {
                    caller.sync_waiting = false;
                    caller.pending_request = None;
                }
                return Err(RosError::timeout(format!(
                    "service call timed out after {} ms",
                    timeout_ms
                )));
            }
            self.turn((deadline - now).min(MAX_POLL_WAIT_USEC))?;
        }
    }

    // ==================================================================
    // One loop iteration
    // ==================================================================

    pub(crate) fn turn(&mut self, max_wait_usec: u64) -> Result<()> {
        self.drain_commands();
        self.dispatch_pending_calls();

        let now = now_usec();
        let mut wait = max_wait_usec;
        if let Some(deadline) = self.next_deadline() {
            wait = wait.min(deadline.saturating_sub(now));
        }

        let events = self
            .reactor
            .wait(Some(wait))
            .map_err(|e| RosError::from_io(e, "poll"))?;
        for ev in events {
            self.handle_event(ev);
        }

        let now = now_usec();
        self.fire_timers(now);
        self.check_expirations(now);
        Ok(())
    }

    fn next_deadline(&self) -> Option<u64> {
        let candidates = [
            self.wheel.earliest_deadline(),
            self.dispatcher.next_deadline(),
            self.sessions.values().filter_map(|s| s.connect_deadline).min(),
            self.server_conns.values().map(|c| c.deadline).min(),
        ];
        candidates.into_iter().flatten().min()
    }

    fn drain_commands(&mut self) {
        loop {
            let cmd = self.commands.borrow_mut().pop_front();
            let Some(cmd) = cmd else { break };
            let result = match cmd {
                NodeCommand::Shutdown => {
                    self.exit_requested = true;
                    Ok(())
                }
                NodeCommand::UnregisterPublisher(i) => self.unregister_publisher(i),
                NodeCommand::UnregisterSubscriber(i) => self.unregister_subscriber(i),
                NodeCommand::UnregisterServiceProvider(i) => self.unregister_service_provider(i),
                NodeCommand::UnregisterServiceCaller(i) => self.unregister_service_caller(i),
            };
            if let Err(e) = result {
                log::warn!("[node] deferred command failed: {}", e);
            }
        }
    }

    fn handle_event(&mut self, ev: Ready) {
        if ev.token == self.xmlrpc_listener_token {
            self.accept_xmlrpc();
            return;
        }
        if ev.token == self.tcpros_listener_token {
            self.accept_tcpros();
            return;
        }
        if self.dispatcher.contains(ev.token) {
            self.advance_rpc_flow(ev.token, ev.readable, ev.writable);
            return;
        }
        if self.server_conns.contains_key(&ev.token) {
            self.advance_server_conn(ev.token, ev.readable, ev.writable);
            return;
        }
        if let Some(&sid) = self.session_tokens.get(&ev.token) {
            self.advance_session(sid, ev.readable, ev.writable);
        }
    }

    fn fire_timers(&mut self, now: u64) {
        for key in self.wheel.pop_due(now) {
            match key {
                TimerKey::PublishTick(idx) => self.tick_publisher(idx),
                TimerKey::CallerTick(idx) => self.kick_caller(idx),
                TimerKey::MasterPing => self.enqueue_ping(),
                TimerKey::SessionDeadline(_) | TimerKey::RpcDeadline(_) => {}
            }
        }
    }

    fn check_expirations(&mut self, now: u64) {
        for token in self.dispatcher.expired(now) {
            if let Some(mut flow) = self.dispatcher.remove(token) {
                let _ = self.reactor.deregister(&mut flow.stream);
                let e = RosError::timeout(format!(
                    "{} to {}:{} timed out",
                    flow.call.method, flow.call.host, flow.call.port
                ));
                log::warn!("[rpc] {}", e);
                self.last_error = Some(e);
                self.complete_call(flow.call, None);
            }
        }

        let stalled: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| s.connect_deadline.map_or(false, |d| d <= now))
            .map(|s| s.id)
            .collect();
        for id in stalled {
            self.close_session(id, Some(RosError::timeout("connect deadline elapsed")));
        }

        let dead: Vec<Token> = self
            .server_conns
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.server_conns.remove(&token) {
                let _ = self.reactor.deregister(&mut conn.stream);
                log::debug!("[slave] dropping silent client");
            }
        }
    }

    // ==================================================================
    // Accept paths
    // ==================================================================

    fn accept_xmlrpc(&mut self) {
        loop {
            match self.xmlrpc_listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = self.reactor.next_token();
                    if self.reactor.register(&mut stream, token, true, true).is_err() {
                        continue;
                    }
                    let deadline = now_usec() + self.config.rpc_timeout.as_micros() as u64;
                    self.server_conns
                        .insert(token, ServerConn::new(token, stream, deadline));
                    log::debug!("[slave] accepted {}", addr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[slave] accept: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_tcpros(&mut self) {
        loop {
            match self.tcpros_listener.accept() {
                Ok((mut stream, addr)) => {
                    let keepalive = self
                        .config
                        .keepalive
                        .then(|| self.config.keepalive_interval);
                    if let Err(e) =
                        reactor::configure_stream(&stream, self.config.nodelay, keepalive)
                    {
                        log::debug!("[tcpros] socket options: {}", e);
                    }
                    let token = self.reactor.next_token();
                    if self.reactor.register(&mut stream, token, true, true).is_err() {
                        continue;
                    }
                    let id = self.next_session_id;
                    self.next_session_id += 1;
                    let session = Session::inbound(
                        id,
                        token,
                        stream,
                        addr.to_string(),
                        now_usec(),
                        self.config.max_frame_size,
                    );
                    self.sessions.insert(id, session);
                    self.session_tokens.insert(token, id);
                    log::debug!("[tcpros] accepted {} as session {}", addr, id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[tcpros] accept: {}", e);
                    break;
                }
            }
        }
    }

    // ==================================================================
    // Control plane: outbound flows
    // ==================================================================

    fn dispatch_pending_calls(&mut self) {
        loop {
            let busy = self.dispatcher.busy_endpoints();
            let Some(queued) = self.queue.take_dispatchable(&busy) else {
                break;
            };
            let token = self.reactor.next_token();
            let rpc_timeout = self.config.rpc_timeout.as_micros() as u64;
            match RpcFlow::start(queued, token, now_usec(), rpc_timeout) {
                Ok(mut flow) => {
                    if let Err(e) = self.reactor.register(&mut flow.stream, token, true, true) {
                        let err = RosError::from_io(e, "register rpc socket");
                        log::warn!("[rpc] {}", err);
                        self.last_error = Some(err);
                        self.complete_call(flow.call, None);
                        continue;
                    }
                    log::debug!(
                        "[rpc] {} #{} -> {}:{}",
                        flow.call.method,
                        flow.call.id,
                        flow.call.host,
                        flow.call.port
                    );
                    self.dispatcher.insert(flow);
                }
                Err((failed, e)) => {
                    log::warn!("[rpc] {} #{} failed to start: {}", failed.method, failed.id, e);
                    self.last_error = Some(e);
                    self.complete_call(failed, None);
                }
            }
        }
    }

    fn advance_rpc_flow(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(mut flow) = self.dispatcher.remove(token) else {
            return;
        };
        match flow.advance(readable, writable) {
            FlowStatus::Pending => {
                self.dispatcher.insert(flow);
            }
            FlowStatus::Done(params) => {
                let _ = self.reactor.deregister(&mut flow.stream);
                log::debug!("[rpc] {} #{} completed", flow.call.method, flow.call.id);
                self.complete_call(flow.call, Some(params));
                self.dispatch_pending_calls();
            }
            FlowStatus::Failed(e) => {
                let _ = self.reactor.deregister(&mut flow.stream);
                log::warn!("[rpc] {} #{} failed: {}", flow.call.method, flow.call.id, e);
                self.last_error = Some(e);
                self.complete_call(flow.call, None);
                self.dispatch_pending_calls();
            }
        }
    }

    /// Run the continuation, then the user callback - each exactly once.
    pub(crate) fn complete_call(&mut self, mut completed: ApiCall, result: Option<Vec<Value>>) {
        let continuation = std::mem::replace(&mut completed.continuation, Continuation::None);
        self.run_continuation(continuation, result.as_deref());
        if let Some(mut cb) = completed.on_result.take() {
            cb(completed.id, result.as_deref());
        }
    }

    fn run_continuation(&mut self, continuation: Continuation, result: Option<&[Value]>) {
        match continuation {
            Continuation::None => {}

            Continuation::RegisteredPublisher { pub_idx } => {
                if result.is_none() {
                    log::warn!("[node] registerPublisher for slot {} failed", pub_idx);
                }
            }

            Continuation::RegisteredSubscriber { sub_idx } => {
                let uris: Option<Vec<String>> = result.and_then(|params| {
                    let (code, status, payload) = call::parse_ros_triple(params).ok()?;
                    if code != 1 {
                        log::warn!("[node] registerSubscriber rejected: {}", status);
                        return None;
                    }
                    Some(
                        payload
                            .as_array()?
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect(),
                    )
                });
                match uris {
                    Some(uris) => {
                        if let Ok(sub) = self.registry.subscription_mut(sub_idx) {
                            sub.publishers = uris;
                        }
                        self.sync_subscription(sub_idx);
                    }
                    None => log::warn!("[node] registerSubscriber for slot {} failed", sub_idx),
                }
            }

            Continuation::RequestedTopic { sub_idx, peer_uri } => {
                if let Ok(sub) = self.registry.subscription_mut(sub_idx) {
                    sub.pending_topic_requests.remove(&peer_uri);
                }
                let endpoint = result.and_then(|params| {
                    let (code, status, payload) = call::parse_ros_triple(params).ok()?;
                    if code != 1 {
                        log::warn!("[node] requestTopic rejected by {}: {}", peer_uri, status);
                        return None;
                    }
                    let proto = payload.as_array()?;
                    if proto.first()?.as_str()? != TCPROS_PROTOCOL {
                        return None;
                    }
                    let host = proto.get(1)?.as_str()?.to_string();
                    let port = u16::try_from(proto.get(2)?.as_i32()?).ok()?;
                    Some((host, port))
                });
                match endpoint {
                    Some((host, port)) => {
                        self.open_subscriber_session(sub_idx, &peer_uri, &host, port);
                    }
                    None => log::warn!("[node] requestTopic to {} failed", peer_uri),
                }
            }

            Continuation::LookedUpService { caller_idx } => {
                if let Ok(c) = self.registry.caller_mut(caller_idx) {
                    c.lookup_pending = false;
                }
                let endpoint = result.and_then(|params| {
                    let (code, status, payload) = call::parse_ros_triple(params).ok()?;
                    if code != 1 {
                        log::warn!("[node] lookupService rejected: {}", status);
                        return None;
                    }
                    call::parse_rosrpc_uri(payload.as_str()?).ok()
                });
                match endpoint {
                    Some((host, port)) => {
                        if let Ok(c) = self.registry.caller_mut(caller_idx) {
                            c.endpoint = Some((host, port));
                        }
                        let wants_work = self
                            .registry
                            .caller(caller_idx)
                            .map(|c| c.sync_waiting || c.pending_request.is_some())
                            .unwrap_or(false);
                        if wants_work {
                            self.open_caller_session(caller_idx);
                        }
                    }
                    None => {
                        self.fail_caller(caller_idx, RosError::transport("lookupService failed"));
                    }
                }
            }

            Continuation::Pinged => {
                self.ping_pending = false;
                let pid = result
                    .and_then(|params| call::parse_ros_triple(params).ok())
                    .filter(|(code, _, _)| *code == 1)
                    .and_then(|(_, _, payload)| payload.as_i32());
                match pid {
                    Some(pid) => {
                        if let Some(old) = self.master_pid {
                            if old != pid {
                                log::warn!(
                                    "[node] master restarted (pid {} -> {}), re-registering",
                                    old,
                                    pid
                                );
                                self.re_register_all();
                            }
                        }
                        self.master_pid = Some(pid);
                    }
                    None => log::debug!("[node] master ping unanswered"),
                }
            }
        }
    }

    fn enqueue_ping(&mut self) {
        if self.ping_pending {
            return;
        }
        self.ping_pending = true;
        let ping = ApiCall::new(
            ApiMethod::GetPid,
            vec![Value::string(&self.config.name)],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_continuation(Continuation::Pinged);
        self.queue.enqueue(ping);
    }

    fn re_register_all(&mut self) {
        let name = self.config.name.clone();
        let caller_api = self.xmlrpc_uri();
        let service_api = self.service_uri();
        let master_host = self.config.master_host.clone();
        let master_port = self.config.master_port;

        let pubs: Vec<(usize, String, String)> = self
            .registry
            .publications()
            .map(|(i, p)| (i, p.topic.clone(), p.msg_type.clone()))
            .collect();
        let subs: Vec<(usize, String, String)> = self
            .registry
            .subscriptions()
            .map(|(i, s)| (i, s.topic.clone(), s.msg_type.clone()))
            .collect();
        let services: Vec<String> = self
            .registry
            .providers()
            .map(|(_, p)| p.service.clone())
            .collect();

        for (idx, topic, msg_type) in pubs {
            self.queue.enqueue(
                ApiCall::new(
                    ApiMethod::RegisterPublisher,
                    vec![
                        Value::string(&name),
                        Value::Str(topic),
                        Value::Str(msg_type),
                        Value::string(&caller_api),
                    ],
                    &master_host,
                    master_port,
                )
                .with_continuation(Continuation::RegisteredPublisher { pub_idx: idx }),
            );
        }
        for (idx, topic, msg_type) in subs {
            self.queue.enqueue(
                ApiCall::new(
                    ApiMethod::RegisterSubscriber,
                    vec![
                        Value::string(&name),
                        Value::Str(topic),
                        Value::Str(msg_type),
                        Value::string(&caller_api),
                    ],
                    &master_host,
                    master_port,
                )
                .with_continuation(Continuation::RegisteredSubscriber { sub_idx: idx }),
            );
        }
        for service in services {
            self.queue.enqueue(ApiCall::new(
                ApiMethod::RegisterService,
                vec![
                    Value::string(&name),
                    Value::Str(service),
                    Value::string(&service_api),
                    Value::string(&caller_api),
                ],
                &master_host,
                master_port,
            ));
        }
    }

    // ==================================================================
    // Control plane: inbound server
    // ==================================================================

    fn advance_server_conn(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(mut conn) = self.server_conns.remove(&token) else {
            return;
        };
        match conn.advance(readable, writable) {
            ServerConnStatus::Pending => {
                self.server_conns.insert(token, conn);
            }
            ServerConnStatus::Request(body) => {
                let response = self.dispatch_slave(&body);
                conn.set_response(response);
                match conn.advance(false, true) {
                    ServerConnStatus::Done => {
                        let _ = self.reactor.deregister(&mut conn.stream);
                    }
                    ServerConnStatus::Pending => {
                        self.server_conns.insert(token, conn);
                    }
                    ServerConnStatus::Failed(e) => {
                        log::debug!("[slave] response write failed: {}", e);
                        let _ = self.reactor.deregister(&mut conn.stream);
                    }
                    ServerConnStatus::Request(_) => {}
                }
            }
            ServerConnStatus::Done => {
                let _ = self.reactor.deregister(&mut conn.stream);
            }
            ServerConnStatus::Failed(e) => {
                log::debug!("[slave] connection error: {}", e);
                let _ = self.reactor.deregister(&mut conn.stream);
            }
        }
    }

    fn dispatch_slave(&mut self, body: &str) -> Vec<u8> {
        let mut actions = Vec::new();
        let response = {
            let mut ctx = SlaveCtx {
                registry: &mut self.registry,
                sessions: &self.sessions,
                node_name: &self.config.name,
                advertised_host: &self.advertised_host,
                tcpros_port: self.tcpros_port,
                actions: &mut actions,
            };
            server::dispatch(body, &mut ctx)
        };
        for action in actions {
            match action {
                SlaveAction::RequestExit => self.exit_requested = true,
                SlaveAction::SyncSubscription(sub_idx) => self.sync_subscription(sub_idx),
            }
        }
        response
    }

    // ==================================================================
    // Subscriptions
    // ==================================================================

    /// Reconcile a subscription's sessions with its current publisher list:
    /// close sessions for dropped publishers, enqueue `requestTopic` for
    /// new ones.
    pub(crate) fn sync_subscription(&mut self, sub_idx: usize) {
        let (desired, current, pending) = match self.registry.subscription(sub_idx) {
            Ok(sub) => (
                sub.publishers.iter().cloned().collect::<HashSet<String>>(),
                sub.sessions
                    .iter()
                    .map(|(u, s)| (u.clone(), *s))
                    .collect::<Vec<_>>(),
                sub.pending_topic_requests.clone(),
            ),
            Err(_) => return,
        };

        for (uri, sid) in &current {
            if !desired.contains(uri) {
                log::debug!("[node] publisher {} dropped, closing session {}", uri, sid);
                self.close_session(*sid, None);
            }
        }

        let have: HashSet<String> = current.into_iter().map(|(u, _)| u).collect();
        let topic = match self.registry.subscription(sub_idx) {
            Ok(s) => s.topic.clone(),
            Err(_) => return,
        };
        for uri in desired {
            if have.contains(&uri) || pending.contains(&uri) {
                continue;
            }
            let (host, port) = match call::parse_http_uri(&uri) {
                Ok(ep) => ep,
                Err(e) => {
                    log::warn!("[node] bad publisher uri {:?}: {}", uri, e);
                    continue;
                }
            };
            if let Ok(sub) = self.registry.subscription_mut(sub_idx) {
                sub.pending_topic_requests.insert(uri.clone());
            }
            let request = ApiCall::new(
                ApiMethod::RequestTopic,
                vec![
                    Value::string(&self.config.name),
                    Value::string(&topic),
                    Value::Array(vec![Value::Array(vec![Value::string(TCPROS_PROTOCOL)])]),
                ],
                host,
                port,
            )
            .with_continuation(Continuation::RequestedTopic { sub_idx, peer_uri: uri });
            self.queue.enqueue(request);
        }
    }

    fn open_subscriber_session(&mut self, sub_idx: usize, peer_uri: &str, host: &str, port: u16) {
        let exists = match self.registry.subscription(sub_idx) {
            Ok(sub) => sub.sessions.contains_key(peer_uri),
            Err(_) => return,
        };
        // One connection per publisher endpoint; racing extras never start.
        if exists {
            return;
        }

        let Some(addr) = resolve_endpoint(host, port) else {
            self.record_error(RosError::transport(format!(
                "no address for {}:{}",
                host, port
            )));
            return;
        };
        let stream = match reactor::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                self.record_error(RosError::from_io(e, &format!("connect {}:{}", host, port)));
                return;
            }
        };
        let keepalive = self.config.keepalive.then(|| self.config.keepalive_interval);
        let _ = reactor::configure_stream(&stream, self.config.nodelay, keepalive);

        let id = self.next_session_id;
        self.next_session_id += 1;
        let token = self.reactor.next_token();
        let mut session = Session::outbound_subscriber(
            id,
            token,
            stream,
            sub_idx,
            peer_uri.to_string(),
            now_usec(),
            self.config.connect_timeout.as_micros() as u64,
            self.config.max_frame_size,
        );
        if let Err(e) = self.reactor.register(&mut session.stream, token, true, true) {
            self.record_error(RosError::from_io(e, "register session"));
            return;
        }
        self.sessions.insert(id, session);
        self.session_tokens.insert(token, id);
        if let Ok(sub) = self.registry.subscription_mut(sub_idx) {
            sub.sessions.insert(peer_uri.to_string(), id);
        }
        log::debug!(
            "[node] subscriber session {} -> {}:{} ({})",
            id,
            host,
            port,
            peer_uri
        );
    }

    // ==================================================================
    // Publications
    // ==================================================================

    fn tick_publisher(&mut self, idx: usize) {
        let cb = match self.registry.publication_mut(idx) {
            Ok(p) => p.fire.take(),
            Err(_) => return,
        };
        let Some(mut cb) = cb else { return };
        let payload = cb();
        if let Ok(p) = self.registry.publication_mut(idx) {
            p.fire = Some(cb);
        }
        if let Some(payload) = payload {
            self.broadcast_topic(idx, payload);
        }
    }

    pub(crate) fn broadcast_topic(&mut self, pub_idx: usize, payload: Vec<u8>) {
        let ids = match self.registry.publication_mut(pub_idx) {
            Ok(p) => {
                p.last_payload = Some(payload.clone());
                p.sent_count += 1;
                p.sessions.clone()
            }
            Err(_) => return,
        };
        for sid in ids {
            let result = match self.sessions.get_mut(&sid) {
                Some(s) if s.state == SessionState::Streaming => s.queue_message(&payload),
                _ => continue,
            };
            if let Err(e) = result {
                self.close_session(sid, Some(e));
            }
        }
    }

    // ==================================================================
    // Service callers
    // ==================================================================

    /// Drive a caller toward an answered invocation: resolve the endpoint,
    /// open a session, or hand a new request to an idle persistent session.
    fn kick_caller(&mut self, idx: usize) {
        let (has_endpoint, session, lookup_pending) = match self.registry.caller(idx) {
            Ok(c) => (c.endpoint.is_some(), c.session, c.lookup_pending),
            Err(_) => return,
        };
        match session {
            Some(sid) => {
                let idle = self
                    .sessions
                    .get(&sid)
                    .map(|s| s.state == SessionState::Idle)
                    .unwrap_or(false);
                if idle {
                    self.start_invocation(idx, sid);
                }
                // Handshaking or busy: a pending request rides along once
                // the session is ready; ticks never overlap themselves.
            }
            None => {
                if has_endpoint {
                    self.open_caller_session(idx);
                } else if !lookup_pending {
                    self.enqueue_lookup(idx);
                }
            }
        }
    }

    fn enqueue_lookup(&mut self, idx: usize) {
        let service = match self.registry.caller_mut(idx) {
            Ok(c) => {
                c.lookup_pending = true;
                c.service.clone()
            }
            Err(_) => return,
        };
        let lookup = ApiCall::new(
            ApiMethod::LookupService,
            vec![Value::string(&self.config.name), Value::Str(service)],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_continuation(Continuation::LookedUpService { caller_idx: idx });
        self.queue.enqueue(lookup);
    }

    fn start_invocation(&mut self, idx: usize, sid: u64) {
        let payload = self.build_caller_request(idx);
        let result = match self.sessions.get_mut(&sid) {
            Some(s) => s.queue_service_request(&payload),
            None => return,
        };
        if let Err(e) = result {
            self.close_session(sid, Some(e));
        }
    }

    fn build_caller_request(&mut self, idx: usize) -> Vec<u8> {
        if let Ok(c) = self.registry.caller_mut(idx) {
            if let Some(r) = c.pending_request.take() {
                return r;
            }
        }
        let cb = self.registry.caller_mut(idx).ok().and_then(|c| c.callback.take());
        let mut buf = Vec::new();
        if let Some(mut cb) = cb {
            cb(CallerEvent::BuildRequest(&mut buf));
            if let Ok(c) = self.registry.caller_mut(idx) {
                c.callback = Some(cb);
            }
        }
        buf
    }

    fn open_caller_session(&mut self, idx: usize) {
        let (host, port, persistent) = match self.registry.caller(idx) {
            Ok(c) => match &c.endpoint {
                Some((h, p)) => (h.clone(), *p, c.persistent),
                None => return,
            },
            Err(_) => return,
        };
        let Some(addr) = resolve_endpoint(&host, port) else {
            self.fail_caller(
                idx,
                RosError::transport(format!("no address for {}:{}", host, port)),
            );
            return;
        };
        let stream = match reactor::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                self.fail_caller(
                    idx,
                    RosError::from_io(e, &format!("connect {}:{}", host, port)),
                );
                return;
            }
        };
        let keepalive = self.config.keepalive.then(|| self.config.keepalive_interval);
        let _ = reactor::configure_stream(&stream, self.config.nodelay, keepalive);

        let id = self.next_session_id;
        self.next_session_id += 1;
        let token = self.reactor.next_token();
        let mut session = Session::outbound_service_client(
            id,
            token,
            stream,
            idx,
            format!("rosrpc://{}:{}", host, port),
            persistent,
            now_usec(),
            self.config.connect_timeout.as_micros() as u64,
            self.config.max_frame_size,
        );
        if let Err(e) = self.reactor.register(&mut session.stream, token, true, true) {
            self.fail_caller(idx, RosError::from_io(e, "register session"));
            return;
        }
        self.sessions.insert(id, session);
        self.session_tokens.insert(token, id);
        if let Ok(c) = self.registry.caller_mut(idx) {
            c.session = Some(id);
        }
        log::debug!("[node] service session {} -> {}:{}", id, host, port);
    }

    /// Deliver a failure to whoever is waiting on this caller.
    fn fail_caller(&mut self, idx: usize, err: RosError) {
        let sync = self
            .registry
            .caller(idx)
            .map(|c| c.sync_waiting && c.sync_result.is_none())
            .unwrap_or(false);
        if sync {
            if let Ok(c) = self.registry.caller_mut(idx) {
                c.sync_result = Some(Err(err));
            }
            return;
        }
        let cb = self.registry.caller_mut(idx).ok().and_then(|c| c.callback.take());
        if let Some(mut cb) = cb {
            cb(CallerEvent::Failed(&err));
            if let Ok(c) = self.registry.caller_mut(idx) {
                c.callback = Some(cb);
            }
        }
        self.record_error(err);
    }

    // ==================================================================
    // Sessions
    // ==================================================================

    fn advance_session(&mut self, id: u64, readable: bool, writable: bool) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        let was_streaming = session.state == SessionState::Streaming;
        let outcome = {
            let mut ctx = SessionCtx {
                registry: &mut self.registry,
                node_name: &self.config.name,
                now: now_usec(),
            };
            session.advance(readable, writable, &mut ctx)
        };
        match outcome {
            SessionOutcome::Continue => {
                let entered_streaming = !was_streaming
                    && session.state == SessionState::Streaming
                    && session.role == SessionRole::TopicSubscriber;
                self.sessions.insert(id, session);
                if entered_streaming {
                    self.prune_racing(id);
                }
            }
            SessionOutcome::Close(err) => self.finish_session(session, err),
        }
    }

    /// Only the first session to reach `Streaming` for a given publisher
    /// endpoint survives; late racers are torn down.
    fn prune_racing(&mut self, winner: u64) {
        let Some(w) = self.sessions.get(&winner) else { return };
        let (sub_idx, uri) = (w.provider_idx, w.peer_uri.clone());
        let losers: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| {
                s.id != winner
                    && s.role == SessionRole::TopicSubscriber
                    && s.provider_idx == sub_idx
                    && s.peer_uri == uri
            })
            .map(|s| s.id)
            .collect();
        for sid in losers {
            log::debug!("[node] closing racing session {}", sid);
            self.close_session(sid, None);
        }
    }

    pub(crate) fn close_session(&mut self, id: u64, err: Option<RosError>) {
        if let Some(session) = self.sessions.remove(&id) {
            self.finish_session(session, err);
        }
    }

    fn finish_session(&mut self, mut session: Session, err: Option<RosError>) {
        let _ = self.reactor.deregister(&mut session.stream);
        self.session_tokens.remove(&session.token);

        match session.role {
            SessionRole::TopicSubscriber => {
                if let Ok(sub) = self.registry.subscription_mut(session.provider_idx) {
                    sub.sessions.retain(|_, sid| *sid != session.id);
                }
                if let Some(e) = err {
                    self.record_error(e);
                }
            }
            SessionRole::TopicPublisher => {
                if let Ok(p) = self.registry.publication_mut(session.provider_idx) {
                    p.sessions.retain(|sid| *sid != session.id);
                }
                if let Some(e) = err {
                    self.record_error(e);
                }
            }
            SessionRole::ServiceServer => {
                if let Some(e) = err {
                    self.record_error(e);
                }
            }
            SessionRole::ServiceClient => {
                if let Ok(c) = self.registry.caller_mut(session.provider_idx) {
                    if c.session == Some(session.id) {
                        c.session = None;
                    }
                }
                match err {
                    Some(e) => self.fail_caller(session.provider_idx, e),
                    None => {
                        // Clean close with a sync call still outstanding:
                        // the provider hung up before answering.
                        let hung = self
                            .registry
                            .caller(session.provider_idx)
                            .map(|c| c.sync_waiting && c.sync_result.is_none())
                            .unwrap_or(false);
                        if hung {
                            self.fail_caller(
                                session.provider_idx,
                                RosError::transport("provider closed before answering"),
                            );
                        }
                    }
                }
            }
        }
        log::debug!("[node] session {} closed", session.id);
    }

    pub(crate) fn record_error(&mut self, err: RosError) {
        log::warn!("[node] {}", err);
        self.last_error = Some(err);
    }
}
