// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The node: registry, public operations, and the engine that drives them.
//!
//! A [`Node`] owns every socket and every registered entity. All work
//! happens inside [`Node::run`] (or the bounded spins behind
//! [`Node::send_topic_message`] and [`Node::call_service`]); user callbacks
//! execute on that same thread and must not block. Registry mutations from
//! callback context go through [`NodeHandle`] and take effect at the top of
//! the next loop iteration.

pub(crate) mod engine;
pub mod registry;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::Token;

use crate::api::call::{self, ApiCall, ApiMethod, Continuation};
use crate::api::dispatcher::Dispatcher;
use crate::api::queue::ApiCallQueue;
use crate::api::server::ServerConn;
use crate::clock::{now_usec, TimerKey, TimerWheel};
use crate::config::NodeConfig;
use crate::error::{Result, RosError};
use crate::node::registry::{
    CallerCallback, MessageCallback, PublishCallback, Publication, Registry, ServiceCaller,
    ServiceHandler, ServiceProvider, Subscription,
};
use crate::reactor::Reactor;
use crate::schema::SchemaDb;
use crate::tcpros::Session;
use crate::xmlrpc::Value;

/// Opaque user payload plus the type identity it was serialized under.
#[derive(Debug, Clone)]
pub struct Message {
    pub type_name: String,
    pub md5sum: String,
    pub bytes: Vec<u8>,
}

/// Registry mutation requested from callback context; applied at the top
/// of the next loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    Shutdown,
    UnregisterPublisher(usize),
    UnregisterSubscriber(usize),
    UnregisterServiceProvider(usize),
    UnregisterServiceCaller(usize),
}

/// Cloneable handle for queueing [`NodeCommand`]s from callbacks.
#[derive(Clone)]
pub struct NodeHandle {
    commands: Rc<RefCell<VecDeque<NodeCommand>>>,
}

impl NodeHandle {
    pub fn send(&self, cmd: NodeCommand) {
        self.commands.borrow_mut().push_back(cmd);
    }

    /// Ask the engine to begin graceful shutdown.
    pub fn shutdown(&self) {
        self.send(NodeCommand::Shutdown);
    }
}

/// A ROS1 client node.
pub struct Node {
    config: NodeConfig,
    schema_db: Box<dyn SchemaDb>,

    registry: Registry,
    queue: ApiCallQueue,
    dispatcher: Dispatcher,
    server_conns: HashMap<Token, ServerConn>,
    sessions: HashMap<u64, Session>,
    session_tokens: HashMap<Token, u64>,

    reactor: Reactor,
    wheel: TimerWheel,

    xmlrpc_listener: TcpListener,
    tcpros_listener: TcpListener,
    xmlrpc_listener_token: Token,
    tcpros_listener_token: Token,
    xmlrpc_port: u16,
    tcpros_port: u16,
    advertised_host: String,

    next_session_id: u64,
    master_pid: Option<i32>,
    ping_pending: bool,
    exit_requested: bool,
    destroyed: bool,
    last_error: Option<RosError>,
    commands: Rc<RefCell<VecDeque<NodeCommand>>>,
}

impl Node {
    /// Create a node with default configuration.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        master_host: impl Into<String>,
        master_port: u16,
        schema_db: Box<dyn SchemaDb>,
    ) -> Result<Self> {
        Self::with_config(NodeConfig::new(name, host, master_host, master_port), schema_db)
    }

    /// Create a node from an explicit configuration.
    pub fn with_config(config: NodeConfig, schema_db: Box<dyn SchemaDb>) -> Result<Self> {
        config.validate().map_err(RosError::usage)?;

        let advertised_host = if config.host.is_empty() {
            match local_ip_address::local_ip() {
                Ok(ip) => ip.to_string(),
                Err(_) => "127.0.0.1".to_string(),
            }
        } else {
            config.host.clone()
        };

        let mut reactor = Reactor::new().map_err(|e| RosError::from_io(e, "create poll"))?;

        let bind = |port: u16| -> Result<TcpListener> {
            let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
            TcpListener::bind(addr).map_err(|e| RosError::from_io(e, "bind listener"))
        };

        let mut xmlrpc_listener = bind(config.xmlrpc_port)?;
        let mut tcpros_listener = bind(config.tcpros_port)?;
        let xmlrpc_port = xmlrpc_listener
            .local_addr()
            .map_err(|e| RosError::from_io(e, "listener addr"))?
            .port();
        let tcpros_port = tcpros_listener
            .local_addr()
            .map_err(|e| RosError::from_io(e, "listener addr"))?
            .port();

        let xmlrpc_listener_token = reactor.next_token();
        let tcpros_listener_token = reactor.next_token();
        reactor
            .register(&mut xmlrpc_listener, xmlrpc_listener_token, true, false)
            .map_err(|e| RosError::from_io(e, "register listener"))?;
        reactor
            .register(&mut tcpros_listener, tcpros_listener_token, true, false)
            .map_err(|e| RosError::from_io(e, "register listener"))?;

        let mut wheel = TimerWheel::new();
        let ping = config.ping_interval.as_micros() as u64;
        wheel.arm(TimerKey::MasterPing, now_usec() + ping, Some(ping));

        log::info!(
            "[node] {} up: xmlrpc {}:{}, tcpros {}:{}, master {}:{}",
            config.name,
            advertised_host,
            xmlrpc_port,
            advertised_host,
            tcpros_port,
            config.master_host,
            config.master_port
        );

        Ok(Self {
            config,
            schema_db,
            registry: Registry::new(),
            queue: ApiCallQueue::new(),
            dispatcher: Dispatcher::new(),
            server_conns: HashMap::new(),
            sessions: HashMap::new(),
            session_tokens: HashMap::new(),
            reactor,
            wheel,
            xmlrpc_listener,
            tcpros_listener,
            xmlrpc_listener_token,
            tcpros_listener_token,
            xmlrpc_port,
            tcpros_port,
            advertised_host,
            next_session_id: 1,
            master_pid: None,
            ping_pending: false,
            exit_requested: false,
            destroyed: false,
            last_error: None,
            commands: Rc::new(RefCell::new(VecDeque::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn xmlrpc_port(&self) -> u16 {
        self.xmlrpc_port
    }

    pub fn tcpros_port(&self) -> u16 {
        self.tcpros_port
    }

    /// This node's XMLRPC URI as advertised to the master.
    pub fn xmlrpc_uri(&self) -> String {
        format!("http://{}:{}/", self.advertised_host, self.xmlrpc_port)
    }

    /// This node's service URI as advertised in `registerService`.
    pub fn service_uri(&self) -> String {
        format!("rosrpc://{}:{}", self.advertised_host, self.tcpros_port)
    }

    /// Handle for queueing commands from callback context.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            commands: Rc::clone(&self.commands),
        }
    }

    /// Most recent session/RPC error, for diagnostics and tests.
    pub fn take_last_error(&mut self) -> Option<RosError> {
        self.last_error.take()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed {
            return Err(RosError::usage("node has been destroyed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Subscribe to a topic. The callback receives each raw payload frame.
    pub fn register_subscriber(
        &mut self,
        topic: &str,
        msg_type: &str,
        tcp_nodelay: bool,
        on_message: impl FnMut(&[u8]) + 'static,
    ) -> Result<usize> {
        self.ensure_live()?;
        let schema = self.schema_db.message(msg_type)?;
        let idx = self.registry.add_subscription(Subscription::new(
            topic,
            msg_type,
            schema.md5sum,
            schema.definition,
            Box::new(on_message) as MessageCallback,
            tcp_nodelay,
        ))?;

        let call = ApiCall::new(
            ApiMethod::RegisterSubscriber,
            vec![
                Value::string(&self.config.name),
                Value::string(topic),
                Value::string(msg_type),
                Value::Str(self.xmlrpc_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_continuation(Continuation::RegisteredSubscriber { sub_idx: idx });
        self.queue.enqueue(call);
        log::debug!("[node] subscribe {} ({}) -> slot {}", topic, msg_type, idx);
        Ok(idx)
    }

    /// Advertise a topic. `interval_ms` with a `fire` callback makes the
    /// publisher periodic; otherwise messages go out via
    /// [`Node::send_topic_message`].
    pub fn register_publisher(
        &mut self,
        topic: &str,
        msg_type: &str,
        latching: bool,
        interval_ms: Option<u64>,
        fire: Option<PublishCallback>,
    ) -> Result<usize> {
        self.ensure_live()?;
        let schema = self.schema_db.message(msg_type)?;
        let mut publication = Publication::new(topic, msg_type, schema.md5sum, schema.definition);
        publication.latching = latching;
        publication.interval_usec = interval_ms.map(|ms| ms.saturating_mul(1000));
        publication.fire = fire;
        let idx = self.registry.add_publication(publication)?;

        if let Some(interval) = interval_ms.map(|ms| ms.saturating_mul(1000)) {
            self.wheel
                .arm(TimerKey::PublishTick(idx), now_usec() + interval, Some(interval));
        }

        let call = ApiCall::new(
            ApiMethod::RegisterPublisher,
            vec![
                Value::string(&self.config.name),
                Value::string(topic),
                Value::string(msg_type),
                Value::Str(self.xmlrpc_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_continuation(Continuation::RegisteredPublisher { pub_idx: idx });
        self.queue.enqueue(call);
        log::debug!("[node] advertise {} ({}) -> slot {}", topic, msg_type, idx);
        Ok(idx)
    }

    /// Provide a service.
    pub fn register_service_provider(
        &mut self,
        service: &str,
        srv_type: &str,
        handler: ServiceHandler,
    ) -> Result<usize> {
        self.ensure_live()?;
        let schema = self.schema_db.service(srv_type)?;
        let idx = self.registry.add_provider(ServiceProvider {
            service: service.to_string(),
            srv_type: srv_type.to_string(),
            md5sum: schema.md5sum,
            request_type: schema.request_type,
            response_type: schema.response_type,
            handler: Some(handler),
            served_count: 0,
        })?;

        let call = ApiCall::new(
            ApiMethod::RegisterService,
            vec![
                Value::string(&self.config.name),
                Value::string(service),
                Value::Str(self.service_uri()),
                Value::Str(self.xmlrpc_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        );
        self.queue.enqueue(call);
        log::debug!("[node] provide {} ({}) -> slot {}", service, srv_type, idx);
        Ok(idx)
    }

    /// Register a service caller. The provider endpoint is resolved lazily
    /// through `lookupService` on first use; `interval_ms` with a callback
    /// makes the caller periodic.
    pub fn register_service_caller(
        &mut self,
        service: &str,
        srv_type: &str,
        persistent: bool,
        interval_ms: Option<u64>,
        callback: Option<CallerCallback>,
    ) -> Result<usize> {
        self.ensure_live()?;
        let schema = self.schema_db.service(srv_type)?;
        let idx = self.registry.add_caller(ServiceCaller {
            service: service.to_string(),
            srv_type: srv_type.to_string(),
            md5sum: schema.md5sum,
            persistent,
            interval_usec: interval_ms.map(|ms| ms.saturating_mul(1000)),
            callback,
            endpoint: None,
            session: None,
            lookup_pending: false,
            pending_request: None,
            sync_waiting: false,
            sync_result: None,
        })?;

        if let Some(interval) = interval_ms.map(|ms| ms.saturating_mul(1000)) {
            self.wheel
                .arm(TimerKey::CallerTick(idx), now_usec() + interval, Some(interval));
        }
        log::debug!("[node] caller {} ({}) -> slot {}", service, srv_type, idx);
        Ok(idx)
    }

    // ------------------------------------------------------------------
    // Unregistration
    // ------------------------------------------------------------------

    pub fn unregister_subscriber(&mut self, idx: usize) -> Result<()> {
        self.ensure_live()?;
        let sub = self.registry.remove_subscription(idx)?;
        // Sessions first, then the master.
        for (_, sid) in sub.sessions.iter() {
            self.close_session(*sid, None);
        }
        let call = ApiCall::new(
            ApiMethod::UnregisterSubscriber,
            vec![
                Value::string(&self.config.name),
                Value::string(&sub.topic),
                Value::Str(self.xmlrpc_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        );
        self.queue.enqueue(call);
        log::debug!("[node] unsubscribe {} (slot {})", sub.topic, idx);
        Ok(())
    }

    pub fn unregister_publisher(&mut self, idx: usize) -> Result<()> {
        self.ensure_live()?;
        let publication = self.registry.remove_publication(idx)?;
        self.wheel.disarm(TimerKey::PublishTick(idx));
        for sid in publication.sessions.iter() {
            self.close_session(*sid, None);
        }
        let call = ApiCall::new(
            ApiMethod::UnregisterPublisher,
            vec![
                Value::string(&self.config.name),
                Value::string(&publication.topic),
                Value::Str(self.xmlrpc_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        );
        self.queue.enqueue(call);
        log::debug!("[node] unadvertise {} (slot {})", publication.topic, idx);
        Ok(())
    }

    pub fn unregister_service_provider(&mut self, idx: usize) -> Result<()> {
        self.ensure_live()?;
        let provider = self.registry.remove_provider(idx)?;
        let stale: Vec<u64> = self
            .sessions
            .values()
            .filter(|s| {
                s.role == crate::tcpros::SessionRole::ServiceServer && s.provider_idx == idx
            })
            .map(|s| s.id)
            .collect();
        for sid in stale {
            self.close_session(sid, None);
        }
        let call = ApiCall::new(
            ApiMethod::UnregisterService,
            vec![
                Value::string(&self.config.name),
                Value::string(&provider.service),
                Value::Str(self.service_uri()),
            ],
            &self.config.master_host,
            self.config.master_port,
        );
        self.queue.enqueue(call);
        log::debug!("[node] withdraw {} (slot {})", provider.service, idx);
        Ok(())
    }

    pub fn unregister_service_caller(&mut self, idx: usize) -> Result<()> {
        self.ensure_live()?;
        let caller = self.registry.remove_caller(idx)?;
        self.wheel.disarm(TimerKey::CallerTick(idx));
        if let Some(sid) = caller.session {
            self.close_session(sid, None);
        }
        log::debug!("[node] drop caller {} (slot {})", caller.service, idx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messaging helpers
    // ------------------------------------------------------------------

    /// Blank message bound to a publisher's type, for the host serializer
    /// to fill.
    pub fn create_publisher_message(&self, pub_idx: usize) -> Result<Message> {
        self.ensure_live()?;
        let publication = self.registry.publication(pub_idx)?;
        Ok(Message {
            type_name: publication.msg_type.clone(),
            md5sum: publication.md5sum.clone(),
            bytes: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Parameter server
    // ------------------------------------------------------------------

    /// Fetch a parameter; the callback receives the value or `None`.
    pub fn get_param(
        &mut self,
        key: &str,
        mut on_value: impl FnMut(Option<&Value>) + 'static,
    ) -> Result<u64> {
        self.ensure_live()?;
        let call = ApiCall::new(
            ApiMethod::GetParam,
            vec![Value::string(&self.config.name), Value::string(key)],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_callback(Box::new(move |_, result| {
            let payload = result.and_then(|params| {
                call::parse_ros_triple(params)
                    .ok()
                    .filter(|(code, _, _)| *code == 1)
                    .map(|(_, _, payload)| payload)
            });
            on_value(payload.as_ref());
        }));
        Ok(self.queue.enqueue(call))
    }

    /// Store a parameter (fire and forget).
    pub fn set_param(&mut self, key: &str, value: Value) -> Result<u64> {
        self.ensure_live()?;
        let call = ApiCall::new(
            ApiMethod::SetParam,
            vec![Value::string(&self.config.name), Value::string(key), value],
            &self.config.master_host,
            self.config.master_port,
        );
        Ok(self.queue.enqueue(call))
    }

    /// Delete a parameter (fire and forget).
    pub fn delete_param(&mut self, key: &str) -> Result<u64> {
        self.ensure_live()?;
        let call = ApiCall::new(
            ApiMethod::DeleteParam,
            vec![Value::string(&self.config.name), Value::string(key)],
            &self.config.master_host,
            self.config.master_port,
        );
        Ok(self.queue.enqueue(call))
    }

    /// Check a parameter's existence; the callback receives the answer.
    pub fn has_param(
        &mut self,
        key: &str,
        mut on_answer: impl FnMut(Option<bool>) + 'static,
    ) -> Result<u64> {
        self.ensure_live()?;
        let call = ApiCall::new(
            ApiMethod::HasParam,
            vec![Value::string(&self.config.name), Value::string(key)],
            &self.config.master_host,
            self.config.master_port,
        )
        .with_callback(Box::new(move |_, result| {
            let answer = result.and_then(|params| {
                call::parse_ros_triple(params)
                    .ok()
                    .filter(|(code, _, _)| *code == 1)
                    .and_then(|(_, _, payload)| payload.as_bool())
            });
            on_answer(answer);
        }));
        Ok(self.queue.enqueue(call))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = self.shutdown();
        }
    }
}

/// Probe a TCP endpoint until it accepts or the timeout elapses.
///
/// Harness convenience: wait for the master (or a peer) to come up before
/// starting the node loop. `None` waits indefinitely.
pub fn wait_port_open(host: &str, port: u16, timeout_ms: Option<u64>) -> Result<()> {
    use std::net::{TcpStream, ToSocketAddrs};

    let deadline = timeout_ms.map(|ms| now_usec() + ms.saturating_mul(1000));
    loop {
        let addr = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut a| a.next())
            .ok_or_else(|| RosError::transport(format!("no address for {}:{}", host, port)))?;
        if TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok() {
            return Ok(());
        }
        if let Some(dl) = deadline {
            if now_usec() >= dl {
                return Err(RosError::timeout(format!(
                    "{}:{} did not open in time",
                    host, port
                )));
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
