// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slotted registry for the node's entities.
//!
//! Publishers, subscribers, service providers and service callers each live
//! in their own table. A slot index is a stable handle for the node's
//! lifetime; indices are only reused after an explicit unregister. Sessions
//! refer to entities by slot index and tolerate removal (the lookup simply
//! fails), which is what lets the whole engine run without back-pointers.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, RosError};

/// Hard cap per table; registration past this is a `Registry` error.
pub const MAX_SLOTS_PER_KIND: usize = 1024;

/// Receives one deserialized-opaque message payload per topic frame.
pub type MessageCallback = Box<dyn FnMut(&[u8])>;

/// Produces the next payload for a periodic publisher tick. `None` skips
/// the tick.
pub type PublishCallback = Box<dyn FnMut() -> Option<Vec<u8>>>;

/// Service handler: request payload in, response payload or a
/// user-reported error string out. The error string travels to the caller
/// behind an ok-byte of `0`.
pub type ServiceHandler = Box<dyn FnMut(&[u8]) -> std::result::Result<Vec<u8>, String>>;

/// Events delivered to a service-caller callback.
pub enum CallerEvent<'a> {
    /// Fill in the request payload for the next invocation.
    BuildRequest(&'a mut Vec<u8>),

    /// The provider answered with this response payload.
    Response(&'a [u8]),

    /// The invocation failed (transport, handshake, or ok-byte 0).
    Failed(&'a RosError),
}

/// Invoked to build requests and consume responses of a periodic caller.
pub type CallerCallback = Box<dyn FnMut(CallerEvent<'_>)>;

/// A topic the node publishes.
pub struct Publication {
    pub topic: String,
    pub msg_type: String,
    pub md5sum: String,
    pub definition: String,

    /// Periodic send interval; `None` means send-triggered only.
    pub interval_usec: Option<u64>,

    pub latching: bool,
    pub fire: Option<PublishCallback>,

    /// Last payload sent, replayed to late joiners when latching.
    pub last_payload: Option<Vec<u8>>,

    /// Session ids of connected subscribers.
    pub sessions: Vec<u64>,

    pub sent_count: u64,
}

/// A topic the node subscribes to.
pub struct Subscription {
    pub topic: String,
    pub msg_type: String,
    pub md5sum: String,
    pub definition: String,
    pub tcp_nodelay: bool,
    pub on_message: Option<MessageCallback>,

    /// Publisher XMLRPC URIs the master told us about.
    pub publishers: Vec<String>,

    /// Publisher URI -> session id for sessions in any state.
    pub sessions: HashMap<String, u64>,

    /// Publisher URIs with a `requestTopic` queued or in flight, so a
    /// repeated `publisherUpdate` does not stack duplicate calls.
    pub pending_topic_requests: HashSet<String>,

    pub received_count: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("msg_type", &self.msg_type)
            .field("md5sum", &self.md5sum)
            .field("definition", &self.definition)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("on_message", &self.on_message.as_ref().map(|_| "<callback>"))
            .field("publishers", &self.publishers)
            .field("sessions", &self.sessions)
            .field("pending_topic_requests", &self.pending_topic_requests)
            .field("received_count", &self.received_count)
            .finish()
    }
}

/// A service the node provides.
pub struct ServiceProvider {
    pub service: String,
    pub srv_type: String,
    pub md5sum: String,
    pub request_type: String,
    pub response_type: String,
    pub handler: Option<ServiceHandler>,
    pub served_count: u64,
}

/// A remote service the node invokes.
pub struct ServiceCaller {
    pub service: String,
    pub srv_type: String,
    pub md5sum: String,
    pub persistent: bool,

    /// Periodic invocation interval; `None` means explicit calls only.
    pub interval_usec: Option<u64>,

    pub callback: Option<CallerCallback>,

    /// Provider endpoint, resolved lazily via `lookupService`.
    pub endpoint: Option<(String, u16)>,

    /// Active session id, if a session exists (any state).
    pub session: Option<u64>,

    /// A `lookupService` call is in the queue or in flight.
    pub lookup_pending: bool,

    /// Request payload waiting for the session to become ready.
    pub pending_request: Option<Vec<u8>>,

    /// Synchronous `call_service` rendezvous.
    pub sync_waiting: bool,
    pub sync_result: Option<std::result::Result<Vec<u8>, RosError>>,
}

/// The four slotted tables.
#[derive(Default)]
pub struct Registry {
    pubs: Vec<Option<Publication>>,
    subs: Vec<Option<Subscription>>,
    providers: Vec<Option<ServiceProvider>>,
    callers: Vec<Option<ServiceCaller>>,
}

fn install<T>(table: &mut Vec<Option<T>>, value: T) -> Result<usize> {
    if let Some(idx) = table.iter().position(Option::is_none) {
        table[idx] = Some(value);
        return Ok(idx);
    }
    if table.len() >= MAX_SLOTS_PER_KIND {
        return Err(RosError::registry("slot table exhausted"));
    }
    table.push(Some(value));
    Ok(table.len() - 1)
}

fn slot<'a, T>(table: &'a [Option<T>], idx: usize, what: &str) -> Result<&'a T> {
    table
        .get(idx)
        .and_then(Option::as_ref)
        .ok_or_else(|| RosError::usage(format!("no {} at slot {}", what, idx)))
}

fn slot_mut<'a, T>(table: &'a mut [Option<T>], idx: usize, what: &str) -> Result<&'a mut T> {
    table
        .get_mut(idx)
        .and_then(Option::as_mut)
        .ok_or_else(|| RosError::usage(format!("no {} at slot {}", what, idx)))
}

fn remove<T>(table: &mut [Option<T>], idx: usize, what: &str) -> Result<T> {
    table
        .get_mut(idx)
        .and_then(Option::take)
        .ok_or_else(|| RosError::usage(format!("no {} at slot {}", what, idx)))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Publications
    // ------------------------------------------------------------------

    pub fn add_publication(&mut self, p: Publication) -> Result<usize> {
        if self
            .publications()
            .any(|(_, existing)| existing.topic == p.topic)
        {
            return Err(RosError::registry(format!(
                "topic {} already published",
                p.topic
            )));
        }
        install(&mut self.pubs, p)
    }

    pub fn publication(&self, idx: usize) -> Result<&Publication> {
        slot(&self.pubs, idx, "publisher")
    }

    pub fn publication_mut(&mut self, idx: usize) -> Result<&mut Publication> {
        slot_mut(&mut self.pubs, idx, "publisher")
    }

    pub fn remove_publication(&mut self, idx: usize) -> Result<Publication> {
        remove(&mut self.pubs, idx, "publisher")
    }

    pub fn publications(&self) -> impl Iterator<Item = (usize, &Publication)> {
        self.pubs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    pub fn find_publication(&self, topic: &str) -> Option<(usize, &Publication)> {
        self.publications().find(|(_, p)| p.topic == topic)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn add_subscription(&mut self, s: Subscription) -> Result<usize> {
        if self
            .subscriptions()
            .any(|(_, existing)| existing.topic == s.topic)
        {
            return Err(RosError::registry(format!(
                "topic {} already subscribed",
                s.topic
            )));
        }
        install(&mut self.subs, s)
    }

    pub fn subscription(&self, idx: usize) -> Result<&Subscription> {
        slot(&self.subs, idx, "subscriber")
    }

    pub fn subscription_mut(&mut self, idx: usize) -> Result<&mut Subscription> {
        slot_mut(&mut self.subs, idx, "subscriber")
    }

    pub fn remove_subscription(&mut self, idx: usize) -> Result<Subscription> {
        remove(&mut self.subs, idx, "subscriber")
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (usize, &Subscription)> {
        self.subs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn find_subscription(&self, topic: &str) -> Option<(usize, &Subscription)> {
        self.subscriptions().find(|(_, s)| s.topic == topic)
    }

    // ------------------------------------------------------------------
    // Service providers
    // ------------------------------------------------------------------

    pub fn add_provider(&mut self, p: ServiceProvider) -> Result<usize> {
        if self
            .providers()
            .any(|(_, existing)| existing.service == p.service)
        {
            return Err(RosError::registry(format!(
                "service {} already provided",
                p.service
            )));
        }
        install(&mut self.providers, p)
    }

    pub fn provider(&self, idx: usize) -> Result<&ServiceProvider> {
        slot(&self.providers, idx, "service provider")
    }

    pub fn provider_mut(&mut self, idx: usize) -> Result<&mut ServiceProvider> {
        slot_mut(&mut self.providers, idx, "service provider")
    }

    pub fn remove_provider(&mut self, idx: usize) -> Result<ServiceProvider> {
        remove(&mut self.providers, idx, "service provider")
    }

    pub fn providers(&self) -> impl Iterator<Item = (usize, &ServiceProvider)> {
        self.providers
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    pub fn find_provider(&self, service: &str) -> Option<(usize, &ServiceProvider)> {
        self.providers().find(|(_, p)| p.service == service)
    }

    // ------------------------------------------------------------------
    // Service callers
    // ------------------------------------------------------------------

    pub fn add_caller(&mut self, c: ServiceCaller) -> Result<usize> {
        install(&mut self.callers, c)
    }

    pub fn caller(&self, idx: usize) -> Result<&ServiceCaller> {
        slot(&self.callers, idx, "service caller")
    }

    pub fn caller_mut(&mut self, idx: usize) -> Result<&mut ServiceCaller> {
        slot_mut(&mut self.callers, idx, "service caller")
    }

    pub fn remove_caller(&mut self, idx: usize) -> Result<ServiceCaller> {
        remove(&mut self.callers, idx, "service caller")
    }

    pub fn callers(&self) -> impl Iterator<Item = (usize, &ServiceCaller)> {
        self.callers
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }

    pub fn callers_mut(&mut self) -> impl Iterator<Item = (usize, &mut ServiceCaller)> {
        self.callers
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| c.as_mut().map(|c| (i, c)))
    }
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        md5sum: impl Into<String>,
        definition: impl Into<String>,
        on_message: MessageCallback,
        tcp_nodelay: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
            md5sum: md5sum.into(),
            definition: definition.into(),
            tcp_nodelay,
            on_message: Some(on_message),
            publishers: Vec::new(),
            sessions: HashMap::new(),
            pending_topic_requests: HashSet::new(),
            received_count: 0,
        }
    }
}

impl Publication {
    pub fn new(
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        md5sum: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
            md5sum: md5sum.into(),
            definition: definition.into(),
            interval_usec: None,
            latching: false,
            fire: None,
            last_payload: None,
            sessions: Vec::new(),
            sent_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sub(topic: &str) -> Subscription {
        Subscription::new(
            topic,
            "std_msgs/String",
            "992ce8a1687cec8c8bd883ec73ca41d1",
            "string data\n",
            Box::new(|_| {}),
            false,
        )
    }

    #[test]
    fn test_indices_are_stable() {
        let mut reg = Registry::new();
        let a = reg.add_subscription(sub("/a")).unwrap();
        let b = reg.add_subscription(sub("/b")).unwrap();
        let c = reg.add_subscription(sub("/c")).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        reg.remove_subscription(b).unwrap();
        assert!(reg.subscription(b).is_err());
        assert_eq!(reg.subscription(a).unwrap().topic, "/a");
        assert_eq!(reg.subscription(c).unwrap().topic, "/c");
    }

    #[test]
    fn test_slot_reused_only_after_unregister() {
        let mut reg = Registry::new();
        let a = reg.add_subscription(sub("/a")).unwrap();
        let _b = reg.add_subscription(sub("/b")).unwrap();

        reg.remove_subscription(a).unwrap();
        let c = reg.add_subscription(sub("/c")).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_duplicate_topic_rejected() {
        let mut reg = Registry::new();
        reg.add_subscription(sub("/a")).unwrap();
        let err = reg.add_subscription(sub("/a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Registry);

        reg.add_publication(Publication::new("/t", "std_msgs/String", "x", ""))
            .unwrap();
        let err = reg
            .add_publication(Publication::new("/t", "std_msgs/String", "x", ""))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Registry);
    }

    #[test]
    fn test_stale_index_is_usage_error() {
        let mut reg = Registry::new();
        let err = reg.subscription(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = reg.remove_subscription(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_find_by_name() {
        let mut reg = Registry::new();
        reg.add_provider(ServiceProvider {
            service: "/sum".into(),
            srv_type: "roscpp_tutorials/TwoInts".into(),
            md5sum: "abc".into(),
            request_type: "roscpp_tutorials/TwoIntsRequest".into(),
            response_type: "roscpp_tutorials/TwoIntsResponse".into(),
            handler: Some(Box::new(|_| Ok(Vec::new()))),
            served_count: 0,
        })
        .unwrap();

        assert!(reg.find_provider("/sum").is_some());
        assert!(reg.find_provider("/other").is_none());
    }
}
