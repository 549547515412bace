//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::advisory::AdvisoryMessage;
use crate::broker_url::BrokerUrl;
use crate::message::MessageType;
use crate::routing::{is_pattern, queue_matches};
use crate::{MessagingError, Result};

/// Which advisory traffic a client wants in addition to its subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvisoryFlags {
    /// Receive status messages (including online/offline advisories).
    pub status: bool,
    /// Receive query messages.
    pub query: bool,
    /// Discard frames queued for the client before it attached.
    pub flush_backlog: bool,
}

/// Routing facts a broker needs about one outbound frame.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// Client id of the publisher. Never delivered back to it.
    pub sender: &'a str,
    /// Destination queue, possibly with wildcard segments.
    pub receiver_queue: &'a str,
    /// Envelope type, used for advisory fan-out.
    pub kind: MessageType,
    /// Serialized message.
    pub frame: &'a str,
}

/// One broker session: publish/subscribe of text frames by queue name.
pub trait Transport: Send + Sync {
    /// Register `client_id` with the broker.
    fn attach(&self, client_id: &str, flags: AdvisoryFlags) -> Result<()>;
    /// Add a subscription pattern for an attached client.
    fn subscribe(&self, client_id: &str, pattern: &str) -> Result<()>;
    /// Fan a frame out to every matching subscriber. Returns the recipient count.
    fn publish(&self, delivery: &Delivery<'_>) -> Result<usize>;
    /// Take every frame queued for `client_id`, waiting up to `wait` for the first.
    fn fetch(&self, client_id: &str, wait: Duration) -> Result<Vec<String>>;
    /// Forget the client and its subscriptions.
    fn detach(&self, client_id: &str);
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &str;
}

/// Resolves broker URLs to live transports.
pub trait Connector: Send + Sync {
    /// Open a session to the broker behind `url`.
    fn connect(&self, url: &BrokerUrl) -> Result<Arc<dyn Transport>>;
}

struct Mailbox {
    patterns: Vec<String>,
    flags: AdvisoryFlags,
    frames: VecDeque<String>,
}

impl Mailbox {
    fn wants(&self, delivery: &Delivery<'_>) -> bool {
        let advisory = match delivery.kind {
            MessageType::Status => self.flags.status,
            MessageType::Query => self.flags.query,
            _ => false,
        };
        advisory
            || self
                .patterns
                .iter()
                .any(|pattern| queue_matches(pattern, delivery.receiver_queue))
    }
}

struct BrokerState {
    online: bool,
    mailboxes: IndexMap<String, Mailbox>,
    published: u64,
}

/// Process-local broker with wildcard routing, used by tests and single-process setups.
pub struct InMemoryBroker {
    name: String,
    state: Mutex<BrokerState>,
    arrivals: Condvar,
}

impl InMemoryBroker {
    /// Create an online broker.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BrokerState {
                online: true,
                mailboxes: IndexMap::new(),
                published: 0,
            }),
            arrivals: Condvar::new(),
        }
    }

    /// Simulate an outage; publish and fetch fail while offline.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
        self.arrivals.notify_all();
    }

    /// Frames waiting for `client_id`.
    pub fn pending(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .mailboxes
            .get(client_id)
            .map_or(0, |mailbox| mailbox.frames.len())
    }

    /// Frames accepted by `publish` so far.
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Attached client ids, in attach order.
    pub fn clients(&self) -> Vec<String> {
        self.state.lock().mailboxes.keys().cloned().collect()
    }

    /// Subscription patterns of one client.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state
            .lock()
            .mailboxes
            .get(client_id)
            .map(|mailbox| mailbox.patterns.clone())
            .unwrap_or_default()
    }

    fn ensure_online(&self, state: &BrokerState) -> Result<()> {
        if state.online {
            Ok(())
        } else {
            Err(MessagingError::Unreachable(format!("{} is offline", self.name)))
        }
    }

    fn announce(&self, state: &mut BrokerState, queue: &str, online: bool) {
        let mut message = AdvisoryMessage::new(queue, online).to_message();
        message.header_mut().sender_id = self.name.clone();
        message.header_mut().broker_id = self.name.clone();
        let frame = message.message_buffer();
        for (client, mailbox) in state.mailboxes.iter_mut() {
            if client != queue && mailbox.flags.status {
                mailbox.frames.push_back(frame.clone());
            }
        }
        self.arrivals.notify_all();
    }
}

impl Transport for InMemoryBroker {
    fn attach(&self, client_id: &str, flags: AdvisoryFlags) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_online(&state)?;
        let fresh = !state.mailboxes.contains_key(client_id);
        let mailbox = state
            .mailboxes
            .entry(client_id.to_owned())
            .or_insert_with(|| Mailbox {
                patterns: Vec::new(),
                flags,
                frames: VecDeque::new(),
            });
        mailbox.flags = flags;
        if flags.flush_backlog {
            mailbox.frames.clear();
        }
        if fresh {
            info!(broker = %self.name, client = %client_id, "client attached");
            self.announce(&mut state, client_id, true);
        }
        Ok(())
    }

    fn subscribe(&self, client_id: &str, pattern: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_online(&state)?;
        let mailbox = state.mailboxes.get_mut(client_id).ok_or_else(|| {
            MessagingError::Unreachable(format!("{client_id} is not attached to {}", self.name))
        })?;
        if !mailbox.patterns.iter().any(|p| p == pattern) {
            debug!(broker = %self.name, client = %client_id, pattern, wildcard = is_pattern(pattern), "subscribed");
            mailbox.patterns.push(pattern.to_owned());
        }
        Ok(())
    }

    fn publish(&self, delivery: &Delivery<'_>) -> Result<usize> {
        let mut state = self.state.lock();
        self.ensure_online(&state)?;
        state.published += 1;
        let mut recipients = 0;
        for (client, mailbox) in state.mailboxes.iter_mut() {
            if client == delivery.sender || !mailbox.wants(delivery) {
                continue;
            }
            mailbox.frames.push_back(delivery.frame.to_owned());
            recipients += 1;
        }
        if recipients == 0 {
            debug!(broker = %self.name, queue = delivery.receiver_queue, "no subscriber for frame");
        }
        self.arrivals.notify_all();
        Ok(recipients)
    }

    fn fetch(&self, client_id: &str, wait: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            self.ensure_online(&state)?;
            let mailbox = state.mailboxes.get_mut(client_id).ok_or_else(|| {
                MessagingError::Unreachable(format!("{client_id} is not attached to {}", self.name))
            })?;
            if !mailbox.frames.is_empty() {
                return Ok(mailbox.frames.drain(..).collect());
            }
            if self.arrivals.wait_until(&mut state, deadline).timed_out() {
                return Ok(Vec::new());
            }
        }
    }

    fn detach(&self, client_id: &str) {
        let mut state = self.state.lock();
        if state.mailboxes.shift_remove(client_id).is_some() {
            info!(broker = %self.name, client = %client_id, "client detached");
            self.announce(&mut state, client_id, false);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Set of in-memory brokers addressable by `host[:port]`.
#[derive(Default)]
pub struct InMemoryNetwork {
    brokers: RwLock<HashMap<String, Arc<InMemoryBroker>>>,
}

impl InMemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or return the running) broker listening on `authority`.
    pub fn add_broker(&self, authority: &str) -> Arc<InMemoryBroker> {
        self.brokers
            .write()
            .entry(authority.to_owned())
            .or_insert_with(|| Arc::new(InMemoryBroker::new(authority)))
            .clone()
    }

    /// Broker listening on `authority`, if any.
    pub fn broker(&self, authority: &str) -> Option<Arc<InMemoryBroker>> {
        self.brokers.read().get(authority).cloned()
    }
}

impl Connector for InMemoryNetwork {
    fn connect(&self, url: &BrokerUrl) -> Result<Arc<dyn Transport>> {
        let authority = url.authority();
        let broker = self
            .broker(&authority)
            .ok_or_else(|| MessagingError::Unreachable(format!("no broker at {authority}")))?;
        self.ensure_reachable(&broker)?;
        Ok(broker as Arc<dyn Transport>)
    }
}

impl InMemoryNetwork {
    fn ensure_reachable(&self, broker: &InMemoryBroker) -> Result<()> {
        let state = broker.state.lock();
        broker.ensure_online(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn delivery<'a>(sender: &'a str, queue: &'a str, kind: MessageType, frame: &'a str) -> Delivery<'a> {
        Delivery {
            sender,
            receiver_queue: queue,
            kind,
            frame,
        }
    }

    #[test]
    fn wildcard_subscription_receives_and_sender_is_skipped() {
        let broker = InMemoryBroker::new("mem");
        for client in ["/eos/a/fst", "/eos/b/fst"] {
            broker.attach(client, AdvisoryFlags::default()).expect("attach");
            broker.subscribe(client, "/eos/*/fst").expect("subscribe");
        }
        let count = broker
            .publish(&delivery("/eos/a/fst", "/eos/*/fst", MessageType::Plain, "frame"))
            .expect("publish");
        assert_eq!(count, 1);
        assert_eq!(broker.pending("/eos/a/fst"), 0);
        assert_eq!(
            broker.fetch("/eos/b/fst", Duration::ZERO).expect("fetch"),
            vec!["frame".to_owned()]
        );
    }

    #[test]
    fn duplicate_subscription_does_not_duplicate_delivery() {
        let broker = InMemoryBroker::new("mem");
        broker.attach("/q/a", AdvisoryFlags::default()).expect("attach");
        broker.subscribe("/q/a", "/q/*").expect("subscribe");
        broker.subscribe("/q/a", "/q/*").expect("subscribe again");
        broker.subscribe("/q/a", "/q/a").expect("own queue");
        broker
            .publish(&delivery("/q/b", "/q/a", MessageType::Plain, "x"))
            .expect("publish");
        assert_eq!(broker.pending("/q/a"), 1);
        assert_eq!(broker.subscriptions("/q/a").len(), 2);
    }

    #[test]
    fn advisory_flags_route_status_and_announce_presence() {
        let broker = InMemoryBroker::new("mem");
        let watcher = AdvisoryFlags {
            status: true,
            query: true,
            flush_backlog: false,
        };
        broker.attach("/mgm", watcher).expect("attach watcher");
        broker.attach("/fst", AdvisoryFlags::default()).expect("attach fst");

        let frames = broker.fetch("/mgm", Duration::ZERO).expect("fetch");
        assert_eq!(frames.len(), 1);
        let advisory = AdvisoryMessage::from_buffer(&frames[0]).expect("advisory");
        assert_eq!(advisory, AdvisoryMessage::new("/fst", true));

        broker
            .publish(&delivery("/fst", "/nowhere", MessageType::Query, "q"))
            .expect("publish");
        assert_eq!(broker.pending("/mgm"), 1);

        broker.detach("/fst");
        let frames = broker.fetch("/mgm", Duration::ZERO).expect("fetch");
        assert_eq!(
            AdvisoryMessage::from_buffer(&frames[1]).expect("advisory"),
            AdvisoryMessage::new("/fst", false)
        );
    }

    #[test]
    fn flush_backlog_discards_queued_frames() {
        let broker = InMemoryBroker::new("mem");
        broker.attach("/a", AdvisoryFlags::default()).expect("attach");
        broker.subscribe("/a", "/a").expect("subscribe");
        broker
            .publish(&delivery("/b", "/a", MessageType::Plain, "old"))
            .expect("publish");
        let flush = AdvisoryFlags {
            flush_backlog: true,
            ..AdvisoryFlags::default()
        };
        broker.attach("/a", flush).expect("reattach");
        assert_eq!(broker.pending("/a"), 0);
    }

    #[test]
    fn offline_broker_fails_operations_and_connect() {
        let network = InMemoryNetwork::new();
        let broker = network.add_broker("broker:1097");
        let url = BrokerUrl::parse("mem://broker:1097//xmessage/").expect("url");
        assert!(network.connect(&url).is_ok());

        broker.set_online(false);
        assert!(network.connect(&url).is_err());
        assert!(broker.attach("/a", AdvisoryFlags::default()).is_err());

        let missing = BrokerUrl::parse("mem://elsewhere:1097//").expect("url");
        assert!(matches!(network.connect(&missing), Err(MessagingError::Unreachable(_))));
    }

    #[test]
    fn fetch_wakes_on_publish() {
        let broker = Arc::new(InMemoryBroker::new("mem"));
        broker.attach("/a", AdvisoryFlags::default()).expect("attach");
        broker.subscribe("/a", "/a").expect("subscribe");
        let publisher = Arc::clone(&broker);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let frame = Message::new("late").message_buffer();
            publisher
                .publish(&delivery("/b", "/a", MessageType::Plain, &frame))
                .expect("publish");
        });
        let frames = broker.fetch("/a", Duration::from_secs(5)).expect("fetch");
        handle.join().expect("publisher");
        assert_eq!(frames.len(), 1);
    }
}
