//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use xmq_common::config::{BrokerConfig, DEFAULT_RECEIVER_QUEUE};
use xmq_common::time::WallClock;
use xmq_common::CancellationToken;
use xmq_security::Keyring;

use crate::broker_url::{derive_client_id, BrokerUrl};
use crate::logging::{log_message, MessageDirection, MessagingMetricsExporter};
use crate::message::Message;
use crate::transport::{AdvisoryFlags, Connector, Delivery, Transport};
use crate::{MessagingError, Result, MAX_MESSAGE_SIZE};

const POLL_SLICE: Duration = Duration::from_millis(20);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(250);
const RECENT_ID_WINDOW: usize = 16_384;

/// Per-broker authentication and advisory settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Sign every message sent through this broker.
    pub sign: bool,
    /// Encrypt every message body sent through this broker.
    pub encrypt: bool,
    /// Advisory traffic requested on subscription.
    pub advisory: AdvisoryFlags,
}

impl From<&BrokerConfig> for BrokerOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            sign: config.sign,
            encrypt: config.encrypt,
            advisory: AdvisoryFlags {
                status: config.advisory_status,
                query: config.advisory_query,
                flush_backlog: config.advisory_flush_backlog,
            },
        }
    }
}

/// Snapshot of client counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessagingMetrics {
    /// Frames handed to brokers.
    pub sent: u64,
    /// Messages returned to the consumer.
    pub received: u64,
    /// Frames that failed to send, parse, verify or decode.
    pub dropped: u64,
    /// Inbound repeats of an already delivered id.
    pub duplicates: u64,
}

struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> MessagingMetrics {
        MessagingMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

struct BrokerSession {
    url: BrokerUrl,
    options: BrokerOptions,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Subscriptions {
    active: bool,
    extra: Vec<String>,
    attached: HashSet<String>,
    done: HashSet<(String, String)>,
}

#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == RECENT_ID_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }
}

/// Broker sessions, subscriptions and the inbound buffer of one client.
///
/// `send` may be called from any number of threads; it serializes the write
/// path. Receiving is meant for one consumer thread at a time.
pub struct MessageClient {
    client_id: String,
    keyring: Arc<Keyring>,
    connector: Arc<dyn Connector>,
    brokers: RwLock<IndexMap<String, Arc<BrokerSession>>>,
    default_receiver_queue: RwLock<String>,
    subscriptions: Mutex<Subscriptions>,
    buffer: Mutex<VecDeque<String>>,
    recent: Mutex<RecentIds>,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    recv_timeout: Duration,
    counters: Counters,
    exporter: Option<MessagingMetricsExporter>,
}

impl MessageClient {
    /// Client named `client_id` (or a host-derived id) resolving brokers through `connector`.
    pub fn new(
        client_id: Option<&str>,
        keyring: Arc<Keyring>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            client_id: derive_client_id(client_id),
            keyring,
            connector,
            brokers: RwLock::new(IndexMap::new()),
            default_receiver_queue: RwLock::new(DEFAULT_RECEIVER_QUEUE.to_owned()),
            subscriptions: Mutex::new(Subscriptions::default()),
            buffer: Mutex::new(VecDeque::new()),
            recent: Mutex::new(RecentIds::default()),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            counters: Counters::new(),
            exporter: None,
        }
    }

    /// Bound how long one `recv_message` call waits when nothing arrives.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Mirror counters into prometheus.
    pub fn with_metrics(mut self, exporter: MessagingMetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Client id used as sender id and private queue.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Key material used for signing, verification and encryption.
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Register a broker. Returns false on a malformed URL, an unreachable
    /// broker or options the keyring cannot honour. Adding a known URL again
    /// is a successful no-op.
    pub fn add_broker(&self, url: &str, options: BrokerOptions) -> bool {
        let parsed = match BrokerUrl::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(broker = %url, error = %err, "rejecting broker");
                return false;
            }
        };
        if (options.sign && !self.keyring.can_sign())
            || (options.encrypt && !self.keyring.can_encrypt())
        {
            warn!(broker = %parsed, sign = options.sign, encrypt = options.encrypt, "broker requires key material that is not configured");
            return false;
        }
        if self.brokers.read().contains_key(parsed.as_str()) {
            debug!(broker = %parsed, "broker already registered");
            return true;
        }
        let transport = match self.connector.connect(&parsed) {
            Ok(transport) => transport,
            Err(err) => {
                warn!(broker = %parsed, error = %err, "broker unreachable");
                return false;
            }
        };
        let session = Arc::new(BrokerSession {
            url: parsed.clone(),
            options,
            transport,
        });
        self.brokers
            .write()
            .entry(parsed.as_str().to_owned())
            .or_insert(session);
        info!(client = %self.client_id, broker = %parsed, "broker added");

        if self.subscriptions.lock().active {
            if let Err(err) = self.subscribe() {
                warn!(broker = %parsed, error = %err, "subscription on new broker failed");
            }
        }
        true
    }

    /// Detach from one broker. Returns false when it was not registered.
    pub fn remove_broker(&self, url: &str) -> bool {
        let key = BrokerUrl::parse(url)
            .map(|parsed| parsed.as_str().to_owned())
            .unwrap_or_else(|_| url.trim().to_owned());
        let removed = self.brokers.write().shift_remove(&key);
        match removed {
            Some(session) => {
                session.transport.detach(&self.client_id);
                let mut subscriptions = self.subscriptions.lock();
                subscriptions.attached.remove(&key);
                subscriptions.done.retain(|(broker, _)| broker != &key);
                true
            }
            None => false,
        }
    }

    /// URLs of registered brokers, in registration order.
    pub fn brokers(&self) -> Vec<String> {
        self.brokers.read().keys().cloned().collect()
    }

    /// Routing pattern for inbound subscription and default destination.
    pub fn set_default_receiver_queue(&self, pattern: &str) {
        *self.default_receiver_queue.write() = pattern.to_owned();
        if self.subscriptions.lock().active {
            if let Err(err) = self.subscribe() {
                warn!(pattern, error = %err, "subscription to new default queue failed");
            }
        }
    }

    /// Current default receiver queue.
    pub fn default_receiver_queue(&self) -> String {
        self.default_receiver_queue.read().clone()
    }

    /// Subscribe to an additional pattern on every broker.
    pub fn add_subscription(&self, pattern: &str) -> Result<()> {
        let active = {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.extra.iter().any(|p| p == pattern) {
                subscriptions.extra.push(pattern.to_owned());
            }
            subscriptions.active
        };
        if active {
            self.subscribe()?;
        }
        Ok(())
    }

    /// Start consuming the client queue and the default receiver queue on every
    /// broker. Patterns already subscribed are skipped.
    pub fn subscribe(&self) -> Result<()> {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return Err(MessagingError::NoBrokers);
        }
        let mut patterns = vec![self.client_id.clone(), self.default_receiver_queue()];
        let (attached, done) = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.active = true;
            patterns.extend(subscriptions.extra.iter().cloned());
            (subscriptions.attached.clone(), subscriptions.done.clone())
        };

        for session in sessions {
            let key = session.url.as_str().to_owned();
            if !attached.contains(&key) {
                session
                    .transport
                    .attach(&self.client_id, session.options.advisory)?;
                self.subscriptions.lock().attached.insert(key.clone());
            }
            for pattern in &patterns {
                let entry = (key.clone(), pattern.clone());
                if done.contains(&entry) {
                    continue;
                }
                session.transport.subscribe(&self.client_id, pattern)?;
                debug!(client = %self.client_id, broker = %key, pattern = %pattern, "subscribed");
                self.subscriptions.lock().done.insert(entry);
            }
        }
        Ok(())
    }

    /// Send to the message's receiver queue, or the default queue when unset.
    ///
    /// Stamps sender id and time and assigns an id if the message has none.
    /// Every broker is attempted; the first failure is returned.
    pub fn send(&self, message: &mut Message) -> Result<()> {
        let _write_path = self.send_lock.lock();
        if message.id().is_empty() {
            message.new_id();
        }
        {
            let header = message.header_mut();
            header.sender_id = self.client_id.clone();
            header.sender_time = WallClock::now();
            if header.receiver_queue.is_empty() {
                header.receiver_queue = self.default_receiver_queue();
            }
        }

        let sessions = self.sessions();
        if sessions.is_empty() {
            self.record_dropped();
            warn!(message_id = %message.id(), "send failed: no broker configured");
            return Err(MessagingError::NoBrokers);
        }

        let mut first_error = None;
        for session in sessions {
            let outcome = self.prepare(message, &session.options).and_then(|frame| {
                session.transport.publish(&Delivery {
                    sender: &self.client_id,
                    receiver_queue: &message.header().receiver_queue,
                    kind: message.kind(),
                    frame: &frame,
                })
            });
            match outcome {
                Ok(recipients) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    if let Some(exporter) = &self.exporter {
                        exporter.observe_sent();
                    }
                    debug!(broker = %session.url, recipients, "frame published");
                    log_message(MessageDirection::Outbound, message);
                }
                Err(err) => {
                    self.record_dropped();
                    warn!(
                        broker = %session.url,
                        transport = session.transport.name(),
                        message_id = %message.id(),
                        error = %err,
                        "send failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Send to an explicit queue.
    pub fn send_to(&self, message: &mut Message, receiver_queue: &str) -> Result<()> {
        message.header_mut().receiver_queue = receiver_queue.to_owned();
        self.send(message)
    }

    /// Answer `inbound` by sending `reply` to its sender.
    pub fn reply(&self, reply: &mut Message, inbound: &Message) -> Result<()> {
        reply.set_reply(inbound);
        self.send_to(reply, &inbound.header().sender_id)
    }

    /// Next verified, decoded message, or `None` when nothing arrived within
    /// the receive timeout or `cancel` fired.
    ///
    /// Frames already buffered are returned first. Frames that fail to parse,
    /// verify or decode are logged, counted and skipped.
    pub fn recv_message(&self, cancel: Option<&CancellationToken>) -> Option<Message> {
        let _consumer = self.recv_lock.lock();
        let deadline = Instant::now() + self.recv_timeout;
        loop {
            if let Some(message) = self.recv_from_internal_buffer() {
                return Some(message);
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let sessions = self.sessions();
            if sessions.is_empty() {
                pause(cancel, remaining.min(RETRY_BACKOFF));
                continue;
            }
            for (idx, session) in sessions.iter().enumerate() {
                let wait = if idx == 0 {
                    remaining.min(POLL_SLICE)
                } else {
                    Duration::ZERO
                };
                match session.transport.fetch(&self.client_id, wait) {
                    Ok(frames) if !frames.is_empty() => {
                        debug!(broker = %session.url, frames = frames.len(), "fetched frames");
                        self.buffer.lock().extend(frames);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(broker = %session.url, error = %err, "receive failed");
                        pause(cancel, remaining.min(RETRY_BACKOFF));
                    }
                }
            }
        }
    }

    /// Next message already fetched from the network, without touching it again.
    pub fn recv_from_internal_buffer(&self) -> Option<Message> {
        loop {
            let frame = self.buffer.lock().pop_front()?;
            if let Some(message) = self.accept(&frame) {
                return Some(message);
            }
        }
    }

    /// Frames fetched but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MessagingMetrics {
        self.counters.snapshot()
    }

    /// Detach from every broker.
    pub fn disconnect(&self) {
        let sessions: Vec<_> = self.brokers.write().drain(..).map(|(_, s)| s).collect();
        for session in sessions {
            session.transport.detach(&self.client_id);
        }
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.attached.clear();
        subscriptions.done.clear();
    }

    fn sessions(&self) -> Vec<Arc<BrokerSession>> {
        self.brokers.read().values().cloned().collect()
    }

    fn prepare(&self, message: &Message, options: &BrokerOptions) -> Result<String> {
        let mut outbound = message.clone();
        if options.encrypt && !outbound.is_encrypted() {
            outbound.encode(&self.keyring)?;
        }
        if options.sign {
            outbound.sign(&self.keyring)?;
        }
        let frame = outbound.message_buffer();
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(MessagingError::MessageTooLarge {
                size: frame.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(frame)
    }

    fn accept(&self, frame: &str) -> Option<Message> {
        let mut message = match Message::parse(frame) {
            Ok(message) => message,
            Err(err) => {
                self.record_dropped();
                warn!(error = %err, bytes = frame.len(), "dropping unparseable frame");
                return None;
            }
        };
        if message.is_signed() {
            if let Err(err) = message.verify(&self.keyring) {
                self.record_dropped();
                warn!(message_id = %message.id(), sender = %message.header().sender_id, error = %err, "dropping unverifiable message");
                return None;
            }
        }
        if message.is_encrypted() {
            if let Err(err) = message.decode(&self.keyring) {
                self.record_dropped();
                warn!(message_id = %message.id(), sender = %message.header().sender_id, error = %err, "dropping undecodable message");
                return None;
            }
        }
        if !self.recent.lock().insert(message.id()) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            if let Some(exporter) = &self.exporter {
                exporter.observe_duplicate();
            }
            debug!(message_id = %message.id(), "discarding repeated message");
            return None;
        }
        {
            let header = message.header_mut();
            header.receiver_id = self.client_id.clone();
            header.receiver_time = WallClock::now();
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_received();
        }
        log_message(MessageDirection::Inbound, &message);
        Some(message)
    }

    fn record_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(exporter) = &self.exporter {
            exporter.observe_dropped();
        }
    }
}

impl Drop for MessageClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn pause(cancel: Option<&CancellationToken>, duration: Duration) {
    match cancel {
        Some(token) => {
            token.wait_for(duration);
        }
        None => thread::sleep(duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::transport::{InMemoryBroker, InMemoryNetwork};
    use xmq_security::KeyFile;

    const URL: &str = "mem://broker:1097//xmessage/";

    fn network() -> (Arc<InMemoryNetwork>, Arc<InMemoryBroker>) {
        let network = Arc::new(InMemoryNetwork::new());
        let broker = network.add_broker("broker:1097");
        (network, broker)
    }

    fn client(network: &Arc<InMemoryNetwork>, id: &str, keyring: Arc<Keyring>) -> MessageClient {
        MessageClient::new(Some(id), keyring, network.clone())
            .with_recv_timeout(Duration::from_millis(200))
    }

    fn shared_keyring() -> Arc<Keyring> {
        Arc::new(Keyring::from_key_file(KeyFile::generate("cluster")).expect("keyring"))
    }

    #[test]
    fn add_broker_validates_and_is_idempotent() {
        let (network, _) = network();
        let client = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        assert!(!client.add_broker("not a url", BrokerOptions::default()));
        assert!(!client.add_broker("mem://nowhere:1//q", BrokerOptions::default()));
        assert!(client.add_broker(URL, BrokerOptions::default()));
        assert!(client.add_broker(URL, BrokerOptions::default()));
        assert_eq!(client.brokers().len(), 1);
    }

    #[test]
    fn add_broker_rejects_auth_without_keys() {
        let (network, _) = network();
        let client = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        let signed = BrokerOptions {
            sign: true,
            ..BrokerOptions::default()
        };
        assert!(!client.add_broker(URL, signed));
    }

    #[test]
    fn send_and_receive_through_default_queue() {
        let (network, _) = network();
        let sender = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        let receiver = client(&network, "/eos/b/fst", Arc::new(Keyring::plain()));
        for c in [&sender, &receiver] {
            c.set_default_receiver_queue("/eos/*/fst");
            assert!(c.add_broker(URL, BrokerOptions::default()));
            c.subscribe().expect("subscribe");
        }
        receiver.subscribe().expect("re-subscribe is a no-op");

        let mut message = Message::new("hello");
        message.set_body("payload");
        sender.send(&mut message).expect("send");

        let received = receiver.recv_message(None).expect("message");
        assert_eq!(received.body(), "payload");
        assert_eq!(received.header().sender_id, "/eos/a/fst");
        assert_eq!(received.header().receiver_id, "/eos/b/fst");
        assert!(sender.recv_message(None).is_none());
        assert_eq!(sender.metrics().sent, 1);
        assert_eq!(receiver.metrics().received, 1);
    }

    #[test]
    fn reply_reaches_original_sender() {
        let (network, _) = network();
        let a = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        let b = client(&network, "/eos/b/mgm", Arc::new(Keyring::plain()));
        for c in [&a, &b] {
            assert!(c.add_broker(URL, BrokerOptions::default()));
            c.subscribe().expect("subscribe");
        }
        let mut question = Message::with_type("ping", MessageType::Query);
        a.send_to(&mut question, "/eos/b/mgm").expect("send");
        let inbound = b.recv_message(None).expect("question");

        let mut answer = Message::new("pong");
        b.reply(&mut answer, &inbound).expect("reply");
        let received = a.recv_message(None).expect("answer");
        assert_eq!(received.header().reply_id, question.id());
    }

    #[test]
    fn signed_and_encrypted_traffic_is_accepted() {
        let (network, _) = network();
        let keys = shared_keyring();
        let options = BrokerOptions {
            sign: true,
            encrypt: true,
            ..BrokerOptions::default()
        };
        let a = client(&network, "/eos/a/fst", keys.clone());
        let b = client(&network, "/eos/b/fst", keys);
        for c in [&a, &b] {
            assert!(c.add_broker(URL, options));
            c.subscribe().expect("subscribe");
        }
        let mut message = Message::new("secret");
        message.set_body("k=v");
        a.send_to(&mut message, "/eos/b/fst").expect("send");
        let received = b.recv_message(None).expect("delivered");
        assert_eq!(received.body(), "k=v");
        assert!(!received.is_encrypted());
    }

    #[test]
    fn bad_frames_and_repeats_are_dropped_not_delivered() {
        let (network, broker) = network();
        let b = client(&network, "/eos/b/fst", Arc::new(Keyring::plain()));
        assert!(b.add_broker(URL, BrokerOptions::default()));
        b.subscribe().expect("subscribe");

        let good = Message::new("once").message_buffer();
        for frame in ["garbage", good.as_str(), good.as_str()] {
            broker
                .publish(&Delivery {
                    sender: "/eos/x/fst",
                    receiver_queue: "/eos/b/fst",
                    kind: MessageType::Plain,
                    frame,
                })
                .expect("publish");
        }
        assert!(b.recv_message(None).is_some());
        assert!(b.recv_message(None).is_none());
        let metrics = b.metrics();
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.duplicates, 1);
        assert_eq!(metrics.received, 1);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let (network, _) = network();
        let a = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        assert!(a.add_broker(URL, BrokerOptions::default()));
        let mut message = Message::new("huge");
        message.set_body("x".repeat(MAX_MESSAGE_SIZE + 1));
        assert!(matches!(
            a.send(&mut message),
            Err(MessagingError::MessageTooLarge { .. })
        ));
        assert_eq!(a.metrics().dropped, 1);
    }

    #[test]
    fn send_failure_is_reported_for_retry() {
        let (network, broker) = network();
        let a = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        assert!(a.add_broker(URL, BrokerOptions::default()));
        broker.set_online(false);
        let mut message = Message::new("retry me");
        assert!(a.send(&mut message).is_err());
        broker.set_online(true);
        a.send(&mut message).expect("retry succeeds");
    }

    #[test]
    fn internal_buffer_preserves_order() {
        let (network, _) = network();
        let a = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
        let b = client(&network, "/eos/b/fst", Arc::new(Keyring::plain()));
        for c in [&a, &b] {
            assert!(c.add_broker(URL, BrokerOptions::default()));
            c.subscribe().expect("subscribe");
        }
        for idx in 0..5 {
            let mut message = Message::new("seq");
            message.set_body(idx.to_string());
            a.send_to(&mut message, "/eos/b/fst").expect("send");
        }
        assert!(b.recv_from_internal_buffer().is_none());
        assert_eq!(b.recv_message(None).expect("first").body(), "0");
        assert_eq!(b.buffered(), 4);
        let rest: Vec<String> = std::iter::from_fn(|| b.recv_from_internal_buffer())
            .map(Message::into_body)
            .collect();
        assert_eq!(rest, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn cancelled_receive_returns_promptly() {
        let (network, _) = network();
        let b = MessageClient::new(Some("/eos/b/fst"), Arc::new(Keyring::plain()), network.clone())
            .with_recv_timeout(Duration::from_secs(30));
        assert!(b.add_broker(URL, BrokerOptions::default()));
        b.subscribe().expect("subscribe");
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(b.recv_message(Some(&token)).is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn drop_detaches_from_broker() {
        let (network, broker) = network();
        {
            let a = client(&network, "/eos/a/fst", Arc::new(Keyring::plain()));
            assert!(a.add_broker(URL, BrokerOptions::default()));
            a.subscribe().expect("subscribe");
            assert_eq!(broker.clients(), vec!["/eos/a/fst".to_owned()]);
        }
        assert!(broker.clients().is_empty());
    }
}
