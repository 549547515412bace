//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};
use tracing::debug;

use crate::message::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message handed to a broker.
    Outbound,
    /// Message accepted from a broker.
    Inbound,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &Message) {
    let header = message.header();
    debug!(
        message_id = %header.message_id,
        kind = ?header.kind,
        description = %header.description,
        sender = %header.sender_id,
        queue = %header.receiver_queue,
        auth = ?message.auth_state(),
        bytes = message.body().len(),
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for messaging activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    duplicates: IntCounter,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "xmq_messages_sent_total",
            "Messages handed to brokers",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "xmq_messages_received_total",
            "Messages accepted from brokers",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "xmq_messages_dropped_total",
            "Messages that failed to send or to decode",
        ))?;
        let duplicates = IntCounter::with_opts(Opts::new(
            "xmq_messages_duplicate_total",
            "Inbound messages discarded as repeats",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(duplicates.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            duplicates,
        })
    }

    /// Record a sent message.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a dropped message.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a discarded repeat.
    pub fn observe_duplicate(&self) {
        self.duplicates.inc();
    }
}
