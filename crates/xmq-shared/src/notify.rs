//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// What happened to a subject or key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Subject registered.
    Creation,
    /// Subject removed.
    Deletion,
    /// Key written.
    Modification,
    /// Key removed.
    KeyDeletion,
}

/// One change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Affected subject.
    pub subject: String,
    /// Affected key for key level events.
    pub key: Option<String>,
    /// Event type.
    pub kind: NotificationKind,
}

/// Change event queue, drained by the consumer. Off until enabled.
#[derive(Default)]
pub(crate) struct Notifier {
    enabled: AtomicBool,
    events: Mutex<VecDeque<Notification>>,
}

impl Notifier {
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.events.lock().clear();
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn subject(&self, subject: &str, kind: NotificationKind) {
        self.push(subject, None, kind);
    }

    pub(crate) fn key(&self, subject: &str, key: &str, kind: NotificationKind) {
        self.push(subject, Some(key), kind);
    }

    pub(crate) fn drain(&self) -> Vec<Notification> {
        self.events.lock().drain(..).collect()
    }

    fn push(&self, subject: &str, key: Option<&str>, kind: NotificationKind) {
        if !self.is_enabled() {
            return;
        }
        trace!(subject, key, ?kind, "notification");
        self.events.lock().push_back(Notification {
            subject: subject.to_owned(),
            key: key.map(str::to_owned),
            kind,
        });
    }
}
