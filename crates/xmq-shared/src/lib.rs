//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Shared objects are named key/value structures that every node caches
//! locally and keeps current by exchanging update messages. Local writes are
//! batched in transactions and broadcast on close; inbound updates are
//! applied by the [`SharedObjectManager`], usually fed by a
//! [`MessagingListener`] thread.
#![warn(missing_docs)]

pub mod dumper;
pub mod hash;
pub mod listener;
pub mod manager;
pub mod notify;
mod object;
pub mod queue;
pub mod realm;
pub mod wire;

use std::fmt;
use std::str::FromStr;

use xmq_msg::MessagingError;

/// Shared result type for shared object operations.
pub type Result<T> = std::result::Result<T, SharedObjectError>;

/// Kind tag of a registered subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Unordered key/value mapping.
    Hash,
    /// Ordered key/value sequence.
    Queue,
}

impl ObjectKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Hash => "hash",
            ObjectKind::Queue => "queue",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = SharedObjectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(ObjectKind::Hash),
            "queue" => Ok(ObjectKind::Queue),
            other => Err(SharedObjectError::Protocol(format!(
                "unknown object type '{other}'"
            ))),
        }
    }
}

/// Failures of shared object operations and inbound update handling.
#[derive(Debug, thiserror::Error)]
pub enum SharedObjectError {
    /// A subject is already registered with the other kind.
    #[error("subject '{subject}' is a {existing}, not a {requested}")]
    KindMismatch {
        /// Subject name.
        subject: String,
        /// Kind in the registry.
        existing: ObjectKind,
        /// Kind asked for.
        requested: ObjectKind,
    },
    /// No object is registered under the subject.
    #[error("unknown subject '{0}'")]
    UnknownSubject(String),
    /// Keys must be non-empty.
    #[error("empty key")]
    EmptyKey,
    /// Values must be non-empty.
    #[error("empty value for key '{0}'")]
    EmptyValue(String),
    /// A queue already holds an entry with this key.
    #[error("queue already holds key '{0}'")]
    DuplicateKey(String),
    /// An inbound update is structurally unusable.
    #[error("malformed shared object message: {0}")]
    Protocol(String),
    /// Sending the update failed; local state is already committed.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// Wrapper for IO errors while dumping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use dumper::{dump_to_file, FileDumper};
pub use hash::SharedHash;
pub use listener::MessagingListener;
pub use manager::{SharedObject, SharedObjectManager, SharedObjectStats};
pub use notify::{Notification, NotificationKind};
pub use queue::SharedQueue;
pub use realm::MessagingRealm;
