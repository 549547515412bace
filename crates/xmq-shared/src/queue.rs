//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::object::{Entry, ObjectContext, ObjectCore, Op, Pending};
use crate::{ObjectKind, Result, SharedObjectError};

/// Replicated ordered sequence of keyed entries.
///
/// Same transaction and broadcast behaviour as [`crate::SharedHash`]; keys are
/// unique and entries keep the order in which they were pushed.
pub struct SharedQueue {
    core: ObjectCore,
    next_id: AtomicU64,
}

impl SharedQueue {
    pub(crate) fn new(subject: &str, broadcast_queue: &str, ctx: Arc<ObjectContext>) -> Self {
        Self {
            core: ObjectCore::new(subject, broadcast_queue, ObjectKind::Queue, ctx),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn core(&self) -> &ObjectCore {
        &self.core
    }

    /// Subject name.
    pub fn subject(&self) -> &str {
        self.core.subject()
    }

    /// Pattern reaching every holder of this subject.
    pub fn broadcast_queue(&self) -> String {
        self.core.broadcast_queue()
    }

    /// See [`crate::SharedHash::open_transaction`].
    pub fn open_transaction(&self) -> bool {
        self.core.open_transaction()
    }

    /// See [`crate::SharedHash::close_transaction`].
    pub fn close_transaction(&self) -> Result<()> {
        self.core.close_transaction()
    }

    /// True between open and close.
    pub fn in_transaction(&self) -> bool {
        self.core.in_transaction()
    }

    /// Append an entry and return its key. An empty `key` takes the next free
    /// numeric id.
    pub fn push_back(&self, key: &str, value: &str) -> Result<String> {
        if value.is_empty() {
            return Err(SharedObjectError::EmptyValue(key.to_owned()));
        }
        self.core.ctx().sets.fetch_add(1, Ordering::Relaxed);
        self.core.mutate_with(|pending, store| {
            let key = if key.is_empty() {
                loop {
                    let candidate = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
                    if !present(pending, store, &candidate) {
                        break candidate;
                    }
                }
            } else if present(pending, store, key) {
                return Err(SharedObjectError::DuplicateKey(key.to_owned()));
            } else {
                key.to_owned()
            };
            pending.stage(key.clone(), Op::Set(value.to_owned()));
            Ok(key)
        })
    }

    /// Remove the head entry and return its value.
    pub fn pop_front(&self) -> Result<Option<String>> {
        self.core.mutate_with(|pending, store| {
            // untouched committed entries come first, staged pushes follow in order
            let head = store
                .keys()
                .find(|key| !pending.clear && !pending.ops.contains_key(key.as_str()))
                .or_else(|| {
                    pending
                        .ops
                        .iter()
                        .find(|(_, op)| op.value().is_some())
                        .map(|(key, _)| key)
                })
                .cloned();
            let Some(key) = head else {
                return Ok(None);
            };
            let value = match pending.ops.get(&key).and_then(Op::value) {
                Some(value) => Some(value.to_owned()),
                None => store.get(&key).map(|entry| entry.value.clone()),
            };
            pending.stage(key, Op::Delete);
            Ok(value)
        })
    }

    /// Committed head entry.
    pub fn front(&self) -> Option<(String, String)> {
        self.core.first()
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.core.get(key)
    }

    /// Remove `key` wherever it sits; see [`crate::SharedHash::delete`].
    pub fn delete(&self, key: &str, broadcast: bool) -> Result<()> {
        if !broadcast {
            self.core.delete_local(key);
            return Ok(());
        }
        self.core.mutate(key.to_owned(), Op::Delete)
    }

    /// Remove every entry; with `broadcast` remote copies are cleared too.
    pub fn clear(&self, broadcast: bool) -> Result<()> {
        self.core.clear(broadcast)
    }

    /// Snapshot of the committed entries in queue order. Taken under the
    /// object's lock, so iterating it needs no further locking.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.core.contents()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// True when no entry is committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change counter of `key`.
    pub fn change_id(&self, key: &str) -> Option<u64> {
        self.core.entry(key).map(|entry| entry.change_id)
    }

    /// Ask every holder to resend its state, to `target` or the broadcast queue.
    pub fn broadcast_request(&self, target: Option<&str>) -> Result<()> {
        self.core.broadcast_request(target)
    }

    /// Send the full state to `receiver`.
    pub fn broadcast_state(&self, receiver: &str) -> Result<()> {
        self.core.broadcast_state(receiver)
    }

    /// Diagnostic rendering in queue order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.core.dump(&mut out);
        out
    }
}

/// Whether `key` exists once the staged operations are applied.
fn present(pending: &Pending, store: &IndexMap<String, Entry>, key: &str) -> bool {
    match pending.ops.get(key) {
        Some(op) => op.value().is_some(),
        None => !pending.clear && store.contains_key(key),
    }
}
