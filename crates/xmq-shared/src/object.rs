//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! State and replication mechanics shared by hashes and queues.
//!
//! Lock order is `tx` before `store`. Neither lock is held while a message is
//! sent. Updates are applied and given a send slot under `tx`, so they leave
//! in the order the local store saw them.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};
use xmq_common::time::age;
use xmq_msg::{Message, MessageClient, MessageType};

use crate::notify::{NotificationKind, Notifier};
use crate::wire::{Command, SharedMessage, WireKey, WirePair};
use crate::{ObjectKind, Result};

const UPDATE_DESCRIPTION: &str = "shared object update";
const REQUEST_DESCRIPTION: &str = "shared object broadcast request";
const REPLY_DESCRIPTION: &str = "shared object broadcast reply";
const REMOVE_DESCRIPTION: &str = "shared object remove";

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) value: String,
    pub(crate) change_id: u64,
    pub(crate) mtime: DateTime<Utc>,
}

impl Entry {
    fn new(value: String, change_id: u64) -> Self {
        Self {
            value,
            change_id,
            mtime: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Set(String),
    Delete,
    /// Set staged after a delete of the same key. Queues move the entry to
    /// the tail.
    Requeue(String),
}

impl Op {
    pub(crate) fn value(&self) -> Option<&str> {
        match self {
            Op::Set(value) | Op::Requeue(value) => Some(value),
            Op::Delete => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) open: bool,
    pub(crate) clear: bool,
    pub(crate) ops: IndexMap<String, Op>,
}

impl Pending {
    pub(crate) fn stage(&mut self, key: String, op: Op) {
        let deleted = matches!(self.ops.get(&key), Some(Op::Delete | Op::Requeue(_)));
        match op {
            Op::Set(value) if deleted => {
                self.ops.shift_remove(&key);
                self.ops.insert(key, Op::Requeue(value));
            }
            // later writes to a key replace earlier ones but keep the first position
            op => {
                self.ops.insert(key, op);
            }
        }
    }
}

/// Send slots handed out under the transaction lock.
#[derive(Default)]
struct SendOrder {
    issued: AtomicU64,
    turn: Mutex<u64>,
    ready: Condvar,
}

impl SendOrder {
    fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::Relaxed)
    }

    /// Block until every earlier ticket has been released.
    fn wait(&self, ticket: u64) -> Turn<'_> {
        let mut turn = self.turn.lock();
        while *turn != ticket {
            self.ready.wait(&mut turn);
        }
        Turn { order: self }
    }
}

/// Releases the next slot when dropped.
struct Turn<'a> {
    order: &'a SendOrder,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        *self.order.turn.lock() += 1;
        self.order.ready.notify_all();
    }
}

struct MuxBatch {
    queue: String,
    update: SharedMessage,
}

impl MuxBatch {
    fn merge(&mut self, update: SharedMessage) {
        let subject = update.subjects[0].clone();
        let index = match self.update.subjects.iter().position(|s| *s == subject) {
            Some(index) => index,
            None => {
                self.update.subjects.push(subject);
                self.update.subjects.len() - 1
            }
        };
        if update.clears(0) {
            self.update.pairs.retain(|pair| pair.subject != Some(index));
            self.update.deletions.retain(|key| key.subject != Some(index));
            if !self.update.clears(index) {
                self.update.cleared.push(index);
            }
        }
        // the latest operation on a key supersedes the batched one
        for key in update.deletions {
            self.forget(index, &key.key);
            self.update.deletions.push(WireKey {
                subject: Some(index),
                ..key
            });
        }
        for pair in update.pairs {
            self.forget(index, &pair.key);
            self.update.pairs.push(WirePair {
                subject: Some(index),
                ..pair
            });
        }
    }

    fn forget(&mut self, index: usize, key: &str) {
        self.update
            .pairs
            .retain(|pair| pair.subject != Some(index) || pair.key != key);
        self.update
            .deletions
            .retain(|entry| entry.subject != Some(index) || entry.key != key);
    }
}

/// Collaborators every object of one manager shares.
pub(crate) struct ObjectContext {
    client: Arc<MessageClient>,
    broadcast: AtomicBool,
    pub(crate) notifier: Notifier,
    mux: Mutex<Option<MuxBatch>>,
    pub(crate) sets: AtomicU64,
    pub(crate) gets: AtomicU64,
}

impl ObjectContext {
    pub(crate) fn new(client: Arc<MessageClient>) -> Self {
        Self {
            client,
            broadcast: AtomicBool::new(true),
            notifier: Notifier::default(),
            mux: Mutex::new(None),
            sets: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    pub(crate) fn client(&self) -> &Arc<MessageClient> {
        &self.client
    }

    pub(crate) fn set_broadcast(&self, enabled: bool) {
        self.broadcast.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn broadcast_enabled(&self) -> bool {
        self.broadcast.load(Ordering::Relaxed)
    }

    pub(crate) fn open_mux(&self, queue: &str) -> bool {
        let mut mux = self.mux.lock();
        if mux.is_some() {
            return false;
        }
        let mut update = SharedMessage::new(Command::Update, String::new(), ObjectKind::Hash);
        update.subjects.clear();
        *mux = Some(MuxBatch {
            queue: queue.to_owned(),
            update,
        });
        true
    }

    pub(crate) fn close_mux(&self) -> Result<bool> {
        let Some(batch) = self.mux.lock().take() else {
            return Ok(false);
        };
        if batch.update.subjects.is_empty() || batch.update.is_empty() {
            return Ok(true);
        }
        self.send(
            &batch.update,
            &batch.queue,
            MessageType::Monitor,
            UPDATE_DESCRIPTION,
        )?;
        Ok(true)
    }

    pub(crate) fn send(
        &self,
        update: &SharedMessage,
        queue: &str,
        kind: MessageType,
        description: &str,
    ) -> Result<()> {
        let mut message = Message::with_type(description, kind);
        message.set_body(update.encode());
        let outcome = self.client.send_to(&mut message, queue);
        match &outcome {
            Ok(()) => debug!(
                subjects = ?update.subjects,
                queue,
                command = update.command.as_str(),
                pairs = update.pairs.len(),
                deletions = update.deletions.len(),
                message_id = %message.id(),
                "shared object message sent"
            ),
            Err(err) => warn!(
                subjects = ?update.subjects,
                queue,
                command = update.command.as_str(),
                error = %err,
                "shared object message not sent"
            ),
        }
        outcome.map_err(Into::into)
    }

    fn batch(&self, update: SharedMessage) -> Option<SharedMessage> {
        match self.mux.lock().as_mut() {
            Some(batch) if update.kind == ObjectKind::Hash => {
                batch.merge(update);
                None
            }
            _ => Some(update),
        }
    }
}

/// One replicated subject.
pub(crate) struct ObjectCore {
    subject: String,
    kind: ObjectKind,
    broadcast_queue: RwLock<String>,
    store: RwLock<IndexMap<String, Entry>>,
    tx: Mutex<Pending>,
    order: SendOrder,
    ctx: Arc<ObjectContext>,
}

impl ObjectCore {
    pub(crate) fn new(
        subject: &str,
        broadcast_queue: &str,
        kind: ObjectKind,
        ctx: Arc<ObjectContext>,
    ) -> Self {
        Self {
            subject: subject.to_owned(),
            kind,
            broadcast_queue: RwLock::new(broadcast_queue.to_owned()),
            store: RwLock::new(IndexMap::new()),
            tx: Mutex::new(Pending::default()),
            order: SendOrder::default(),
            ctx,
        }
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub(crate) fn broadcast_queue(&self) -> String {
        self.broadcast_queue.read().clone()
    }

    pub(crate) fn set_broadcast_queue(&self, queue: &str) {
        *self.broadcast_queue.write() = queue.to_owned();
    }

    pub(crate) fn ctx(&self) -> &ObjectContext {
        &self.ctx
    }

    pub(crate) fn open_transaction(&self) -> bool {
        let mut tx = self.tx.lock();
        if tx.open {
            debug!(subject = %self.subject, "transaction already open");
            return false;
        }
        tx.open = true;
        tx.clear = false;
        tx.ops.clear();
        true
    }

    pub(crate) fn close_transaction(&self) -> Result<()> {
        let (update, ticket) = {
            let mut tx = self.tx.lock();
            if !tx.open {
                debug!(subject = %self.subject, "no open transaction");
                return Ok(());
            }
            let update = self.apply_pending(std::mem::take(&mut *tx));
            (update, self.order.ticket())
        };
        self.publish(update, ticket)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.tx.lock().open
    }

    /// Stage or directly commit a keyed operation.
    pub(crate) fn mutate(&self, key: String, op: Op) -> Result<()> {
        if matches!(op, Op::Set(_)) {
            self.ctx.sets.fetch_add(1, Ordering::Relaxed);
        }
        self.mutate_with(|pending, _| {
            pending.stage(key, op);
            Ok(())
        })
    }

    /// Run `f` against the pending buffer and the committed store. Outside a
    /// transaction the buffer holds just this call and is applied at once.
    pub(crate) fn mutate_with<T>(
        &self,
        f: impl FnOnce(&mut Pending, &IndexMap<String, Entry>) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.tx.lock();
        if tx.open {
            let store = self.store.read();
            return f(&mut *tx, &*store);
        }
        let mut single = Pending::default();
        let result = {
            let store = self.store.read();
            f(&mut single, &*store)?
        };
        let update = self.apply_pending(single);
        let ticket = self.order.ticket();
        drop(tx);
        self.publish(update, ticket)?;
        Ok(result)
    }

    pub(crate) fn clear(&self, broadcast: bool) -> Result<()> {
        if !broadcast {
            let removed: Vec<String> = self.store.write().drain(..).map(|(key, _)| key).collect();
            self.notify_removed(&removed);
            return Ok(());
        }
        self.mutate_with(|pending, _| {
            pending.clear = true;
            pending.ops.clear();
            Ok(())
        })
    }

    pub(crate) fn delete_local(&self, key: &str) -> bool {
        let removed = self.store.write().shift_remove(key).is_some();
        if removed {
            self.ctx
                .notifier
                .key(&self.subject, key, NotificationKind::KeyDeletion);
        }
        removed
    }

    /// Apply staged operations to the store and describe them as an update.
    fn apply_pending(&self, pending: Pending) -> SharedMessage {
        let mut update = SharedMessage::new(Command::Update, self.subject.clone(), self.kind);
        let mut removed = Vec::new();
        {
            let mut store = self.store.write();
            if pending.clear {
                removed.extend(store.drain(..).map(|(key, _)| key));
                update.cleared.push(0);
            }
            for (key, op) in pending.ops {
                match op {
                    Op::Requeue(value) if self.kind == ObjectKind::Queue => {
                        let change_id = match store.shift_remove(&key) {
                            Some(previous) => {
                                update.deletions.push(WireKey {
                                    subject: None,
                                    key: key.clone(),
                                });
                                previous.change_id + 1
                            }
                            None => 0,
                        };
                        store.insert(key.clone(), Entry::new(value.clone(), change_id));
                        update.pairs.push(WirePair {
                            subject: None,
                            key,
                            value,
                            change_id,
                        });
                    }
                    Op::Set(value) | Op::Requeue(value) => {
                        let change_id = write_entry(&mut store, &key, value.clone(), None);
                        update.pairs.push(WirePair {
                            subject: None,
                            key,
                            value,
                            change_id,
                        });
                    }
                    Op::Delete => {
                        if store.shift_remove(&key).is_some() {
                            removed.push(key.clone());
                            update.deletions.push(WireKey { subject: None, key });
                        }
                    }
                }
            }
        }
        self.notify_removed(&removed);
        for pair in &update.pairs {
            self.ctx
                .notifier
                .key(&self.subject, &pair.key, NotificationKind::Modification);
        }
        if update.pairs.is_empty() && update.cleared.is_empty() {
            update.command = Command::Delete;
        }
        update
    }

    /// Send `update` once every update holding an earlier ticket has gone.
    fn publish(&self, update: SharedMessage, ticket: u64) -> Result<()> {
        let _turn = self.order.wait(ticket);
        if update.is_empty() || !self.ctx.broadcast_enabled() {
            return Ok(());
        }
        let Some(update) = self.ctx.batch(update) else {
            return Ok(());
        };
        self.ctx.send(
            &update,
            &self.broadcast_queue(),
            MessageType::Monitor,
            UPDATE_DESCRIPTION,
        )
    }

    /// Apply the part of an inbound message addressed to subject `index`.
    /// Remote change ids are adopted; nothing is re-broadcast. Deletions go
    /// before pairs, so a requeued queue entry lands at the tail.
    pub(crate) fn apply_remote(&self, message: &SharedMessage, index: usize) {
        let mut removed = Vec::new();
        let mut modified = Vec::new();
        {
            let mut store = self.store.write();
            if message.command == Command::BroadcastReply || message.clears(index) {
                removed.extend(store.drain(..).map(|(key, _)| key));
            }
            for key in message.deletions_for(index) {
                if store.shift_remove(&key.key).is_some() {
                    removed.push(key.key.clone());
                }
            }
            for pair in message.pairs_for(index) {
                write_entry(
                    &mut store,
                    &pair.key,
                    pair.value.clone(),
                    Some(pair.change_id),
                );
                modified.push(pair.key.as_str());
            }
        }
        self.notify_removed(&removed);
        for key in modified {
            self.ctx
                .notifier
                .key(&self.subject, key, NotificationKind::Modification);
        }
    }

    pub(crate) fn broadcast_request(&self, target: Option<&str>) -> Result<()> {
        let mut request =
            SharedMessage::new(Command::BroadcastRequest, self.subject.clone(), self.kind);
        request.reply = Some(self.ctx.client().client_id().to_owned());
        let queue = target.map_or_else(|| self.broadcast_queue(), str::to_owned);
        self.ctx
            .send(&request, &queue, MessageType::Query, REQUEST_DESCRIPTION)
    }

    pub(crate) fn broadcast_state(&self, receiver: &str) -> Result<()> {
        if !self.ctx.broadcast_enabled() {
            debug!(subject = %self.subject, receiver, "broadcast muted, not replying");
            return Ok(());
        }
        let mut reply =
            SharedMessage::new(Command::BroadcastReply, self.subject.clone(), self.kind);
        let ticket = {
            let _tx = self.tx.lock();
            reply.pairs = self
                .store
                .read()
                .iter()
                .map(|(key, entry)| WirePair {
                    subject: None,
                    key: key.clone(),
                    value: entry.value.clone(),
                    change_id: entry.change_id,
                })
                .collect();
            self.order.ticket()
        };
        let _turn = self.order.wait(ticket);
        self.ctx
            .send(&reply, receiver, MessageType::Monitor, REPLY_DESCRIPTION)
    }

    pub(crate) fn send_remove(&self) -> Result<()> {
        if !self.ctx.broadcast_enabled() {
            return Ok(());
        }
        let remove = SharedMessage::new(Command::Remove, self.subject.clone(), self.kind);
        self.ctx.send(
            &remove,
            &self.broadcast_queue(),
            MessageType::Monitor,
            REMOVE_DESCRIPTION,
        )
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.ctx.gets.fetch_add(1, Ordering::Relaxed);
        self.store.read().get(key).map(|entry| entry.value.clone())
    }

    pub(crate) fn entry(&self, key: &str) -> Option<Entry> {
        self.store.read().get(key).cloned()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }

    pub(crate) fn contents(&self) -> Vec<(String, String)> {
        self.store
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    pub(crate) fn first(&self) -> Option<(String, String)> {
        self.store
            .read()
            .first()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
    }

    pub(crate) fn len(&self) -> usize {
        self.store.read().len()
    }

    pub(crate) fn age(&self, key: &str) -> Option<Duration> {
        self.store.read().get(key).map(|entry| age(entry.mtime))
    }

    /// Append the diagnostic rendering to `out`. Hash entries are sorted by key,
    /// queue entries keep queue order.
    pub(crate) fn dump(&self, out: &mut String) {
        let _ = write!(
            out,
            "=====\n{} [ {}=> {} ]\n-----\n",
            self.subject,
            self.kind,
            self.broadcast_queue()
        );
        let store = self.store.read();
        let mut entries: Vec<(&String, &Entry)> = store.iter().collect();
        if self.kind == ObjectKind::Hash {
            entries.sort_by(|a, b| a.0.cmp(b.0));
        }
        for (key, entry) in entries {
            let _ = writeln!(
                out,
                "key={:<24} value:{:<32} age:{:.2} changeid:{}",
                key,
                entry.value,
                age(entry.mtime).as_secs_f64(),
                entry.change_id
            );
        }
    }

    fn notify_removed(&self, keys: &[String]) {
        for key in keys {
            self.ctx
                .notifier
                .key(&self.subject, key, NotificationKind::KeyDeletion);
        }
    }
}

/// Write `value` under `key`, keeping the key's position. New keys start at
/// change id 0 unless a remote id is adopted. Returns the resulting change id.
fn write_entry(
    store: &mut IndexMap<String, Entry>,
    key: &str,
    value: String,
    remote_change_id: Option<u64>,
) -> u64 {
    match store.get_mut(key) {
        Some(entry) => {
            entry.change_id = remote_change_id.unwrap_or(entry.change_id + 1);
            entry.value = value;
            entry.mtime = Utc::now();
            entry.change_id
        }
        None => {
            let change_id = remote_change_id.unwrap_or(0);
            store.insert(key.to_owned(), Entry::new(value, change_id));
            change_id
        }
    }
}
