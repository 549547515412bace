//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Registry of shared objects and dispatcher for inbound updates.
//!
//! The registry lock only guards the subject map. It is released before any
//! message is sent, so slow brokers never block readers.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use xmq_common::config::SharedConfig;
use xmq_msg::{Message, MessageClient};

use crate::hash::SharedHash;
use crate::notify::{Notification, NotificationKind};
use crate::object::{ObjectContext, ObjectCore};
use crate::queue::SharedQueue;
use crate::wire::{Command, SharedMessage};
use crate::{ObjectKind, Result, SharedObjectError};

/// Registered object of either kind.
#[derive(Clone)]
pub enum SharedObject {
    /// A shared hash.
    Hash(Arc<SharedHash>),
    /// A shared queue.
    Queue(Arc<SharedQueue>),
}

impl SharedObject {
    /// Kind tag.
    pub fn kind(&self) -> ObjectKind {
        match self {
            SharedObject::Hash(_) => ObjectKind::Hash,
            SharedObject::Queue(_) => ObjectKind::Queue,
        }
    }

    /// Subject name.
    pub fn subject(&self) -> &str {
        self.core().subject()
    }

    /// The hash, when this is one.
    pub fn as_hash(&self) -> Option<&Arc<SharedHash>> {
        match self {
            SharedObject::Hash(hash) => Some(hash),
            SharedObject::Queue(_) => None,
        }
    }

    /// The queue, when this is one.
    pub fn as_queue(&self) -> Option<&Arc<SharedQueue>> {
        match self {
            SharedObject::Queue(queue) => Some(queue),
            SharedObject::Hash(_) => None,
        }
    }

    /// Diagnostic rendering.
    pub fn dump(&self) -> String {
        match self {
            SharedObject::Hash(hash) => hash.dump(),
            SharedObject::Queue(queue) => queue.dump(),
        }
    }

    pub(crate) fn core(&self) -> &ObjectCore {
        match self {
            SharedObject::Hash(hash) => hash.core(),
            SharedObject::Queue(queue) => queue.core(),
        }
    }
}

/// Registry counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SharedObjectStats {
    /// Registered hashes.
    pub hashes: usize,
    /// Registered queues.
    pub queues: usize,
    /// Local writes through `set`/`push_back`.
    pub sets: u64,
    /// Local reads through `get`.
    pub gets: u64,
}

/// Owner of every shared object of one messaging realm.
pub struct SharedObjectManager {
    ctx: Arc<ObjectContext>,
    objects: RwLock<HashMap<String, SharedObject>>,
    auto_create: bool,
    auto_reply_queue: Option<String>,
    derive_auto_reply: bool,
}

impl SharedObjectManager {
    /// Manager publishing through `client` with default behaviour.
    pub fn new(client: Arc<MessageClient>) -> Self {
        Self::with_config(client, &SharedConfig::default())
    }

    /// Manager configured from the `[shared]` section.
    pub fn with_config(client: Arc<MessageClient>, config: &SharedConfig) -> Self {
        let ctx = Arc::new(ObjectContext::new(client));
        ctx.set_broadcast(config.broadcast);
        ctx.notifier.set_enabled(config.notifications);
        Self {
            ctx,
            objects: RwLock::new(HashMap::new()),
            auto_create: config.auto_create,
            auto_reply_queue: config.auto_reply_queue.clone(),
            derive_auto_reply: config.derive_auto_reply,
        }
    }

    /// Client used for all outbound traffic.
    pub fn client(&self) -> &Arc<MessageClient> {
        self.ctx.client()
    }

    /// Register a hash, or return the one already registered under `subject`.
    pub fn create_shared_hash(&self, subject: &str, broadcast_queue: &str) -> Result<Arc<SharedHash>> {
        match self.create_shared_object(subject, broadcast_queue, ObjectKind::Hash)? {
            SharedObject::Hash(hash) => Ok(hash),
            SharedObject::Queue(_) => Err(mismatch(subject, ObjectKind::Queue, ObjectKind::Hash)),
        }
    }

    /// Register a queue, or return the one already registered under `subject`.
    pub fn create_shared_queue(
        &self,
        subject: &str,
        broadcast_queue: &str,
    ) -> Result<Arc<SharedQueue>> {
        match self.create_shared_object(subject, broadcast_queue, ObjectKind::Queue)? {
            SharedObject::Queue(queue) => Ok(queue),
            SharedObject::Hash(_) => Err(mismatch(subject, ObjectKind::Hash, ObjectKind::Queue)),
        }
    }

    /// Register an object of `kind`. Creating an existing subject again returns
    /// it and adopts the new broadcast queue; a different kind is an error.
    pub fn create_shared_object(
        &self,
        subject: &str,
        broadcast_queue: &str,
        kind: ObjectKind,
    ) -> Result<SharedObject> {
        let mut objects = self.objects.write();
        if let Some(existing) = objects.get(subject) {
            if existing.kind() != kind {
                warn!(subject, existing = %existing.kind(), requested = %kind, "subject kind mismatch");
                return Err(mismatch(subject, existing.kind(), kind));
            }
            existing.core().set_broadcast_queue(broadcast_queue);
            return Ok(existing.clone());
        }
        let object = match kind {
            ObjectKind::Hash => SharedObject::Hash(Arc::new(SharedHash::new(
                subject,
                broadcast_queue,
                self.ctx.clone(),
            ))),
            ObjectKind::Queue => SharedObject::Queue(Arc::new(SharedQueue::new(
                subject,
                broadcast_queue,
                self.ctx.clone(),
            ))),
        };
        objects.insert(subject.to_owned(), object.clone());
        drop(objects);
        info!(subject, kind = %kind, queue = broadcast_queue, "shared object created");
        self.ctx
            .notifier
            .subject(subject, NotificationKind::Creation);
        Ok(object)
    }

    /// Registered hash, if any.
    pub fn get_hash(&self, subject: &str) -> Option<Arc<SharedHash>> {
        self.lookup(subject)?.as_hash().cloned()
    }

    /// Registered queue, if any.
    pub fn get_queue(&self, subject: &str) -> Option<Arc<SharedQueue>> {
        self.lookup(subject)?.as_queue().cloned()
    }

    /// Registered object of `kind`, if any.
    pub fn get_object(&self, subject: &str, kind: ObjectKind) -> Option<SharedObject> {
        self.lookup(subject).filter(|object| object.kind() == kind)
    }

    /// Registered object of any kind.
    pub fn lookup(&self, subject: &str) -> Option<SharedObject> {
        self.objects.read().get(subject).cloned()
    }

    /// Unregister `subject`. With `broadcast` every other holder is told to
    /// drop it too. Returns whether it was registered.
    pub fn delete_shared_object(
        &self,
        subject: &str,
        kind: ObjectKind,
        broadcast: bool,
    ) -> Result<bool> {
        let removed = {
            let mut objects = self.objects.write();
            match objects.get(subject) {
                Some(existing) if existing.kind() != kind => {
                    return Err(mismatch(subject, existing.kind(), kind));
                }
                Some(_) => objects.remove(subject),
                None => None,
            }
        };
        let Some(object) = removed else {
            return Ok(false);
        };
        info!(subject, kind = %kind, "shared object deleted");
        self.ctx
            .notifier
            .subject(subject, NotificationKind::Deletion);
        if broadcast {
            object.core().send_remove()?;
        }
        Ok(true)
    }

    /// Registered subjects, sorted.
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.objects.read().keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Diagnostic rendering of every object, sorted by subject.
    pub fn dump_shared_objects(&self) -> String {
        let mut objects: Vec<SharedObject> = self.objects.read().values().cloned().collect();
        objects.sort_by(|a, b| a.subject().cmp(b.subject()));
        let mut out = String::new();
        for object in objects {
            object.core().dump(&mut out);
        }
        out
    }

    /// Unregister every object locally.
    pub fn clear(&self) {
        let subjects: Vec<String> = self.objects.write().drain().map(|(subject, _)| subject).collect();
        for subject in &subjects {
            self.ctx
                .notifier
                .subject(subject, NotificationKind::Deletion);
        }
        debug!(objects = subjects.len(), "shared objects cleared");
    }

    /// Mute or unmute all outbound shared object traffic.
    pub fn enable_broadcast(&self, enabled: bool) {
        self.ctx.set_broadcast(enabled);
    }

    /// Whether outbound traffic is enabled.
    pub fn broadcast_enabled(&self) -> bool {
        self.ctx.broadcast_enabled()
    }

    /// Start or stop queueing change notifications. Stopping discards queued events.
    pub fn enable_notifications(&self, enabled: bool) {
        self.ctx.notifier.set_enabled(enabled);
    }

    /// Drain queued change notifications.
    pub fn take_notifications(&self) -> Vec<Notification> {
        self.ctx.notifier.drain()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SharedObjectStats {
        let (hashes, queues) = self
            .objects
            .read()
            .values()
            .fold((0, 0), |(hashes, queues), object| match object.kind() {
                ObjectKind::Hash => (hashes + 1, queues),
                ObjectKind::Queue => (hashes, queues + 1),
            });
        SharedObjectStats {
            hashes,
            queues,
            sets: self.ctx.sets.load(Ordering::Relaxed),
            gets: self.ctx.gets.load(Ordering::Relaxed),
        }
    }

    /// Collect hash updates of every subject into one message for `queue`
    /// until [`close_mux_transaction`](Self::close_mux_transaction). Returns
    /// false when a mux transaction is already open.
    pub fn open_mux_transaction(&self, queue: &str) -> bool {
        self.ctx.open_mux(queue)
    }

    /// Send the collected updates. Returns false when none was open.
    pub fn close_mux_transaction(&self) -> Result<bool> {
        self.ctx.close_mux()
    }

    /// Apply an inbound shared object message.
    ///
    /// Every target that can be resolved is handled; the first failure (an
    /// unknown subject, a kind mismatch or a failed reply) is returned after
    /// the rest of the message has been applied.
    pub fn apply(&self, message: &Message) -> Result<()> {
        let update = SharedMessage::decode(message.body())?;
        if update.skipped > 0 {
            warn!(
                subjects = ?update.subjects,
                skipped = update.skipped,
                sender = %message.header().sender_id,
                "ignored malformed fields of inbound update"
            );
        }
        let mut first_error = None;

        if update.command == Command::Remove {
            for subject in self.remove_targets(&update) {
                if let Err(err) = self.delete_shared_object(&subject, update.kind, false) {
                    first_error.get_or_insert(err);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        let targets = self.resolve(&update, message, &mut first_error);
        for (object, index) in targets {
            let outcome = match update.command {
                Command::BroadcastRequest => {
                    let reply = update.reply.as_deref().unwrap_or_default();
                    object.core().broadcast_state(reply)
                }
                _ => {
                    object.core().apply_remote(&update, index);
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                warn!(subject = object.subject(), error = %err, "inbound command failed");
                first_error.get_or_insert(err);
            }
        }
        debug!(
            subjects = ?update.subjects,
            command = update.command.as_str(),
            sender = %message.header().sender_id,
            "inbound update applied"
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Objects addressed by each subject of `update`, with the subject index
    /// their pairs are tagged with.
    fn resolve(
        &self,
        update: &SharedMessage,
        message: &Message,
        first_error: &mut Option<SharedObjectError>,
    ) -> Vec<(SharedObject, usize)> {
        let mut targets = Vec::new();
        for (index, subject) in update.subjects.iter().enumerate() {
            if is_wildcard(subject) {
                let matched = self.matching(subject, update.kind);
                if matched.is_empty() {
                    debug!(subject = %subject, "no registered subject matches");
                }
                targets.extend(matched.into_iter().map(|object| (object, index)));
                continue;
            }
            match self.lookup(subject) {
                Some(object) if object.kind() == update.kind => targets.push((object, index)),
                Some(object) => {
                    warn!(subject = %subject, existing = %object.kind(), requested = %update.kind, "dropping update for subject of other kind");
                    first_error.get_or_insert(mismatch(subject, object.kind(), update.kind));
                }
                None if self.creates_on(update.command) => {
                    let queue = self.auto_reply_queue(subject, message);
                    match self.create_shared_object(subject, &queue, update.kind) {
                        Ok(object) => targets.push((object, index)),
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                None => {
                    warn!(subject = %subject, command = update.command.as_str(), sender = %message.header().sender_id, "dropping update for unknown subject");
                    first_error.get_or_insert(SharedObjectError::UnknownSubject(subject.clone()));
                }
            }
        }
        targets
    }

    fn remove_targets(&self, update: &SharedMessage) -> Vec<String> {
        let mut subjects = Vec::new();
        for subject in &update.subjects {
            if is_wildcard(subject) {
                subjects.extend(
                    self.matching(subject, update.kind)
                        .iter()
                        .map(|object| object.subject().to_owned()),
                );
            } else {
                subjects.push(subject.clone());
            }
        }
        subjects
    }

    fn matching(&self, pattern: &str, kind: ObjectKind) -> Vec<SharedObject> {
        self.objects
            .read()
            .iter()
            .filter(|(subject, object)| object.kind() == kind && wildcard_matches(pattern, subject))
            .map(|(_, object)| object.clone())
            .collect()
    }

    fn creates_on(&self, command: Command) -> bool {
        self.auto_create && matches!(command, Command::Update | Command::BroadcastReply)
    }

    /// Broadcast queue for a subject created from an inbound update: the
    /// configured queue, else the subject's first three path segments, else
    /// the sender.
    fn auto_reply_queue(&self, subject: &str, message: &Message) -> String {
        if let Some(queue) = &self.auto_reply_queue {
            return queue.clone();
        }
        if self.derive_auto_reply {
            if let Some(queue) = derive_reply_queue(subject) {
                return queue.to_owned();
            }
            debug!(subject, "cannot derive reply queue from subject");
        }
        message.header().sender_id.clone()
    }
}

fn mismatch(subject: &str, existing: ObjectKind, requested: ObjectKind) -> SharedObjectError {
    SharedObjectError::KindMismatch {
        subject: subject.to_owned(),
        existing,
        requested,
    }
}

fn is_wildcard(subject: &str) -> bool {
    subject.ends_with("/*") || subject.starts_with("*/")
}

/// `/a/b/*` matches by prefix `/a/b/`, `*/b/c` by suffix `/b/c`.
fn wildcard_matches(pattern: &str, subject: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        if pattern.ends_with("/*") {
            return subject.starts_with(prefix);
        }
    }
    match pattern.strip_prefix('*') {
        Some(suffix) if pattern.starts_with("*/") => subject.ends_with(suffix),
        _ => false,
    }
}

/// `/eos/host/fst/extra` becomes `/eos/host/fst`.
fn derive_reply_queue(subject: &str) -> Option<&str> {
    let mut slashes = subject.match_indices('/').map(|(idx, _)| idx);
    if slashes.next() != Some(0) {
        return None;
    }
    slashes.nth(2).map(|end| &subject[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{next_update, pair, GROUP};
    use crate::wire::WirePair;
    use xmq_msg::MessageType;

    fn inbound(update: &SharedMessage) -> Message {
        let mut message = Message::with_type("shared object update", MessageType::Monitor);
        message.new_id();
        message.header_mut().sender_id = "/xmq/test/peer".into();
        message.set_body(update.encode());
        message
    }

    fn update_of(subject: &str, pairs: &[(&str, &str)]) -> SharedMessage {
        let mut update = SharedMessage::new(Command::Update, subject, ObjectKind::Hash);
        update.pairs = pairs
            .iter()
            .map(|(key, value)| WirePair {
                subject: None,
                key: (*key).into(),
                value: (*value).into(),
                change_id: 4,
            })
            .collect();
        update
    }

    #[test]
    fn creation_is_idempotent_and_kind_checked() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client);
        let first = manager.create_shared_hash("/xmq/test/stats0", GROUP).expect("create");
        let second = manager.create_shared_hash("/xmq/test/stats0", "/other/*").expect("create");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.broadcast_queue(), "/other/*");
        assert!(matches!(
            manager.create_shared_queue("/xmq/test/stats0", GROUP),
            Err(SharedObjectError::KindMismatch { .. })
        ));
        assert!(manager.get_queue("/xmq/test/stats0").is_none());
        assert!(manager.get_object("/xmq/test/stats0", ObjectKind::Hash).is_some());
        assert_eq!(manager.stats().hashes, 1);
    }

    #[test]
    fn inbound_update_applies_with_remote_change_ids() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client);
        let stats = manager.create_shared_hash("/xmq/test/stats0", GROUP).expect("create");
        manager
            .apply(&inbound(&update_of("/xmq/test/stats0", &[("var0", "7")])))
            .expect("apply");
        assert_eq!(stats.get("var0").as_deref(), Some("7"));
        assert_eq!(stats.change_id("var0"), Some(4));
    }

    #[test]
    fn unknown_subject_is_dropped_unless_auto_create() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client.clone());
        let message = inbound(&update_of("/eos/host/fst/cfg", &[("k", "v")]));
        assert!(matches!(
            manager.apply(&message),
            Err(SharedObjectError::UnknownSubject(_))
        ));
        assert!(manager.subjects().is_empty());

        let config = SharedConfig {
            auto_create: true,
            ..SharedConfig::default()
        };
        let manager = SharedObjectManager::with_config(client, &config);
        manager.apply(&message).expect("auto create");
        let created = manager.get_hash("/eos/host/fst/cfg").expect("created");
        assert_eq!(created.broadcast_queue(), "/eos/host/fst");
        assert_eq!(created.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn wildcard_subjects_reach_every_match() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client);
        let a = manager.create_shared_hash("/node/a/cfg", GROUP).expect("create");
        let b = manager.create_shared_hash("/node/b/cfg", GROUP).expect("create");
        let other = manager.create_shared_hash("/node/b/stats", GROUP).expect("create");

        manager
            .apply(&inbound(&update_of("*/cfg", &[("mode", "rw")])))
            .expect("suffix");
        assert_eq!(a.get("mode").as_deref(), Some("rw"));
        assert_eq!(b.get("mode").as_deref(), Some("rw"));
        assert!(other.get("mode").is_none());

        manager
            .apply(&inbound(&update_of("/node/b/*", &[("up", "1")])))
            .expect("prefix");
        assert!(a.get("up").is_none());
        assert_eq!(other.get("up").as_deref(), Some("1"));
    }

    #[test]
    fn broadcast_reply_replaces_state() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client);
        let stats = manager.create_shared_hash("/xmq/test/stats0", GROUP).expect("create");
        stats.set("stale", "1").expect("set");
        let mut reply = SharedMessage::new(Command::BroadcastReply, "/xmq/test/stats0", ObjectKind::Hash);
        manager.apply(&inbound(&reply)).expect("empty reply");
        assert_eq!(stats.size(), 0);

        reply.pairs = update_of("/xmq/test/stats0", &[("fresh", "2")]).pairs;
        manager.apply(&inbound(&reply)).expect("reply");
        assert_eq!(stats.keys(), ["fresh"]);
    }

    #[test]
    fn broadcast_request_answers_the_reply_queue() {
        let (client, observer) = pair();
        let manager = SharedObjectManager::new(client);
        let stats = manager.create_shared_hash("/xmq/test/stats0", GROUP).expect("create");
        stats.set("var0", "7").expect("set");
        next_update(&observer).expect("set update");

        let mut request = SharedMessage::new(Command::BroadcastRequest, "/xmq/test/stats0", ObjectKind::Hash);
        request.reply = Some(observer.client_id().to_owned());
        manager.apply(&inbound(&request)).expect("request");

        let reply = next_update(&observer).expect("state");
        assert_eq!(reply.command, Command::BroadcastReply);
        assert_eq!(reply.pairs[0].key, "var0");
    }

    #[test]
    fn remove_and_delete_shared_object() {
        let (client, observer) = pair();
        let manager = SharedObjectManager::new(client);
        manager.create_shared_hash("/xmq/test/gone", GROUP).expect("create");
        let remove = SharedMessage::new(Command::Remove, "/xmq/test/gone", ObjectKind::Hash);
        manager.apply(&inbound(&remove)).expect("remove");
        assert!(manager.lookup("/xmq/test/gone").is_none());

        manager.create_shared_queue("/xmq/test/jobs", GROUP).expect("create");
        assert!(manager
            .delete_shared_object("/xmq/test/jobs", ObjectKind::Queue, true)
            .expect("delete"));
        assert_eq!(next_update(&observer).expect("remove").command, Command::Remove);
        assert!(!manager
            .delete_shared_object("/xmq/test/jobs", ObjectKind::Queue, true)
            .expect("already gone"));
    }

    #[test]
    fn mux_transaction_sends_one_message_for_many_hashes() {
        let (client, observer) = pair();
        let manager = SharedObjectManager::new(client);
        let a = manager.create_shared_hash("/xmq/test/a", GROUP).expect("create");
        let b = manager.create_shared_hash("/xmq/test/b", GROUP).expect("create");
        assert!(manager.open_mux_transaction(GROUP));
        assert!(!manager.open_mux_transaction(GROUP));
        a.set("k", "1").expect("set");
        b.set("k", "2").expect("set");
        b.clear(true).expect("clear");
        b.set("j", "3").expect("set");
        assert!(next_update(&observer).is_none());
        assert!(manager.close_mux_transaction().expect("close"));

        let update = next_update(&observer).expect("mux update");
        assert_eq!(update.subjects, ["/xmq/test/a", "/xmq/test/b"]);
        assert!(update.clears(1));
        assert_eq!(update.pairs_for(0).count(), 1);
        let b_pairs: Vec<_> = update.pairs_for(1).map(|p| p.key.as_str()).collect();
        assert_eq!(b_pairs, ["j"]);
    }

    #[test]
    fn notifications_and_muted_broadcast() {
        let (client, observer) = pair();
        let manager = SharedObjectManager::new(client);
        manager.enable_notifications(true);
        manager.enable_broadcast(false);
        let stats = manager.create_shared_hash("/xmq/test/n", GROUP).expect("create");
        stats.set("k", "v").expect("set");
        stats.delete("k", true).expect("delete");
        assert!(next_update(&observer).is_none());
        let kinds: Vec<_> = manager.take_notifications().iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            [
                NotificationKind::Creation,
                NotificationKind::Modification,
                NotificationKind::KeyDeletion
            ]
        );
    }

    #[test]
    fn dump_lists_subjects_in_order() {
        let (client, _observer) = pair();
        let manager = SharedObjectManager::new(client);
        manager.create_shared_queue("/xmq/test/z", GROUP).expect("create");
        manager.create_shared_hash("/xmq/test/a", GROUP).expect("create");
        let dump = manager.dump_shared_objects();
        let a = dump.find("/xmq/test/a [ hash").expect("hash listed");
        let z = dump.find("/xmq/test/z [ queue").expect("queue listed");
        assert!(a < z);
    }

    #[test]
    fn reply_queue_derivation() {
        assert_eq!(derive_reply_queue("/eos/host/fst/x/y"), Some("/eos/host/fst"));
        assert_eq!(derive_reply_queue("/eos/host"), None);
        assert!(wildcard_matches("/a/*", "/a/b"));
        assert!(wildcard_matches("*/b", "/a/b"));
        assert!(!wildcard_matches("/a/b", "/a/b"));
    }
}
