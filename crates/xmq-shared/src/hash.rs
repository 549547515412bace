//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::object::{ObjectContext, ObjectCore, Op};
use crate::{ObjectKind, Result, SharedObjectError};

/// Replicated mapping of string keys to string values.
///
/// Writes outside a transaction are broadcast one by one. Inside a
/// transaction they are staged and become visible, locally and remotely, when
/// [`SharedHash::close_transaction`] commits them as one update.
pub struct SharedHash {
    core: ObjectCore,
}

impl SharedHash {
    pub(crate) fn new(subject: &str, broadcast_queue: &str, ctx: Arc<ObjectContext>) -> Self {
        Self {
            core: ObjectCore::new(subject, broadcast_queue, ObjectKind::Hash, ctx),
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

    /// Start staging writes. Returns false, and changes nothing, when a
    /// transaction is already open.
    pub fn open_transaction(&self) -> bool {
        self.core.open_transaction()
    }

    /// Commit staged writes and broadcast them as one update. The local state
    /// is committed even when the send fails.
    pub fn close_transaction(&self) -> Result<()> {
        self.core.close_transaction()
    }

    /// True between open and close.
    pub fn in_transaction(&self) -> bool {
        self.core.in_transaction()
    }

    /// Write `value` under `key`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SharedObjectError::EmptyKey);
        }
        if value.is_empty() {
            return Err(SharedObjectError::EmptyValue(key.to_owned()));
        }
        self.core.mutate(key.to_owned(), Op::Set(value.to_owned()))
    }

    /// Write an integer in decimal form.
    pub fn set_long_long(&self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_string())
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.core.get(key)
    }

    /// Value as integer; 0 when missing or not numeric.
    pub fn get_long_long(&self, key: &str) -> u64 {
        self.parsed(key)
    }

    /// Value as float; 0.0 when missing or not numeric.
    pub fn get_double(&self, key: &str) -> f64 {
        self.parsed(key)
    }

    /// Value as `u32`; 0 when missing, not numeric or out of range.
    pub fn get_uint(&self, key: &str) -> u32 {
        self.parsed(key)
    }

    /// Remove `key`; with `broadcast` the deletion is replicated and follows
    /// transaction staging, otherwise only the local copy changes.
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

    /// Sorted keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.core.keys();
        keys.sort();
        keys
    }

    /// Sorted snapshot of all entries.
    pub fn contents(&self) -> BTreeMap<String, String> {
        self.core.contents().into_iter().collect()
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.core.len()
    }

    /// Milliseconds since `key` was last written.
    pub fn age_in_millis(&self, key: &str) -> Option<u128> {
        self.core.age(key).map(|age| age.as_millis())
    }

    /// Whole seconds since `key` was last written.
    pub fn age_in_secs(&self, key: &str) -> Option<u64> {
        self.core.age(key).map(|age| age.as_secs())
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

    /// Diagnostic rendering, entries sorted by key.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.core.dump(&mut out);
        out
    }

    fn parsed<T: std::str::FromStr + Default>(&self, key: &str) -> T {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{next_update, pair, GROUP};
    use crate::wire::Command;

    fn hash(client: &Arc<xmq_msg::MessageClient>) -> SharedHash {
        SharedHash::new(
            "/xmq/test/stats0",
            GROUP,
            Arc::new(ObjectContext::new(client.clone())),
        )
    }

    #[test]
    fn transaction_commits_as_one_update() {
        let (writer, observer) = pair();
        let stats = hash(&writer);
        assert!(stats.open_transaction());
        assert!(!stats.open_transaction());
        stats.set("var0", "7").expect("set");
        stats.set_long_long("var1", 9).expect("set");
        stats.set("var0", "8").expect("set");
        assert_eq!(stats.get("var0"), None);

        stats.close_transaction().expect("close");
        assert_eq!(stats.get("var0").as_deref(), Some("8"));
        assert_eq!(stats.get_long_long("var1"), 9);

        let update = next_update(&observer).expect("one update");
        assert_eq!(update.command, Command::Update);
        let pairs: Vec<_> = update
            .pairs
            .iter()
            .map(|p| (p.key.as_str(), p.value.as_str()))
            .collect();
        assert_eq!(pairs, [("var0", "8"), ("var1", "9")]);
        assert!(next_update(&observer).is_none());
    }

    #[test]
    fn writes_outside_a_transaction_are_sent_individually() {
        let (writer, observer) = pair();
        let stats = hash(&writer);
        stats.set("a", "1").expect("set");
        stats.set("a", "2").expect("set");
        assert_eq!(stats.change_id("a"), Some(1));
        assert_eq!(next_update(&observer).expect("first").pairs[0].change_id, 0);
        assert_eq!(next_update(&observer).expect("second").pairs[0].change_id, 1);
    }

    #[test]
    fn rejects_empty_keys_and_values() {
        let (writer, _observer) = pair();
        let stats = hash(&writer);
        assert!(matches!(stats.set("", "1"), Err(SharedObjectError::EmptyKey)));
        assert!(matches!(stats.set("k", ""), Err(SharedObjectError::EmptyValue(_))));
        assert_eq!(stats.size(), 0);
    }

    #[test]
    fn deletion_only_update_uses_delete_command() {
        let (writer, observer) = pair();
        let stats = hash(&writer);
        stats.set("gone", "1").expect("set");
        next_update(&observer).expect("set update");
        stats.delete("gone", true).expect("delete");
        let update = next_update(&observer).expect("delete update");
        assert_eq!(update.command, Command::Delete);
        assert_eq!(update.deletions[0].key, "gone");

        stats.set("local", "1").expect("set");
        next_update(&observer).expect("set update");
        stats.delete("local", false).expect("delete");
        assert!(stats.get("local").is_none());
        assert!(next_update(&observer).is_none());
    }

    #[test]
    fn clear_is_replicated() {
        let (writer, observer) = pair();
        let stats = hash(&writer);
        stats.set("a", "1").expect("set");
        next_update(&observer).expect("set update");
        stats.clear(true).expect("clear");
        assert_eq!(stats.size(), 0);
        let update = next_update(&observer).expect("clear update");
        assert!(update.clears(0));
    }

    #[test]
    fn typed_getters_default_to_zero() {
        let (writer, _observer) = pair();
        let stats = hash(&writer);
        stats.set("ratio", "0.25").expect("set");
        stats.set("name", "fst").expect("set");
        assert_eq!(stats.get_double("ratio"), 0.25);
        assert_eq!(stats.get_uint("name"), 0);
        assert_eq!(stats.get_long_long("missing"), 0);
    }

    #[test]
    fn dump_is_sorted_by_key() {
        let (writer, _observer) = pair();
        let stats = hash(&writer);
        stats.set("b", "2").expect("set");
        stats.set("a", "1").expect("set");
        let dump = stats.dump();
        assert!(dump.starts_with("=====\n/xmq/test/stats0 [ hash=> /xmq/test/* ]\n-----\n"));
        let a = dump.find("key=a").expect("a listed");
        let b = dump.find("key=b").expect("b listed");
        assert!(a < b);
    }

    #[test]
    fn concurrent_sets_in_one_transaction_are_all_committed() {
        let (writer, observer) = pair();
        let stats = Arc::new(hash(&writer));
        assert!(stats.open_transaction());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let stats = stats.clone();
                std::thread::spawn(move || stats.set(&format!("key{n}"), "v").expect("set"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }
        stats.close_transaction().expect("close");
        assert_eq!(stats.size(), 8);
        assert_eq!(next_update(&observer).expect("update").pairs.len(), 8);
    }
}
