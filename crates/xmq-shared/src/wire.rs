//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Body format of shared object messages.
//!
//! ```text
//! mqsh.cmd=update&mqsh.subject=<s0>|<s1>&mqsh.type=hash&mqsh.clear=0
//!     &mqsh.pairs=|#0#key~value~changeid|...&mqsh.keys=|#1#key|...&mqsh.reply=<queue>
//! ```
//!
//! Tokens are percent-escaped so separators never appear inside them. The
//! `#<index>#` prefix names the subject a pair belongs to and is only written
//! when a message carries several subjects.

use std::fmt::Write as _;

use tracing::warn;
use xmq_msg::codec::{escape, unescape};

use crate::{ObjectKind, Result, SharedObjectError};

const CMD: &str = "mqsh.cmd";
const SUBJECT: &str = "mqsh.subject";
const TYPE: &str = "mqsh.type";
const CLEAR: &str = "mqsh.clear";
const PAIRS: &str = "mqsh.pairs";
const KEYS: &str = "mqsh.keys";
const REPLY: &str = "mqsh.reply";
const RESERVED: &[char] = &['&', '=', '|', '~', '#'];

/// Operation carried by a shared object message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Incremental change: optional clear, then sets and deletions.
    Update,
    /// Ask every holder to send its full state to `reply`.
    BroadcastRequest,
    /// Full state; the receiver replaces its copy.
    BroadcastReply,
    /// Deletions only.
    Delete,
    /// Drop the whole subject.
    Remove,
}

impl Command {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Update => "update",
            Command::BroadcastRequest => "bcrequest",
            Command::BroadcastReply => "bcreply",
            Command::Delete => "delete",
            Command::Remove => "remove",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "update" => Ok(Command::Update),
            "bcrequest" => Ok(Command::BroadcastRequest),
            "bcreply" => Ok(Command::BroadcastReply),
            "delete" => Ok(Command::Delete),
            "remove" => Ok(Command::Remove),
            other => Err(SharedObjectError::Protocol(format!("unknown command '{other}'"))),
        }
    }
}

/// One key/value assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePair {
    /// Index into the subject list; `None` means the first subject.
    pub subject: Option<usize>,
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: String,
    /// Writer's change counter for the entry.
    pub change_id: u64,
}

/// One deleted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireKey {
    /// Index into the subject list; `None` means the first subject.
    pub subject: Option<usize>,
    /// Entry key.
    pub key: String,
}

/// Decoded shared object message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMessage {
    /// Operation.
    pub command: Command,
    /// Target subjects. A single entry may be a wildcard.
    pub subjects: Vec<String>,
    /// Kind of every target.
    pub kind: ObjectKind,
    /// Subject indices emptied before the pairs are applied.
    pub cleared: Vec<usize>,
    /// Assignments.
    pub pairs: Vec<WirePair>,
    /// Deleted keys.
    pub deletions: Vec<WireKey>,
    /// Reply queue for broadcast requests.
    pub reply: Option<String>,
    /// Malformed pairs or keys dropped while decoding.
    pub skipped: usize,
}

impl SharedMessage {
    /// Empty message for one subject.
    pub fn new(command: Command, subject: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            command,
            subjects: vec![subject.into()],
            kind,
            cleared: Vec::new(),
            pairs: Vec::new(),
            deletions: Vec::new(),
            reply: None,
            skipped: 0,
        }
    }

    /// True when applying it would change nothing.
    pub fn is_empty(&self) -> bool {
        self.cleared.is_empty() && self.pairs.is_empty() && self.deletions.is_empty()
    }

    /// Assignments addressed to subject `index`.
    pub fn pairs_for(&self, index: usize) -> impl Iterator<Item = &WirePair> {
        self.pairs
            .iter()
            .filter(move |pair| pair.subject.unwrap_or(0) == index)
    }

    /// Deletions addressed to subject `index`.
    pub fn deletions_for(&self, index: usize) -> impl Iterator<Item = &WireKey> {
        self.deletions
            .iter()
            .filter(move |key| key.subject.unwrap_or(0) == index)
    }

    /// True when subject `index` is cleared first.
    pub fn clears(&self, index: usize) -> bool {
        self.cleared.contains(&index)
    }

    /// Render the message body.
    pub fn encode(&self) -> String {
        let subjects: Vec<String> = self
            .subjects
            .iter()
            .map(|subject| escape(subject, RESERVED))
            .collect();
        let mut out = format!(
            "{CMD}={}&{SUBJECT}={}&{TYPE}={}",
            self.command.as_str(),
            subjects.join("|"),
            self.kind.as_str()
        );
        if !self.cleared.is_empty() {
            let cleared: Vec<String> = self.cleared.iter().map(usize::to_string).collect();
            let _ = write!(out, "&{CLEAR}={}", cleared.join("|"));
        }
        if !self.pairs.is_empty() {
            let _ = write!(out, "&{PAIRS}=");
            for pair in &self.pairs {
                out.push('|');
                push_index(&mut out, pair.subject);
                let _ = write!(
                    out,
                    "{}~{}~{}",
                    escape(&pair.key, RESERVED),
                    escape(&pair.value, RESERVED),
                    pair.change_id
                );
            }
        }
        if !self.deletions.is_empty() {
            let _ = write!(out, "&{KEYS}=");
            for key in &self.deletions {
                out.push('|');
                push_index(&mut out, key.subject);
                out.push_str(&escape(&key.key, RESERVED));
            }
        }
        if let Some(reply) = &self.reply {
            let _ = write!(out, "&{REPLY}={}", escape(reply, RESERVED));
        }
        out
    }

    /// Parse a message body. Structural problems are errors; individual
    /// malformed pairs or keys are skipped and counted in `skipped`.
    pub fn decode(body: &str) -> Result<Self> {
        let mut command = None;
        let mut subjects = None;
        let mut kind = None;
        let mut cleared = Vec::new();
        let mut raw_pairs = None;
        let mut raw_keys = None;
        let mut reply = None;

        for field in body.split('&') {
            let Some((name, value)) = field.split_once('=') else {
                continue;
            };
            match name {
                CMD => command = Some(Command::parse(value)?),
                SUBJECT => {
                    let list = value
                        .split('|')
                        .map(|subject| unescape(subject).map_err(protocol))
                        .collect::<Result<Vec<_>>>()?;
                    subjects = Some(list);
                }
                TYPE => kind = Some(value.parse::<ObjectKind>()?),
                CLEAR => {
                    cleared = value
                        .split('|')
                        .map(|idx| {
                            idx.parse::<usize>().map_err(|_| {
                                SharedObjectError::Protocol(format!("bad clear index '{idx}'"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                }
                PAIRS => raw_pairs = Some(value),
                KEYS => raw_keys = Some(value),
                REPLY => reply = Some(unescape(value).map_err(protocol)?),
                _ => {}
            }
        }

        let command =
            command.ok_or_else(|| SharedObjectError::Protocol("no command in message".into()))?;
        let subjects = subjects
            .filter(|list| list.iter().all(|subject| !subject.is_empty()))
            .ok_or_else(|| SharedObjectError::Protocol("no subject in message".into()))?;
        let kind = kind.ok_or_else(|| SharedObjectError::Protocol("no type in message".into()))?;
        if command == Command::BroadcastRequest && reply.as_deref().map_or(true, str::is_empty) {
            return Err(SharedObjectError::Protocol(
                "broadcast request without reply address".into(),
            ));
        }
        if let Some(idx) = cleared.iter().find(|idx| **idx >= subjects.len()) {
            return Err(SharedObjectError::Protocol(format!(
                "clear index {idx} out of range"
            )));
        }

        let mut message = Self {
            command,
            subjects,
            kind,
            cleared,
            pairs: Vec::new(),
            deletions: Vec::new(),
            reply,
            skipped: 0,
        };
        if let Some(raw) = raw_pairs {
            message.decode_pairs(raw);
        }
        if let Some(raw) = raw_keys {
            message.decode_keys(raw);
        }
        Ok(message)
    }

    fn decode_pairs(&mut self, raw: &str) {
        for item in raw.split('|').filter(|item| !item.is_empty()) {
            match self.decode_pair(item) {
                Some(pair) => self.pairs.push(pair),
                None => {
                    self.skipped += 1;
                    warn!(subject = %self.subjects[0], item, "skipping malformed pair");
                }
            }
        }
    }

    fn decode_pair(&self, item: &str) -> Option<WirePair> {
        let (subject, rest) = self.split_index(item)?;
        let mut parts = rest.split('~');
        let (key, value, change_id) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let key = unescape(key).ok().filter(|key| !key.is_empty())?;
        let value = unescape(value).ok().filter(|value| !value.is_empty())?;
        Some(WirePair {
            subject,
            key,
            value,
            change_id: change_id.parse().ok()?,
        })
    }

    fn decode_keys(&mut self, raw: &str) {
        for item in raw.split('|').filter(|item| !item.is_empty()) {
            let key = self.split_index(item).and_then(|(subject, rest)| {
                let key = unescape(rest).ok().filter(|key| !key.is_empty())?;
                Some(WireKey { subject, key })
            });
            match key {
                Some(key) => self.deletions.push(key),
                None => {
                    self.skipped += 1;
                    warn!(subject = %self.subjects[0], item, "skipping malformed key");
                }
            }
        }
    }

    fn split_index<'a>(&self, item: &'a str) -> Option<(Option<usize>, &'a str)> {
        let Some(tagged) = item.strip_prefix('#') else {
            return Some((None, item));
        };
        let (index, rest) = tagged.split_once('#')?;
        let index: usize = index.parse().ok()?;
        (index < self.subjects.len()).then_some((Some(index), rest))
    }
}

fn push_index(out: &mut String, subject: Option<usize>) {
    if let Some(index) = subject {
        let _ = write!(out, "#{index}#");
    }
}

fn protocol(err: xmq_msg::MessagingError) -> SharedObjectError {
    SharedObjectError::Protocol(err.to_string())
}
