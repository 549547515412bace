//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::fmt;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xmq_common::time::WallClock;
use xmq_security::{digest, Keyring};

use crate::codec::{escape, unescape};
use crate::{MessagingError, Result};

const HEADER_KEY: &str = "xmq.header";
const BODY_KEY: &str = "xmq.body";
const MONITOR_KEY: &str = "xmq.mon";
const HEADER_SEPARATOR: char = '^';
const HEADER_FIELDS: usize = 18;
const HEADER_RESERVED: &[char] = &['^', '&'];
const BODY_RESERVED: &[char] = &['&'];
const DISPLAY_BODY_LIMIT: usize = 256;

/// Envelope type, carried as a numeric code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Application payload.
    #[default]
    Plain,
    /// Control-plane status, e.g. advisories.
    Status,
    /// Control-plane query, e.g. resync requests.
    Query,
    /// Monitoring traffic that brokers may shed.
    Monitor,
}

impl MessageType {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            MessageType::Plain => 0,
            MessageType::Status => 1,
            MessageType::Query => 2,
            MessageType::Monitor => 3,
        }
    }

    /// Inverse of [`MessageType::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageType::Plain),
            1 => Some(MessageType::Status),
            2 => Some(MessageType::Query),
            3 => Some(MessageType::Monitor),
            _ => None,
        }
    }

    /// Status and query messages are advisory traffic.
    pub fn is_advisory(self) -> bool {
        matches!(self, MessageType::Status | MessageType::Query)
    }
}

/// Routing, timing and authentication fields of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Unique id, regenerated by [`Message::new_id`].
    pub message_id: String,
    /// Id of the message this one answers.
    pub reply_id: String,
    /// Client id of the sender, stamped on send.
    pub sender_id: String,
    /// Broker that relayed the message.
    pub broker_id: String,
    /// Client id of the receiver, stamped on receive.
    pub receiver_id: String,
    /// Destination queue or pattern.
    pub receiver_queue: String,
    /// Free text description.
    pub description: String,
    /// Stamped on send.
    pub sender_time: WallClock,
    /// Stamped by the broker when available.
    pub broker_time: WallClock,
    /// Stamped on receive.
    pub receiver_time: WallClock,
    /// Key id that produced `signature`.
    pub key_id: String,
    /// Authentication tag over the signed region.
    pub signature: String,
    /// Body digest covered by the signature.
    pub digest: String,
    /// Body holds ciphertext.
    pub encrypted: bool,
    /// Envelope type.
    pub kind: MessageType,
}

impl MessageHeader {
    fn encode(&self) -> String {
        let fields = [
            escape(&self.message_id, HEADER_RESERVED),
            escape(&self.reply_id, HEADER_RESERVED),
            escape(&self.sender_id, HEADER_RESERVED),
            escape(&self.broker_id, HEADER_RESERVED),
            escape(&self.receiver_id, HEADER_RESERVED),
            escape(&self.receiver_queue, HEADER_RESERVED),
            escape(&self.description, HEADER_RESERVED),
            self.sender_time.secs.to_string(),
            self.sender_time.nanos.to_string(),
            self.broker_time.secs.to_string(),
            self.broker_time.nanos.to_string(),
            self.receiver_time.secs.to_string(),
            self.receiver_time.nanos.to_string(),
            escape(&self.key_id, HEADER_RESERVED),
            escape(&self.signature, HEADER_RESERVED),
            escape(&self.digest, HEADER_RESERVED),
            u8::from(self.encrypted).to_string(),
            self.kind.code().to_string(),
        ];
        fields.join(&HEADER_SEPARATOR.to_string())
    }

    fn decode(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split(HEADER_SEPARATOR).collect();
        if fields.len() != HEADER_FIELDS {
            return Err(MessagingError::MalformedFrame(format!(
                "header has {} fields, expected {HEADER_FIELDS}",
                fields.len()
            )));
        }
        let kind_code = number::<u8>(fields[17], "type")?;
        Ok(Self {
            message_id: unescape(fields[0])?,
            reply_id: unescape(fields[1])?,
            sender_id: unescape(fields[2])?,
            broker_id: unescape(fields[3])?,
            receiver_id: unescape(fields[4])?,
            receiver_queue: unescape(fields[5])?,
            description: unescape(fields[6])?,
            sender_time: clock(fields[7], fields[8])?,
            broker_time: clock(fields[9], fields[10])?,
            receiver_time: clock(fields[11], fields[12])?,
            key_id: unescape(fields[13])?,
            signature: unescape(fields[14])?,
            digest: unescape(fields[15])?,
            encrypted: match fields[16] {
                "0" => false,
                "1" => true,
                other => {
                    return Err(MessagingError::MalformedFrame(format!(
                        "bad encrypted flag '{other}'"
                    )))
                }
            },
            kind: MessageType::from_code(kind_code).ok_or_else(|| {
                MessagingError::MalformedFrame(format!("unknown message type {kind_code}"))
            })?,
        })
    }
}

fn number<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| MessagingError::MalformedFrame(format!("bad {field} field '{raw}'")))
}

fn clock(secs: &str, nanos: &str) -> Result<WallClock> {
    Ok(WallClock {
        secs: number(secs, "seconds")?,
        nanos: number(nanos, "nanoseconds")?,
    })
}

/// Authentication state of a message as it would go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Neither signed nor encrypted.
    Plain,
    /// Signed, body readable.
    Signed,
    /// Body encrypted, not signed.
    Encrypted,
    /// Body encrypted and the ciphertext signed.
    SignedAndEncrypted,
}

/// Self-describing envelope exchanged through brokers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    body: String,
}

impl Message {
    /// Plain message with a fresh id.
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_type(description, MessageType::Plain)
    }

    /// Message of the given type with a fresh id.
    pub fn with_type(description: impl Into<String>, kind: MessageType) -> Self {
        let mut message = Self {
            header: MessageHeader {
                description: description.into(),
                kind,
                ..MessageHeader::default()
            },
            body: String::new(),
        };
        message.new_id();
        message
    }

    /// Assign a fresh unique id. Call before re-sending a logically new message.
    pub fn new_id(&mut self) {
        self.header.message_id = Uuid::new_v4().to_string();
    }

    /// Unique id.
    pub fn id(&self) -> &str {
        &self.header.message_id
    }

    /// Header fields.
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Mutable header fields.
    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    /// Envelope type.
    pub fn kind(&self) -> MessageType {
        self.header.kind
    }

    /// Description text.
    pub fn description(&self) -> &str {
        &self.header.description
    }

    /// Raw payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Replace the payload. Any earlier signature no longer covers it.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
        self.header.signature.clear();
        self.header.digest.clear();
        self.header.key_id.clear();
    }

    /// Take the payload, consuming the message.
    pub fn into_body(self) -> String {
        self.body
    }

    /// Mark this message as the answer to `other`.
    pub fn set_reply(&mut self, other: &Message) {
        self.header.reply_id = other.header.message_id.clone();
    }

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        match (self.is_signed(), self.header.encrypted) {
            (false, false) => AuthState::Plain,
            (true, false) => AuthState::Signed,
            (false, true) => AuthState::Encrypted,
            (true, true) => AuthState::SignedAndEncrypted,
        }
    }

    /// True when a signature is attached.
    pub fn is_signed(&self) -> bool {
        !self.header.signature.is_empty()
    }

    /// True when the body holds ciphertext.
    pub fn is_encrypted(&self) -> bool {
        self.header.encrypted
    }

    /// Sign id, routing, type and body with the keyring's identity.
    ///
    /// Encode first when both are wanted: the signature then covers the ciphertext.
    pub fn sign(&mut self, keyring: &Keyring) -> Result<()> {
        self.header.digest = digest(self.body.as_bytes());
        self.header.key_id = keyring
            .identity()
            .unwrap_or_default()
            .to_owned();
        self.header.signature = keyring.sign(&self.signed_region())?;
        Ok(())
    }

    /// Check the signature and body digest.
    pub fn verify(&self, keyring: &Keyring) -> Result<()> {
        if !self.is_signed() {
            return Err(MessagingError::NotSigned);
        }
        if digest(self.body.as_bytes()) != self.header.digest {
            return Err(MessagingError::DigestMismatch);
        }
        let signer = keyring.verify(&self.header.signature, &self.signed_region())?;
        if signer != self.header.key_id {
            return Err(MessagingError::MalformedFrame(format!(
                "signature key '{signer}' does not match header key '{}'",
                self.header.key_id
            )));
        }
        Ok(())
    }

    /// Encrypt the body with the shared secret, bound to the message id.
    pub fn encode(&mut self, keyring: &Keyring) -> Result<()> {
        if self.header.encrypted {
            return Err(MessagingError::AlreadyEncoded);
        }
        let sealed = keyring.encrypt(self.body.as_bytes(), self.header.message_id.as_bytes())?;
        self.set_body(sealed);
        self.header.encrypted = true;
        Ok(())
    }

    /// Decrypt the body. The message is unchanged on failure.
    pub fn decode(&mut self, keyring: &Keyring) -> Result<()> {
        if !self.header.encrypted {
            return Err(MessagingError::NotEncoded);
        }
        let plain = keyring.decrypt(&self.body, self.header.message_id.as_bytes())?;
        let plain = String::from_utf8(plain)
            .map_err(|_| MessagingError::MalformedFrame("decrypted body is not utf-8".into()))?;
        self.body = plain;
        self.header.encrypted = false;
        Ok(())
    }

    /// Wire form, suitable for relaying.
    pub fn message_buffer(&self) -> String {
        let mut buffer = format!(
            "{HEADER_KEY}={}&{BODY_KEY}={}",
            self.header.encode(),
            escape(&self.body, BODY_RESERVED)
        );
        if self.header.kind == MessageType::Monitor {
            buffer.push_str(&format!("&{MONITOR_KEY}=1"));
        }
        buffer
    }

    /// Parse a wire buffer produced by [`Message::message_buffer`].
    pub fn parse(raw: &str) -> Result<Self> {
        let mut header = None;
        let mut body = None;
        for part in raw.trim_end_matches('\n').split('&') {
            match part.split_once('=') {
                Some((HEADER_KEY, value)) => header = Some(MessageHeader::decode(value)?),
                Some((BODY_KEY, value)) => body = Some(unescape(value)?),
                Some((MONITOR_KEY, _)) => {}
                _ => {
                    return Err(MessagingError::MalformedFrame(format!(
                        "unexpected envelope segment '{}'",
                        truncate(part, 32)
                    )))
                }
            }
        }
        let header =
            header.ok_or_else(|| MessagingError::MalformedFrame("missing header".into()))?;
        if header.message_id.is_empty() {
            return Err(MessagingError::MalformedFrame("empty message id".into()));
        }
        Ok(Self {
            header,
            body: body.unwrap_or_default(),
        })
    }

    fn signed_region(&self) -> Vec<u8> {
        let h = &self.header;
        let fields = [
            escape(&h.message_id, HEADER_RESERVED),
            escape(&h.reply_id, HEADER_RESERVED),
            escape(&h.sender_id, HEADER_RESERVED),
            escape(&h.receiver_queue, HEADER_RESERVED),
            escape(&h.description, HEADER_RESERVED),
            h.sender_time.secs.to_string(),
            h.sender_time.nanos.to_string(),
            u8::from(h.encrypted).to_string(),
            h.kind.code().to_string(),
            escape(&h.digest, HEADER_RESERVED),
        ];
        let mut region = fields.join("^").into_bytes();
        region.push(b'\n');
        region.extend_from_slice(self.body.as_bytes());
        region
    }
}

fn stamp(time: WallClock) -> String {
    time.to_datetime().map_or_else(
        || format!("{}.{:09}", time.secs, time.nanos),
        |at| at.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(f, "id          : {}", h.message_id)?;
        writeln!(f, "reply id    : {}", h.reply_id)?;
        writeln!(f, "type        : {:?}", h.kind)?;
        writeln!(f, "description : {}", h.description)?;
        writeln!(f, "sender      : {} @ {}", h.sender_id, stamp(h.sender_time))?;
        writeln!(f, "queue       : {}", h.receiver_queue)?;
        writeln!(f, "receiver    : {} @ {}", h.receiver_id, stamp(h.receiver_time))?;
        writeln!(f, "auth        : {:?}", self.auth_state())?;
        if self.body.len() > DISPLAY_BODY_LIMIT {
            write!(
                f,
                "body        : {}... ({} bytes)",
                truncate(&self.body, DISPLAY_BODY_LIMIT),
                self.body.len()
            )
        } else {
            write!(f, "body        : {}", self.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmq_security::KeyFile;

    fn keyring() -> Keyring {
        Keyring::from_key_file(KeyFile::generate("node1")).expect("keyring")
    }

    fn sample() -> Message {
        let mut message = Message::new("shared object update");
        message.header_mut().sender_id = "/xmessage/node1/fst".into();
        message.header_mut().receiver_queue = "/xmessage/*/mgm".into();
        message.set_body("mqsh.cmd=update&mqsh.subject=stats0^x");
        message
    }

    #[test]
    fn ids_are_unique() {
        let mut message = Message::new("a");
        let first = message.id().to_owned();
        message.new_id();
        assert_ne!(first, message.id());
        assert_ne!(Message::new("b").id(), Message::new("b").id());
    }

    #[test]
    fn wire_form_survives_reserved_characters() {
        let message = sample();
        let parsed = Message::parse(&message.message_buffer()).expect("parse");
        assert_eq!(parsed, message);
    }

    #[test]
    fn monitor_flag_is_emitted() {
        let message = Message::with_type("probe", MessageType::Monitor);
        assert!(message.message_buffer().ends_with("&xmq.mon=1"));
        assert_eq!(
            Message::parse(&message.message_buffer()).expect("parse").kind(),
            MessageType::Monitor
        );
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let buffer = sample().message_buffer();
        let cut = buffer.find('^').expect("separator") + 3;
        assert!(Message::parse(&buffer[..cut]).is_err());
        assert!(Message::parse("xmq.body=abc").is_err());
        assert!(Message::parse("garbage").is_err());
    }

    #[test]
    fn sign_then_verify_and_detect_tampering() {
        let ring = keyring();
        let mut message = sample();
        message.sign(&ring).expect("sign");
        assert_eq!(message.auth_state(), AuthState::Signed);
        message.verify(&ring).expect("verify untampered");

        let mut wire = message.message_buffer();
        wire = wire.replace("stats0", "stats1");
        let tampered = Message::parse(&wire).expect("still parses");
        assert!(tampered.verify(&ring).is_err());

        let mut retargeted = message.clone();
        retargeted.header_mut().receiver_queue = "/elsewhere".into();
        assert!(retargeted.verify(&ring).is_err());
    }

    #[test]
    fn encode_decode_roundtrip_over_the_wire() {
        let ring = keyring();
        let original = sample();
        let mut message = original.clone();
        message.encode(&ring).expect("encode");
        assert!(message.is_encrypted());
        assert_ne!(message.body(), original.body());

        let mut received = Message::parse(&message.message_buffer()).expect("parse");
        received.decode(&ring).expect("decode");
        assert_eq!(received.body(), original.body());
        assert_eq!(received.id(), original.id());
    }

    #[test]
    fn decode_rejects_plain_and_wrong_key() {
        let ring = keyring();
        let mut plain = sample();
        assert!(matches!(plain.decode(&ring), Err(MessagingError::NotEncoded)));

        let mut message = sample();
        message.encode(&ring).expect("encode");
        let before = message.clone();
        assert!(matches!(message.encode(&ring), Err(MessagingError::AlreadyEncoded)));
        assert!(message.decode(&keyring()).is_err());
        assert_eq!(message, before);
    }

    #[test]
    fn display_elides_long_bodies() {
        let mut message = Message::new("big");
        message.set_body("x".repeat(1000));
        let rendered = message.to_string();
        assert!(rendered.contains("(1000 bytes)"));
        assert!(rendered.len() < 700);
    }
}
