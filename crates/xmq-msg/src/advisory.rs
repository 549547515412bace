//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use crate::message::{Message, MessageType};
use crate::{MessagingError, Result};

const ADVISORY_DESCRIPTION: &str = "advisory";
const QUEUE_KEY: &str = "xmq.advisoryqueue";
const STATE_KEY: &str = "xmq.advisorystate";

/// Control-plane notice that a queue went online or offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryMessage {
    /// Queue whose state changed.
    pub queue: String,
    /// New state.
    pub online: bool,
}

impl AdvisoryMessage {
    /// Advisory for `queue`.
    pub fn new(queue: impl Into<String>, online: bool) -> Self {
        Self {
            queue: queue.into(),
            online,
        }
    }

    /// Status message carrying this advisory.
    pub fn to_message(&self) -> Message {
        let mut message = Message::with_type(ADVISORY_DESCRIPTION, MessageType::Status);
        message.set_body(format!(
            "{QUEUE_KEY}={}&{STATE_KEY}={}",
            self.queue,
            u8::from(self.online)
        ));
        message
    }

    /// Interpret a received message. `None` when it is not an advisory.
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.kind() != MessageType::Status || message.description() != ADVISORY_DESCRIPTION
        {
            return None;
        }
        let mut queue = None;
        let mut online = None;
        for pair in message.body().split('&') {
            match pair.split_once('=') {
                Some((QUEUE_KEY, value)) => queue = Some(value.to_owned()),
                Some((STATE_KEY, "1")) => online = Some(true),
                Some((STATE_KEY, "0")) => online = Some(false),
                _ => {}
            }
        }
        Some(Self {
            queue: queue?,
            online: online?,
        })
    }

    /// Build from a relayed wire buffer.
    pub fn from_buffer(buffer: &str) -> Result<Self> {
        let message = Message::parse(buffer)?;
        Self::from_message(&message)
            .ok_or_else(|| MessagingError::MalformedFrame("not an advisory message".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_relays_through_buffer() {
        let advisory = AdvisoryMessage::new("/xmessage/node1/fst", true);
        let message = advisory.to_message();
        assert_eq!(message.kind(), MessageType::Status);
        let relayed = AdvisoryMessage::from_buffer(&message.message_buffer()).expect("advisory");
        assert_eq!(relayed, advisory);
    }

    #[test]
    fn ordinary_messages_are_not_advisories() {
        let mut message = Message::new("update");
        message.set_body("xmq.advisoryqueue=/q&xmq.advisorystate=1");
        assert!(AdvisoryMessage::from_message(&message).is_none());
        assert!(AdvisoryMessage::from_buffer(&message.message_buffer()).is_err());
    }
}
