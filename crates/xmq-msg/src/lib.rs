//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod advisory;
pub mod broker_url;
pub mod client;
pub mod codec;
pub mod logging;
pub mod message;
pub mod routing;
pub mod transport;

use xmq_security::AuthError;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Upper bound on a serialized message accepted for sending.
pub const MAX_MESSAGE_SIZE: usize = 2_000_000;

/// Errors raised by the envelope codec, the transports and the client.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The broker URL could not be parsed or lacks a host.
    #[error("invalid broker url '{0}'")]
    InvalidUrl(String),
    /// The broker could not be reached or refused the operation.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// No broker has been added to the client.
    #[error("no broker configured")]
    NoBrokers,
    /// The wire buffer is not a well formed envelope.
    #[error("malformed message: {0}")]
    MalformedFrame(String),
    /// Serialized form exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Serialized size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// `decode` called on a message whose body is not encrypted.
    #[error("message is not encoded")]
    NotEncoded,
    /// `encode` called twice on the same message.
    #[error("message is already encoded")]
    AlreadyEncoded,
    /// `verify` called on a message without a signature.
    #[error("message is not signed")]
    NotSigned,
    /// Body digest does not match the signed digest.
    #[error("body digest mismatch")]
    DigestMismatch,
    /// Signature or encryption failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub use advisory::AdvisoryMessage;
pub use broker_url::BrokerUrl;
pub use client::{BrokerOptions, MessageClient, MessagingMetrics};
pub use logging::{log_message, MessageDirection, MessagingMetricsExporter};
pub use message::{AuthState, Message, MessageHeader, MessageType};
pub use routing::queue_matches;
pub use transport::{
    AdvisoryFlags, Connector, Delivery, InMemoryBroker, InMemoryNetwork, Transport,
};
