//! ---
//! xmq_section: "06-security-access-control"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message authentication, encryption, and key material handling."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod crypto;
pub mod encoding;
pub mod keyring;

/// Shared result type for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Failures raised while loading key material or protecting a message.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The operation needs key material that was never configured.
    #[error("no {0} configured")]
    NoKeyMaterial(&'static str),
    /// A signature names an identity missing from the keyring.
    #[error("unknown key id '{0}'")]
    UnknownKey(String),
    /// The signature field does not follow `hmac:<key-id>:<base64>`.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    /// The signature did not match the signed payload.
    #[error("signature mismatch")]
    SignatureMismatch,
    /// Ciphertext could not be opened with the shared secret.
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    Decrypt,
    /// Sealing the payload failed.
    #[error("encryption failed")]
    Encrypt,
    /// A configured key is unusable.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    /// Wrapper for malformed base64 input.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Wrapper for IO errors while reading the key file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for key file syntax errors.
    #[error("key file parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

pub use crypto::{digest, KeyMaterial};
pub use encoding::{base64_decode, base64_encode};
pub use keyring::{KeyFile, Keyring};
