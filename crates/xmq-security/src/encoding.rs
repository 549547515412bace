//! ---
//! xmq_section: "06-security-access-control"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message authentication, encryption, and key material handling."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::Result;

/// Encode binary digest or ciphertext bytes for the text envelope.
pub fn base64_encode(bytes: impl AsRef<[u8]>) -> String {
    BASE64.encode(bytes)
}

/// Decode base64 text, rejecting bad symbols, bad padding and trailing garbage.
pub fn base64_decode(text: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(text.trim_end_matches(['\r', '\n']))?)
}
