//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Percent escaping for the text envelope.
//!
//! Every field that is embedded between separators is escaped so that the
//! separator can never appear inside it. `%` and ASCII control characters
//! are always escaped; callers add their own separators.

use crate::{MessagingError, Result};

/// Escape `%`, control characters and every char in `reserved` as `%XX`.
pub fn escape(input: &str, reserved: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch == '%' || ch.is_ascii_control() || reserved.contains(&ch) {
            // reserved chars are ASCII by contract
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reverse [`escape`]. Truncated or non-hex escapes and invalid UTF-8 are errors.
pub fn unescape(input: &str) -> Result<String> {
    if !input.contains('%') {
        return Ok(input.to_owned());
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = bytes
                .get(idx + 1..idx + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| {
                    MessagingError::MalformedFrame(format!("bad escape at offset {idx}"))
                })?;
            out.push(hex);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| MessagingError::MalformedFrame("escaped field is not utf-8".into()))
}
