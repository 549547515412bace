//! ---
//! xmq_section: "06-security-access-control"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message authentication, encryption, and key material handling."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::KeyMaterial;
use crate::encoding::{base64_decode, base64_encode};
use crate::{AuthError, Result};

/// On-disk key file layout.
///
/// ```toml
/// identity = "node1"
/// shared_secret = "<base64>"
///
/// [keys]
/// node1 = "<base64>"
/// node2 = "<base64>"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFile {
    /// Identity used when this process signs.
    #[serde(default)]
    pub identity: Option<String>,
    /// Cluster-wide secret for body encryption.
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Signing secrets per identity, including our own.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl KeyFile {
    /// Fresh key file with random secrets for a single identity.
    pub fn generate(identity: &str) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(identity.to_owned(), KeyMaterial::generate().to_base64());
        Self {
            identity: Some(identity.to_owned()),
            shared_secret: Some(KeyMaterial::generate().to_base64()),
            keys,
        }
    }

    /// Render as TOML for writing to disk.
    pub fn to_toml(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

/// Key material loaded once at startup and shared by every client in a realm.
#[derive(Clone, Default)]
pub struct Keyring {
    identity: Option<String>,
    shared_secret: Option<Vec<u8>>,
    keys: BTreeMap<String, Vec<u8>>,
}

impl Keyring {
    /// Keyring without any material. Signing and encryption fail, plain traffic works.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Load key material from a key file.
    pub fn configure(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let keyring = Self::from_key_file(toml::from_str(&raw)?)?;
        info!(
            key_file = %path.display(),
            identity = keyring.identity.as_deref().unwrap_or("-"),
            keys = keyring.keys.len(),
            encryption = keyring.shared_secret.is_some(),
            "keyring configured"
        );
        Ok(keyring)
    }

    /// Build a keyring from an already parsed key file.
    pub fn from_key_file(file: KeyFile) -> Result<Self> {
        let shared_secret = file
            .shared_secret
            .as_deref()
            .map(decode_secret)
            .transpose()?;
        let mut keys = BTreeMap::new();
        for (id, secret) in &file.keys {
            keys.insert(id.clone(), decode_secret(secret)?);
        }
        if let Some(identity) = &file.identity {
            if !keys.contains_key(identity) {
                return Err(AuthError::InvalidKey(format!(
                    "identity '{identity}' has no entry in [keys]"
                )));
            }
        }
        Ok(Self {
            identity: file.identity,
            shared_secret,
            keys,
        })
    }

    /// Identity this process signs as.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// True when `sign` can succeed.
    pub fn can_sign(&self) -> bool {
        self.identity.is_some()
    }

    /// True when `encrypt`/`decrypt` can succeed.
    pub fn can_encrypt(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// True when no material at all was loaded.
    pub fn is_plain(&self) -> bool {
        self.identity.is_none() && self.shared_secret.is_none() && self.keys.is_empty()
    }

    pub(crate) fn signing_key(&self) -> Result<(&str, &[u8])> {
        let identity = self
            .identity
            .as_deref()
            .ok_or(AuthError::NoKeyMaterial("signing identity"))?;
        let key = self
            .keys
            .get(identity)
            .ok_or_else(|| AuthError::UnknownKey(identity.to_owned()))?;
        Ok((identity, key))
    }

    pub(crate) fn verification_key(&self, key_id: &str) -> Result<&[u8]> {
        self.keys
            .get(key_id)
            .map(Vec::as_slice)
            .ok_or_else(|| AuthError::UnknownKey(key_id.to_owned()))
    }

    pub(crate) fn shared_secret(&self) -> Result<&[u8]> {
        self.shared_secret
            .as_deref()
            .ok_or(AuthError::NoKeyMaterial("shared secret"))
    }

    /// Hex SHA-256 fingerprint of the signing key, for audit logs.
    pub fn fingerprint(&self) -> Option<String> {
        let (_, key) = self.signing_key().ok()?;
        Some(KeyMaterial::fingerprint_of(key))
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("identity", &self.identity)
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("encryption", &self.shared_secret.is_some())
            .finish()
    }
}

fn decode_secret(text: &str) -> Result<Vec<u8>> {
    let bytes = base64_decode(text)?;
    if bytes.len() < 16 {
        return Err(AuthError::InvalidKey(format!(
            "secret too short ({} bytes, need at least 16)",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Render raw bytes as a key file secret.
pub fn encode_secret(bytes: &[u8]) -> String {
    base64_encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_loads_generated_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.toml");
        fs::write(&path, KeyFile::generate("node1").to_toml()).expect("write key file");

        let keyring = Keyring::configure(&path).expect("configure");
        assert_eq!(keyring.identity(), Some("node1"));
        assert!(keyring.can_sign());
        assert!(keyring.can_encrypt());
        assert_eq!(keyring.fingerprint().map(|f| f.len()), Some(64));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Keyring::configure(dir.path().join("absent.toml")).expect_err("must fail");
        assert!(matches!(err, AuthError::Io(_)));
    }

    #[test]
    fn identity_without_key_is_rejected() {
        let file = KeyFile {
            identity: Some("ghost".into()),
            ..KeyFile::default()
        };
        assert!(matches!(
            Keyring::from_key_file(file),
            Err(AuthError::InvalidKey(_))
        ));
    }

    #[test]
    fn short_or_malformed_secret_is_rejected() {
        let mut file = KeyFile::generate("node1");
        file.shared_secret = Some(encode_secret(b"short"));
        assert!(matches!(
            Keyring::from_key_file(file),
            Err(AuthError::InvalidKey(_))
        ));

        let mut file = KeyFile::generate("node1");
        file.shared_secret = Some("%%%".into());
        assert!(matches!(
            Keyring::from_key_file(file),
            Err(AuthError::Base64(_))
        ));
    }

    #[test]
    fn plain_keyring_has_no_capabilities() {
        let keyring = Keyring::plain();
        assert!(keyring.is_plain());
        assert!(!keyring.can_sign());
        assert!(!keyring.can_encrypt());
        assert!(format!("{keyring:?}").contains("Keyring"));
    }
}
