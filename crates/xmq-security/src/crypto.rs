//! ---
//! xmq_section: "06-security-access-control"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message authentication, encryption, and key material handling."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use hmac::{Hmac, Mac};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha2::{Digest, Sha256};

use crate::encoding::{base64_decode, base64_encode};
use crate::keyring::Keyring;
use crate::{AuthError, Result};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_SCHEME: &str = "hmac";

/// Opaque symmetric key material (32 bytes) for encryption/HMAC purposes.
#[derive(Debug, Clone)]
pub struct KeyMaterial(pub [u8; 32]);

impl KeyMaterial {
    /// Generate random key material.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Render as base64 string.
    pub fn to_base64(&self) -> String {
        base64_encode(self.0)
    }

    /// Compute a SHA-256 fingerprint of the key for audit/logging.
    pub fn fingerprint(&self) -> String {
        Self::fingerprint_of(&self.0)
    }

    pub(crate) fn fingerprint_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

/// Base64 SHA-256 digest of a message body.
pub fn digest(body: &[u8]) -> String {
    base64_encode(Sha256::digest(body))
}

impl Keyring {
    /// Authenticate `payload` as this process's identity.
    ///
    /// Returns `hmac:<key-id>:<base64 tag>`.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let (key_id, key) = self.signing_key()?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        mac.update(payload);
        let tag = mac.finalize().into_bytes();
        Ok(format!("{SIGNATURE_SCHEME}:{key_id}:{}", base64_encode(tag)))
    }

    /// Check a signature produced by [`Keyring::sign`] on any node sharing the key.
    ///
    /// Returns the signer's key id.
    pub fn verify(&self, signature: &str, payload: &[u8]) -> Result<String> {
        let mut parts = signature.splitn(3, ':');
        let (scheme, key_id, tag) = match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(key_id), Some(tag)) if !key_id.is_empty() => (scheme, key_id, tag),
            _ => return Err(AuthError::MalformedSignature(signature.to_owned())),
        };
        if scheme != SIGNATURE_SCHEME {
            return Err(AuthError::MalformedSignature(format!(
                "unsupported scheme '{scheme}'"
            )));
        }
        let tag = base64_decode(tag)?;
        let key = self.verification_key(key_id)?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        mac.update(payload);
        mac.verify_slice(&tag)
            .map_err(|_| AuthError::SignatureMismatch)?;
        Ok(key_id.to_owned())
    }

    /// Seal `plaintext` with the shared secret. `aad` is bound to the ciphertext
    /// without being encrypted.
    ///
    /// Output is `base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<String> {
        let key = self.aead_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| AuthError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(base64_encode(sealed))
    }

    /// Inverse of [`Keyring::encrypt`]. Fails on a wrong key, a different `aad`
    /// or any modified byte.
    pub fn decrypt(&self, sealed: &str, aad: &[u8]) -> Result<Vec<u8>> {
        let key = self.aead_key()?;
        let raw = base64_decode(sealed)?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(AuthError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| AuthError::Decrypt)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| AuthError::Decrypt)?;
        Ok(plaintext.to_vec())
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let secret = self.shared_secret()?;
        let key_bytes = Sha256::digest(secret);
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| AuthError::InvalidKey("shared secret rejected by cipher".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyFile;

    fn keyring(identity: &str) -> Keyring {
        Keyring::from_key_file(KeyFile::generate(identity)).expect("generated keyring")
    }

    #[test]
    fn random_key_has_32_bytes() {
        let key = KeyMaterial::generate();
        assert_eq!(key.0.len(), 32);
        assert_eq!(key.to_base64().len(), 44);
        assert_eq!(key.fingerprint().len(), 64);
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let ring = keyring("node1");
        let signature = ring.sign(b"id=1;body=abc").expect("sign");
        assert!(signature.starts_with("hmac:node1:"));
        assert_eq!(ring.verify(&signature, b"id=1;body=abc").expect("verify"), "node1");
        assert!(matches!(
            ring.verify(&signature, b"id=1;body=abd"),
            Err(AuthError::SignatureMismatch)
        ));
    }

    #[test]
    fn verify_rejects_unknown_and_malformed_signatures() {
        let signer = keyring("node1");
        let other = keyring("node2");
        let signature = signer.sign(b"payload").expect("sign");
        assert!(matches!(
            other.verify(&signature, b"payload"),
            Err(AuthError::UnknownKey(_))
        ));
        assert!(matches!(
            signer.verify("garbage", b"payload"),
            Err(AuthError::MalformedSignature(_))
        ));
        assert!(matches!(
            signer.verify("rsa:node1:AAAA", b"payload"),
            Err(AuthError::MalformedSignature(_))
        ));
    }

    #[test]
    fn encryption_roundtrip_and_wrong_key() {
        let ring = keyring("node1");
        let sealed = ring.encrypt(b"secret body", b"msg-1").expect("encrypt");
        assert_eq!(ring.decrypt(&sealed, b"msg-1").expect("decrypt"), b"secret body");
        assert!(matches!(ring.decrypt(&sealed, b"msg-2"), Err(AuthError::Decrypt)));

        let stranger = keyring("node1");
        assert!(matches!(stranger.decrypt(&sealed, b"msg-1"), Err(AuthError::Decrypt)));
    }

    #[test]
    fn encryption_uses_fresh_nonces() {
        let ring = keyring("node1");
        let first = ring.encrypt(b"same", b"id").expect("encrypt");
        let second = ring.encrypt(b"same", b"id").expect("encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn plain_keyring_refuses_crypto() {
        let ring = Keyring::plain();
        assert!(matches!(ring.sign(b"x"), Err(AuthError::NoKeyMaterial(_))));
        assert!(matches!(ring.encrypt(b"x", b""), Err(AuthError::NoKeyMaterial(_))));
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
    }
}
