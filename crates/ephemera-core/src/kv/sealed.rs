//! Encryption at rest for any [`KvStore`].
//!
//! Values are stored as `nonce || XChaCha20-Poly1305(value)` with the storage
//! key as associated data, so a value copied under another key fails to open
//! just like a flipped bit. Both surface as [`KvError::Corrupted`].

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::{KvError, KvStore};

const NONCE_SIZE: usize = 24;

/// KV wrapper that seals every value under a local storage key.
pub struct SealedKv<S: KvStore> {
    inner: S,
    cipher: XChaCha20Poly1305,
}

impl<S: KvStore> SealedKv<S> {
    /// Wrap `inner`, sealing values under `key`.
    ///
    /// `key` MUST be secret, device-local material.
    pub fn new(inner: S, key: [u8; 32]) -> Self {
        Self { inner, cipher: XChaCha20Poly1305::new((&key).into()) }
    }

    /// Underlying store holding ciphertext.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, key: &str, value: &[u8]) -> Result<Vec<u8>, KvError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|e| KvError::Io(format!("nonce generation: {e}")))?;

        let Ok(ciphertext) =
            self.cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: value, aad: key.as_bytes() })
        else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, key: &str, sealed: &[u8]) -> Result<Vec<u8>, KvError> {
        if sealed.len() < NONCE_SIZE {
            return Err(KvError::Corrupted { key: key.to_string(), reason: "truncated".into() });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: key.as_bytes() })
            .map_err(|_| KvError::Corrupted {
                key: key.to_string(),
                reason: "authentication failed".into(),
            })
    }
}

impl<S: KvStore> KvStore for SealedKv<S> {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let sealed = self.seal(key, value)?;
        self.inner.put(key, &sealed)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match self.inner.get(key)? {
            Some(sealed) => self.open(key, &sealed).map(Some),
            None => Ok(None),
        }
    }

    fn erase(&self, key: &str) -> Result<(), KvError> {
        self.inner.erase(key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.inner.list_keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, contract};

    fn sealed() -> SealedKv<MemoryKv> {
        SealedKv::new(MemoryKv::new(), [7; 32])
    }

    #[test]
    fn sealed_contract() {
        contract::roundtrip(&sealed());
        contract::missing_is_none(&sealed());
        contract::prefix_listing(&sealed());
    }

    #[test]
    fn values_are_not_stored_in_plaintext() {
        let kv = sealed();
        kv.put("k", b"secret seed").unwrap();

        let raw = kv.inner().get("k").unwrap().unwrap();
        assert!(!raw.windows(11).any(|w| w == b"secret seed"));
    }

    #[test]
    fn flipped_bit_is_corruption_not_absence() {
        let kv = sealed();
        kv.put("k", b"value").unwrap();
        kv.inner().tamper("k", |v| {
            let last = v.len() - 1;
            v[last] ^= 0x01;
        });

        assert!(matches!(kv.get("k"), Err(KvError::Corrupted { .. })));
    }

    #[test]
    fn value_moved_to_another_key_is_rejected() {
        let kv = sealed();
        kv.put("a", b"value").unwrap();
        let raw = kv.inner().get("a").unwrap().unwrap();
        kv.inner().put("b", &raw).unwrap();

        assert!(matches!(kv.get("b"), Err(KvError::Corrupted { .. })));
    }

    #[test]
    fn truncated_value_is_corruption() {
        let kv = sealed();
        kv.inner().put("k", b"short").unwrap();
        assert!(matches!(kv.get("k"), Err(KvError::Corrupted { .. })));
    }
}
