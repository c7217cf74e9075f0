//! Key/value substrate under the generation stores.
//!
//! The trait is synchronous: every backend either lives in memory or uses an
//! embedded database, and callers never hold a KV call across an `.await`.
//!
//! Corruption is reported as [`KvError::Corrupted`], distinct from a missing
//! key (`Ok(None)`), so the stores above can isolate one bad record.

mod chaotic;
mod memory;
mod redb;
mod sealed;

pub use chaotic::ChaoticKv;
pub use memory::MemoryKv;
use thiserror::Error;

pub use self::{redb::RedbKv, sealed::SealedKv};

/// Errors from a [`KvStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The value under `key` exists but cannot be trusted
    #[error("corrupted value at {key}: {reason}")]
    Corrupted {
        /// Key whose value is bad
        key: String,
        /// What failed (decryption, framing)
        reason: String,
    },

    /// The backend failed
    #[error("storage I/O error: {0}")]
    Io(String),
}

/// Byte-oriented key/value store.
///
/// Implementations are shared behind `Arc<dyn KvStore>`; all methods take
/// `&self` and synchronize internally.
pub trait KvStore: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Value under `key`, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Remove `key`. Erasing an absent key succeeds.
    fn erase(&self, key: &str) -> Result<(), KvError>;

    /// All keys starting with `prefix`, in ascending order.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share.

    use super::{KvError, KvStore};

    pub(crate) fn roundtrip(kv: &dyn KvStore) {
        kv.put("ek/a/1", b"one").unwrap();
        assert_eq!(kv.get("ek/a/1").unwrap(), Some(b"one".to_vec()));

        kv.put("ek/a/1", b"uno").unwrap();
        assert_eq!(kv.get("ek/a/1").unwrap(), Some(b"uno".to_vec()));
    }

    pub(crate) fn missing_is_none(kv: &dyn KvStore) {
        assert_eq!(kv.get("nope"), Ok::<_, KvError>(None));
        kv.erase("nope").unwrap();
    }

    pub(crate) fn prefix_listing(kv: &dyn KvStore) {
        kv.put("ek/b/2", b"x").unwrap();
        kv.put("ek/b/1", b"x").unwrap();
        kv.put("ek/bb/1", b"x").unwrap();
        kv.put("other", b"x").unwrap();

        assert_eq!(kv.list_keys("ek/b/").unwrap(), vec!["ek/b/1", "ek/b/2"]);

        kv.erase("ek/b/1").unwrap();
        assert_eq!(kv.list_keys("ek/b/").unwrap(), vec!["ek/b/2"]);
    }
}
