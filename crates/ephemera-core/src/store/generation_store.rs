//! Per-principal generation index over a [`KvStore`].
//!
//! Each principal's records live under `ek/<kind>/<principal>/<generation>`.
//! The first access to a principal lists and decodes all of its records into
//! an in-memory index; later reads are served from that index until
//! [`GenerationStore::clear_cache`] drops it.
//!
//! # Invariants
//!
//! - A record's embedded generation equals the generation it is stored under
//! - The KV write happens before the cache is touched, so the cache never
//!   holds a record the KV does not
//! - One corrupted record never fails reads of its siblings

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    config::KeyLifetimes,
    error::EkError,
    expiry::{ExpiryPolicy, expired_generations},
    kv::{KvError, KvStore},
    metadata::{EkBoxed, EkMetadata, EphemeralKey},
    types::{EkGeneration, EkKind, Principal, UnixTime},
};

/// A value that can be stored in a [`GenerationStore`].
pub trait GenerationRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Generation the record belongs to.
    fn generation(&self) -> EkGeneration;

    /// Merkle ctime of the generation (drives expiry).
    fn ctime(&self) -> UnixTime;
}

impl<M: EkMetadata> GenerationRecord for EphemeralKey<M> {
    fn generation(&self) -> EkGeneration {
        self.metadata.generation()
    }

    fn ctime(&self) -> UnixTime {
        self.metadata.ctime()
    }
}

impl GenerationRecord for EkBoxed {
    fn generation(&self) -> EkGeneration {
        self.generation
    }

    fn ctime(&self) -> UnixTime {
        self.ctime
    }
}

#[derive(Debug, Clone)]
enum CacheEntry<R> {
    Record(R),
    Error(EkError),
}

type Index<R> = BTreeMap<EkGeneration, CacheEntry<R>>;

/// Cache plus persistence for one key kind.
pub struct GenerationStore<R> {
    kind: EkKind,
    kv: Arc<dyn KvStore>,
    indexes: Mutex<HashMap<Principal, Index<R>>>,
}

impl<R: GenerationRecord> GenerationStore<R> {
    /// Store for `kind` records persisted in `kv`.
    pub fn new(kind: EkKind, kv: Arc<dyn KvStore>) -> Self {
        Self { kind, kv, indexes: Mutex::new(HashMap::new()) }
    }

    /// Kind of record held.
    pub fn kind(&self) -> EkKind {
        self.kind
    }

    /// Persist `record` as `principal`'s `generation`.
    ///
    /// # Errors
    ///
    /// - `Corrupted` if the record's generation differs from `generation`
    /// - `Storage` if the KV write fails (the cache is left untouched)
    pub fn put(&self, principal: &Principal, generation: EkGeneration, record: R) -> Result<(), EkError> {
        if record.generation() != generation {
            return Err(EkError::Corrupted {
                kind: self.kind,
                generation,
                reason: format!("record is generation {}", record.generation()),
            });
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(&record, &mut bytes).map_err(EkError::serialization)?;

        let mut indexes = self.indexes.lock();
        self.kv.put(&self.key(principal, generation), &bytes)?;
        if let Some(index) = indexes.get_mut(principal) {
            index.insert(generation, CacheEntry::Record(record));
        }
        Ok(())
    }

    /// Record for `principal`'s `generation`.
    ///
    /// Returns `Ok(None)` if absent, and a previously cached error verbatim.
    pub fn get(&self, principal: &Principal, generation: EkGeneration) -> Result<Option<R>, EkError> {
        self.with_index(principal, |index| match index.get(&generation) {
            Some(CacheEntry::Record(record)) => Ok(Some(record.clone())),
            Some(CacheEntry::Error(err)) => Err(err.clone()),
            None => Ok(None),
        })?
    }

    /// Highest stored generation, `None` if the principal has none.
    ///
    /// Generations with a cached error count only if `include_errs`.
    pub fn max_generation(
        &self,
        principal: &Principal,
        include_errs: bool,
    ) -> Result<Option<EkGeneration>, EkError> {
        self.with_index(principal, |index| {
            index
                .iter()
                .rev()
                .find(|(_, entry)| include_errs || matches!(entry, CacheEntry::Record(_)))
                .map(|(generation, _)| *generation)
        })
    }

    /// Every readable record, errors skipped.
    pub fn get_all(&self, principal: &Principal) -> Result<BTreeMap<EkGeneration, R>, EkError> {
        self.with_index(principal, |index| {
            index
                .iter()
                .filter_map(|(generation, entry)| match entry {
                    CacheEntry::Record(record) => Some((*generation, record.clone())),
                    CacheEntry::Error(_) => None,
                })
                .collect()
        })
    }

    /// Remove one generation from the KV and the cache.
    pub fn delete(&self, principal: &Principal, generation: EkGeneration) -> Result<(), EkError> {
        let mut indexes = self.indexes.lock();
        self.kv.erase(&self.key(principal, generation))?;
        if let Some(index) = indexes.get_mut(principal) {
            index.remove(&generation);
        }
        Ok(())
    }

    /// Remove several generations; tries them all and returns the first error.
    pub fn delete_many(
        &self,
        principal: &Principal,
        generations: &[EkGeneration],
    ) -> Result<(), EkError> {
        let mut first_error = None;
        for generation in generations {
            if let Err(err) = self.delete(principal, *generation) {
                warn!(kind = %self.kind, %principal, %generation, error = %err, "delete failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remember that `generation` cannot be resolved right now.
    ///
    /// Only affects principals whose index is loaded; the error lives until
    /// the next [`Self::clear_cache`].
    pub fn cache_error(&self, principal: &Principal, generation: EkGeneration, err: EkError) {
        if let Some(index) = self.indexes.lock().get_mut(principal) {
            index.insert(generation, CacheEntry::Error(err));
        }
    }

    /// Drop every index; the next access reloads from the KV.
    pub fn clear_cache(&self) {
        self.indexes.lock().clear();
    }

    /// Drop one principal's index.
    pub fn clear_principal(&self, principal: &Principal) {
        self.indexes.lock().remove(principal);
    }

    /// Delete generations that expired at `now`. Returns what was expired.
    pub fn delete_expired(
        &self,
        principal: &Principal,
        now: UnixTime,
        lifetimes: &KeyLifetimes,
        policy: ExpiryPolicy,
    ) -> Result<Vec<EkGeneration>, EkError> {
        let ctimes = self.with_index(principal, |index| {
            index
                .iter()
                .filter_map(|(generation, entry)| match entry {
                    CacheEntry::Record(record) => Some((*generation, record.ctime())),
                    CacheEntry::Error(_) => None,
                })
                .collect::<BTreeMap<_, _>>()
        })?;

        let expired = expired_generations(&ctimes, now, lifetimes, policy);
        if !expired.is_empty() {
            debug!(kind = %self.kind, %principal, ?expired, "deleting expired generations");
            self.delete_many(principal, &expired)?;
        }
        Ok(expired)
    }

    fn with_index<T>(
        &self,
        principal: &Principal,
        f: impl FnOnce(&Index<R>) -> T,
    ) -> Result<T, EkError> {
        let mut indexes = self.indexes.lock();
        let index = match indexes.entry(principal.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.load_index(principal)?),
        };
        Ok(f(index))
    }

    fn load_index(&self, principal: &Principal) -> Result<Index<R>, EkError> {
        let prefix = self.prefix(principal);
        let mut index = BTreeMap::new();

        for key in self.kv.list_keys(&prefix)? {
            let Some(generation) = key[prefix.len()..].parse::<u64>().ok().map(EkGeneration) else {
                warn!(kind = %self.kind, %key, "ignoring unparseable storage key");
                continue;
            };

            match self.read_record(&key, generation) {
                Ok(Some(record)) => {
                    index.insert(generation, CacheEntry::Record(record));
                },
                Ok(None) => {},
                Err(err @ EkError::Corrupted { .. }) => {
                    warn!(kind = %self.kind, %principal, %generation, error = %err, "erasing corrupted record");
                    if let Err(erase_err) = self.kv.erase(&key) {
                        warn!(%key, error = %erase_err, "failed to erase corrupted record");
                    }
                    index.insert(generation, CacheEntry::Error(err));
                },
                Err(err) => return Err(err),
            }
        }

        debug!(kind = %self.kind, %principal, entries = index.len(), "loaded generation index");
        Ok(index)
    }

    fn read_record(&self, key: &str, generation: EkGeneration) -> Result<Option<R>, EkError> {
        let corrupted = |reason: String| EkError::Corrupted { kind: self.kind, generation, reason };

        let bytes = match self.kv.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(KvError::Corrupted { reason, .. }) => return Err(corrupted(reason)),
            Err(err) => return Err(err.into()),
        };

        let record: R =
            ciborium::from_reader(bytes.as_slice()).map_err(|e| corrupted(e.to_string()))?;
        if record.generation() != generation {
            return Err(corrupted(format!("record is generation {}", record.generation())));
        }
        Ok(Some(record))
    }

    fn prefix(&self, principal: &Principal) -> String {
        format!("ek/{}/", principal.storage_component())
    }

    fn key(&self, principal: &Principal, generation: EkGeneration) -> String {
        format!("{}{:020}", self.prefix(principal), generation.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use ephemera_crypto::{DeriveReason, Seed, derive_dh_keypair};

    use super::*;
    use crate::{
        kv::MemoryKv,
        metadata::{DeviceEk, DeviceEkMetadata},
        types::{DeviceId, HashMeta},
    };

    fn device() -> Principal {
        Principal::Device(DeviceId::new("phone"))
    }

    fn record(generation: u64) -> DeviceEk {
        let seed = Seed::from_bytes([generation as u8; 32]);
        let kid = derive_dh_keypair(&seed, DeriveReason::DeviceEkEncryption).kid();
        DeviceEk {
            seed,
            metadata: DeviceEkMetadata {
                kid,
                generation: EkGeneration(generation),
                hash_meta: HashMeta::default(),
                ctime: UnixTime(generation * 100),
                device_ctime: UnixTime(generation * 100),
            },
        }
    }

    fn store_with(kv: &MemoryKv, generations: &[u64]) -> GenerationStore<DeviceEk> {
        let store = GenerationStore::new(EkKind::Device, Arc::new(kv.clone()));
        for g in generations {
            store.put(&device(), EkGeneration(*g), record(*g)).unwrap();
        }
        store
    }

    /// KV whose writes can be switched off.
    struct FlakyKv {
        inner: MemoryKv,
        fail_puts: AtomicBool,
    }

    impl KvStore for FlakyKv {
        fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(KvError::Io("disk full".into()));
            }
            self.inner.put(key, value)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key)
        }

        fn erase(&self, key: &str) -> Result<(), KvError> {
            self.inner.erase(key)
        }

        fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            self.inner.list_keys(prefix)
        }
    }

    #[test]
    fn put_then_get() {
        let store = store_with(&MemoryKv::new(), &[1, 2]);

        assert_eq!(store.get(&device(), EkGeneration(2)).unwrap(), Some(record(2)));
        assert_eq!(store.get(&device(), EkGeneration(3)).unwrap(), None);
        assert_eq!(store.max_generation(&device(), false).unwrap(), Some(EkGeneration(2)));
    }

    #[test]
    fn records_survive_a_fresh_store() {
        let kv = MemoryKv::new();
        store_with(&kv, &[1, 2, 3]);

        let reopened: GenerationStore<DeviceEk> =
            GenerationStore::new(EkKind::Device, Arc::new(kv));
        assert_eq!(reopened.get_all(&device()).unwrap().len(), 3);
    }

    #[test]
    fn empty_principal_has_no_max() {
        let store = store_with(&MemoryKv::new(), &[]);
        assert_eq!(store.max_generation(&device(), true).unwrap(), None);
    }

    #[test]
    fn put_rejects_mismatched_generation() {
        let kv = MemoryKv::new();
        let store = store_with(&kv, &[]);

        let result = store.put(&device(), EkGeneration(4), record(5));
        assert!(matches!(result, Err(EkError::Corrupted { .. })));
        assert!(kv.is_empty());
    }

    #[test]
    fn failed_write_leaves_cache_untouched() {
        let kv = Arc::new(FlakyKv { inner: MemoryKv::new(), fail_puts: AtomicBool::new(false) });
        let store: GenerationStore<DeviceEk> = GenerationStore::new(EkKind::Device, kv.clone());
        store.put(&device(), EkGeneration(1), record(1)).unwrap();

        kv.fail_puts.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.put(&device(), EkGeneration(2), record(2)),
            Err(EkError::Storage(KvError::Io(_)))
        ));

        assert_eq!(store.get(&device(), EkGeneration(2)).unwrap(), None);
        assert_eq!(store.max_generation(&device(), true).unwrap(), Some(EkGeneration(1)));
    }

    #[test]
    fn corrupted_record_is_isolated_and_erased() {
        let kv = MemoryKv::new();
        store_with(&kv, &[1, 2, 3]);
        let key = format!("ek/{}/{:020}", device().storage_component(), 2);
        assert!(kv.tamper(&key, |bytes| bytes.truncate(3)));

        let store: GenerationStore<DeviceEk> =
            GenerationStore::new(EkKind::Device, Arc::new(kv.clone()));

        assert_eq!(store.get(&device(), EkGeneration(1)).unwrap(), Some(record(1)));
        assert_eq!(store.get(&device(), EkGeneration(3)).unwrap(), Some(record(3)));
        assert!(matches!(
            store.get(&device(), EkGeneration(2)),
            Err(EkError::Corrupted { generation: EkGeneration(2), .. })
        ));

        let all = store.get_all(&device()).unwrap();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![EkGeneration(1), EkGeneration(3)]);
        assert_eq!(kv.get(&key).unwrap(), None);
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn record_under_wrong_key_is_corrupted() {
        let kv = MemoryKv::new();
        let mut bytes = Vec::new();
        ciborium::into_writer(&record(5), &mut bytes).unwrap();
        kv.put(&format!("ek/{}/{:020}", device().storage_component(), 4), &bytes).unwrap();

        let store: GenerationStore<DeviceEk> = GenerationStore::new(EkKind::Device, Arc::new(kv));
        assert!(matches!(store.get(&device(), EkGeneration(4)), Err(EkError::Corrupted { .. })));
    }

    #[test]
    fn cached_errors_count_only_when_asked() {
        let store = store_with(&MemoryKv::new(), &[1, 2, 3]);
        store.get(&device(), EkGeneration(1)).unwrap();

        let err = EkError::Corrupted { kind: EkKind::Device, generation: EkGeneration(4), reason: "x".into() };
        store.cache_error(&device(), EkGeneration(4), err.clone());

        assert_eq!(store.max_generation(&device(), false).unwrap(), Some(EkGeneration(3)));
        assert_eq!(store.max_generation(&device(), true).unwrap(), Some(EkGeneration(4)));
        assert_eq!(store.get(&device(), EkGeneration(4)), Err(err));

        store.clear_cache();
        assert_eq!(store.get(&device(), EkGeneration(4)).unwrap(), None);
    }

    #[test]
    fn delete_many_removes_only_named_generations() {
        let kv = MemoryKv::new();
        let store = store_with(&kv, &[1, 2, 3, 4]);

        store.delete_many(&device(), &[EkGeneration(1), EkGeneration(3)]).unwrap();

        let left = store.get_all(&device()).unwrap();
        assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![EkGeneration(2), EkGeneration(4)]);
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn delete_expired_uses_record_ctimes() {
        let store = store_with(&MemoryKv::new(), &[1, 2]);
        let lifetimes = KeyLifetimes {
            min_key_lifetime: std::time::Duration::from_secs(1_000),
            max_key_staleness: std::time::Duration::from_secs(10_000),
            ..KeyLifetimes::default()
        };

        // gen 1 at t=100 with successor at t=200: retained until 100 + 1000 + 100
        let expired = store
            .delete_expired(&device(), UnixTime(1_200), &lifetimes, ExpiryPolicy::SingleOffset)
            .unwrap();

        assert_eq!(expired, vec![EkGeneration(1)]);
        assert_eq!(store.max_generation(&device(), false).unwrap(), Some(EkGeneration(2)));
    }

    #[test]
    fn principals_are_independent() {
        let store = store_with(&MemoryKv::new(), &[1]);
        let other = Principal::Device(DeviceId::new("laptop"));

        assert_eq!(store.max_generation(&other, true).unwrap(), None);
        store.put(&other, EkGeneration(7), record(7)).unwrap();
        assert_eq!(store.max_generation(&device(), true).unwrap(), Some(EkGeneration(1)));
    }
}
