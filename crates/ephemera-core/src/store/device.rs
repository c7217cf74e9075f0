use std::{collections::BTreeMap, sync::Arc};

use super::GenerationStore;
use crate::{
    config::KeyLifetimes,
    error::EkError,
    expiry::ExpiryPolicy,
    kv::KvStore,
    metadata::DeviceEk,
    types::{DeviceId, EkGeneration, EkKind, MerkleRoot, Principal},
};

/// Device keys of the local device. The seeds never leave this store.
pub struct DeviceEkStorage {
    store: GenerationStore<DeviceEk>,
}

impl DeviceEkStorage {
    /// Storage persisted in `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { store: GenerationStore::new(EkKind::Device, kv) }
    }

    /// Persist `ek` for `device`.
    pub fn put(&self, device: &DeviceId, ek: DeviceEk) -> Result<(), EkError> {
        self.store.put(&principal(device), ek.generation(), ek)
    }

    /// Key at `generation`, `None` if absent.
    pub fn get(&self, device: &DeviceId, generation: EkGeneration) -> Result<Option<DeviceEk>, EkError> {
        self.store.get(&principal(device), generation)
    }

    /// Every readable generation.
    pub fn get_all(&self, device: &DeviceId) -> Result<BTreeMap<EkGeneration, DeviceEk>, EkError> {
        self.store.get_all(&principal(device))
    }

    /// Highest stored generation.
    pub fn max_generation(
        &self,
        device: &DeviceId,
        include_errs: bool,
    ) -> Result<Option<EkGeneration>, EkError> {
        self.store.max_generation(&principal(device), include_errs)
    }

    /// Remove one generation.
    pub fn delete(&self, device: &DeviceId, generation: EkGeneration) -> Result<(), EkError> {
        self.store.delete(&principal(device), generation)
    }

    /// Delete device keys nothing can still be encrypted to.
    pub fn delete_expired(
        &self,
        device: &DeviceId,
        merkle_root: &MerkleRoot,
        lifetimes: &KeyLifetimes,
    ) -> Result<Vec<EkGeneration>, EkError> {
        self.store.delete_expired(
            &principal(device),
            merkle_root.ctime,
            lifetimes,
            ExpiryPolicy::DoubleOffset,
        )
    }

    /// Drop the in-memory index.
    pub fn clear_cache(&self) {
        self.store.clear_cache();
    }
}

fn principal(device: &DeviceId) -> Principal {
    Principal::Device(device.clone())
}
