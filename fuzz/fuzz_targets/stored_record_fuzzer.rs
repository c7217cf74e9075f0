//! Fuzz target for generation stores over corrupted and failing storage
//!
//! Writes real device keys through a [`ChaoticKv`], then overwrites random
//! records with garbage and reloads the index.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Puts, deletes and cache drops interleaved with raw garbage writes
//! - Reload from the uninjected store at the end
//!
//! # Invariants
//!
//! - Stores NEVER panic on storage errors or garbage records
//! - A readable record is exactly the key that was written for it
//! - Garbage records are erased when the index loads

#![no_main]

use std::{collections::HashMap, sync::Arc};

use arbitrary::Arbitrary;
use ephemera_core::{
    ChaoticKv, DeviceEk, DeviceEkMetadata, DeviceEkStorage, DeviceId, EkGeneration, HashMeta,
    KvStore, MemoryKv, Principal, UnixTime,
};
use ephemera_crypto::{DeriveReason, Seed, derive_dh_keypair};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct StoreScenario {
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<StoreOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum StoreOperation {
    Put { generation: u8 },
    Delete { generation: u8 },
    Garbage { generation: u8, bytes: Vec<u8> },
    ClearCache,
    Read,
}

fn device_key(generation: u8) -> DeviceEk {
    let seed = Seed::from_bytes([generation; 32]);
    DeviceEk {
        metadata: DeviceEkMetadata {
            kid: derive_dh_keypair(&seed, DeriveReason::DeviceEkEncryption).kid(),
            generation: EkGeneration(u64::from(generation)),
            hash_meta: HashMeta::default(),
            ctime: UnixTime(u64::from(generation)),
            device_ctime: UnixTime(u64::from(generation)),
        },
        seed,
    }
}

fn storage_key(device: &DeviceId, generation: u8) -> String {
    format!("ek/{}/{:020}", Principal::Device(device.clone()).storage_component(), generation)
}

fuzz_target!(|scenario: StoreScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let inner = MemoryKv::new();
    let chaotic = ChaoticKv::with_seed(inner.clone(), failure_rate, scenario.chaos_seed);
    let storage = DeviceEkStorage::new(Arc::new(chaotic));
    let device = DeviceId::new("fuzz-device");

    // Generations whose persisted bytes are garbage.
    let mut garbage: HashMap<u8, bool> = HashMap::new();

    for op in scenario.operations.iter().take(64) {
        match op {
            StoreOperation::Put { generation } => {
                if storage.put(&device, device_key(*generation)).is_ok() {
                    garbage.insert(*generation, false);
                }
            },
            StoreOperation::Delete { generation } => {
                let _ = storage.delete(&device, EkGeneration(u64::from(*generation)));
            },
            StoreOperation::Garbage { generation, bytes } => {
                if inner.put(&storage_key(&device, *generation), bytes).is_ok() {
                    garbage.insert(*generation, true);
                }
            },
            StoreOperation::ClearCache => storage.clear_cache(),
            StoreOperation::Read => {
                let Ok(all) = storage.get_all(&device) else {
                    continue;
                };
                for (generation, key) in all {
                    let Ok(generation) = u8::try_from(generation.0) else {
                        continue;
                    };
                    if !garbage.get(&generation).copied().unwrap_or(false) {
                        assert_eq!(key, device_key(generation), "readable record differs from what was written");
                    }
                }
            },
        }
    }

    // Reload without injected failures: garbage must not survive as readable.
    let clean = DeviceEkStorage::new(Arc::new(inner.clone()));
    let Ok(all) = clean.get_all(&device) else {
        unreachable!("memory store does not fail");
    };
    for (generation, key) in all {
        assert_eq!(key.metadata.generation, generation);
    }
    for key in inner.list_keys("ek/").unwrap_or_default() {
        let Some(generation) = key.rsplit('/').next().and_then(|g| g.parse::<u64>().ok()) else {
            continue;
        };
        assert!(
            clean.get(&device, EkGeneration(generation)).is_ok(),
            "garbage record left behind after index load"
        );
    }
});
