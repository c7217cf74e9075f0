//! Fuzz target for gap-tolerant expiry
//!
//! # Strategy
//!
//! - Arbitrary creation times (unordered, duplicated, far apart)
//! - Arbitrary lifetimes and evaluation times
//! - Both single- and double-offset policies
//!
//! # Invariants
//!
//! - Expiry NEVER panics or overflows
//! - Nothing younger than the minimum key lifetime expires
//! - Expired generations come back ascending and are all known
//! - Moving time forward never un-expires a generation
//! - Double offset never expires anything single offset keeps

#![no_main]

use std::{collections::BTreeMap, time::Duration};

use arbitrary::Arbitrary;
use ephemera_core::{EkGeneration, ExpiryPolicy, KeyLifetimes, UnixTime, expired_generations};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct ExpiryScenario {
    /// (generation, creation time in hours)
    ctimes: Vec<(u16, u32)>,
    min_lifetime_hours: u16,
    staleness_hours: u16,
    now_hours: u32,
    later_by_hours: u16,
}

const HOUR: u64 = 60 * 60;

fuzz_target!(|scenario: ExpiryScenario| {
    let ctimes: BTreeMap<EkGeneration, UnixTime> = scenario
        .ctimes
        .iter()
        .take(64)
        .map(|(g, h)| (EkGeneration(u64::from(*g)), UnixTime(u64::from(*h) * HOUR)))
        .collect();
    let lifetimes = KeyLifetimes {
        min_key_lifetime: Duration::from_secs(u64::from(scenario.min_lifetime_hours) * HOUR),
        max_key_staleness: Duration::from_secs(u64::from(scenario.staleness_hours) * HOUR),
        ..KeyLifetimes::default()
    };
    let now = UnixTime(u64::from(scenario.now_hours) * HOUR);
    let later = UnixTime(now.0 + u64::from(scenario.later_by_hours) * HOUR);

    let single = expired_generations(&ctimes, now, &lifetimes, ExpiryPolicy::SingleOffset);
    let double = expired_generations(&ctimes, now, &lifetimes, ExpiryPolicy::DoubleOffset);

    assert!(single.windows(2).all(|w| w[0] < w[1]), "not ascending");
    for generation in &single {
        let ctime = ctimes[generation];
        assert!(now.since(ctime) >= lifetimes.min_key_lifetime, "young key expired");
    }
    for generation in &double {
        assert!(single.contains(generation), "double offset expired a kept key");
    }

    let single_later = expired_generations(&ctimes, later, &lifetimes, ExpiryPolicy::SingleOffset);
    for generation in &single {
        assert!(single_later.contains(generation), "generation came back to life");
    }
});
