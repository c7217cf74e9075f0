//! Gap-tolerant expiry.
//!
//! A generation must stay around long enough to decrypt everything encrypted
//! to it. Content can be encrypted to a generation until its successor exists,
//! so the retention window is `min_key_lifetime` plus the gap to the next
//! generation. If rotation stalls (the user was offline for weeks) the gap is
//! capped at `max_key_staleness`, since no sender boxes to a stale key.
//!
//! Device keys get a second offset: a user key can be boxed to device key
//! `n` until `n + 1` exists, and content can be encrypted to that user key
//! until *its* successor exists.

use std::{collections::BTreeMap, time::Duration};

use crate::{
    config::KeyLifetimes,
    types::{EkGeneration, UnixTime},
};

/// How many successor gaps extend a generation's retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// User, team and teambot keys
    SingleOffset,
    /// Device keys
    DoubleOffset,
}

/// Generations in `ctimes` that have expired at `now`, ascending.
pub fn expired_generations(
    ctimes: &BTreeMap<EkGeneration, UnixTime>,
    now: UnixTime,
    lifetimes: &KeyLifetimes,
    policy: ExpiryPolicy,
) -> Vec<EkGeneration> {
    let sorted: Vec<(EkGeneration, UnixTime)> = ctimes.iter().map(|(g, t)| (*g, *t)).collect();
    let cap = lifetimes.max_key_staleness;

    let gap = |index: usize| -> Duration {
        match (sorted.get(index), sorted.get(index + 1)) {
            (Some((_, this)), Some((_, next))) => next.since(*this).min(cap),
            _ => cap,
        }
    };

    sorted
        .iter()
        .enumerate()
        .filter_map(|(i, (generation, ctime))| {
            let mut retention = lifetimes.min_key_lifetime + gap(i);
            if policy == ExpiryPolicy::DoubleOffset {
                retention += gap(i + 1);
            }
            (now.since(*ctime) >= retention).then_some(*generation)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const DAY: u64 = 24 * 60 * 60;

    fn lifetimes(min_days: u64, staleness_days: u64) -> KeyLifetimes {
        KeyLifetimes {
            min_key_lifetime: Duration::from_secs(min_days * DAY),
            max_key_staleness: Duration::from_secs(staleness_days * DAY),
            ..KeyLifetimes::default()
        }
    }

    fn days(d: u64) -> UnixTime {
        UnixTime(d * DAY)
    }

    fn ctimes(pairs: &[(u64, u64)]) -> BTreeMap<EkGeneration, UnixTime> {
        pairs.iter().map(|(g, d)| (EkGeneration(*g), days(*d))).collect()
    }

    #[test]
    fn retained_at_day_seven_expired_at_day_eight() {
        let lifetimes = lifetimes(7, 1);
        let ctimes = ctimes(&[(0, 0), (1, 5)]);

        assert!(
            expired_generations(&ctimes, days(7), &lifetimes, ExpiryPolicy::SingleOffset)
                .is_empty()
        );
        assert_eq!(
            expired_generations(&ctimes, days(8), &lifetimes, ExpiryPolicy::SingleOffset),
            vec![EkGeneration(0)]
        );
    }

    #[test]
    fn short_gap_shortens_retention() {
        let lifetimes = lifetimes(7, 30);
        // successor one day later: retained for 7 + 1 days
        let ctimes = ctimes(&[(1, 0), (2, 1)]);

        assert!(
            expired_generations(&ctimes, UnixTime(8 * DAY - 1), &lifetimes, ExpiryPolicy::SingleOffset)
                .is_empty()
        );
        assert_eq!(
            expired_generations(&ctimes, days(8), &lifetimes, ExpiryPolicy::SingleOffset),
            vec![EkGeneration(1)]
        );
    }

    #[test]
    fn latest_generation_gets_full_staleness_offset() {
        let lifetimes = lifetimes(7, 30);
        let ctimes = ctimes(&[(1, 0)]);

        assert!(
            expired_generations(&ctimes, days(36), &lifetimes, ExpiryPolicy::SingleOffset)
                .is_empty()
        );
        assert_eq!(
            expired_generations(&ctimes, days(37), &lifetimes, ExpiryPolicy::SingleOffset),
            vec![EkGeneration(1)]
        );
    }

    #[test]
    fn device_keys_add_the_second_gap() {
        let lifetimes = lifetimes(7, 1);
        let ctimes = ctimes(&[(1, 0), (2, 5), (3, 6)]);

        // gen 1: 7 + min(1, 5) + min(1, 1) = 9 days
        assert!(
            !expired_generations(&ctimes, days(8), &lifetimes, ExpiryPolicy::DoubleOffset)
                .contains(&EkGeneration(1))
        );
        assert!(
            expired_generations(&ctimes, days(9), &lifetimes, ExpiryPolicy::DoubleOffset)
                .contains(&EkGeneration(1))
        );
    }

    #[test]
    fn empty_input_expires_nothing() {
        let lifetimes = KeyLifetimes::default();
        assert!(
            expired_generations(&BTreeMap::new(), days(100), &lifetimes, ExpiryPolicy::DoubleOffset)
                .is_empty()
        );
    }

    proptest! {
        #[test]
        fn prop_expiry_is_monotonic_in_time(
            gaps in prop::collection::vec(0u64..20, 1..8),
            t1 in 0u64..120,
            dt in 0u64..60,
        ) {
            let lifetimes = lifetimes(7, 10);
            let mut day = 0;
            let mut map = BTreeMap::new();
            for (i, gap) in gaps.iter().enumerate() {
                day += gap;
                map.insert(EkGeneration(i as u64 + 1), days(day));
            }

            let early = expired_generations(&map, days(t1), &lifetimes, ExpiryPolicy::SingleOffset);
            let late = expired_generations(&map, days(t1 + dt), &lifetimes, ExpiryPolicy::SingleOffset);

            for generation in &early {
                prop_assert!(late.contains(generation));
            }
        }

        #[test]
        fn prop_double_offset_never_expires_earlier(
            gaps in prop::collection::vec(0u64..20, 1..8),
            now in 0u64..120,
        ) {
            let lifetimes = lifetimes(7, 10);
            let mut day = 0;
            let mut map = BTreeMap::new();
            for (i, gap) in gaps.iter().enumerate() {
                day += gap;
                map.insert(EkGeneration(i as u64 + 1), days(day));
            }

            let single = expired_generations(&map, days(now), &lifetimes, ExpiryPolicy::SingleOffset);
            let double = expired_generations(&map, days(now), &lifetimes, ExpiryPolicy::DoubleOffset);

            for generation in &double {
                prop_assert!(single.contains(generation));
            }
        }
    }
}
