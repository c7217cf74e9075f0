//! Chaotic KV wrapper for fault injection testing.
//!
//! Randomly fails operations so tests can check that stores stay consistent
//! (no cache entry without a persisted record) under I/O failures.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{KvError, KvStore};

/// KV wrapper that randomly injects `Io` failures.
///
/// Failures are drawn from a seeded LCG, so a given seed reproduces the same
/// failure pattern.
#[derive(Clone)]
pub struct ChaoticKv<S: KvStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<Mutex<usize>>,
}

/// Linear congruential generator; fast and reproducible.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: KvStore> ChaoticKv<S> {
    /// Wrap `inner` with the default seed.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// `failure_rate` is clamped to [0.0, 1.0].
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        *self.operation_count.lock()
    }

    fn roll(&self, op: &str) -> Result<(), KvError> {
        *self.operation_count.lock() += 1;
        if self.rng.lock().next() < self.failure_rate {
            return Err(KvError::Io(format!("chaotic failure injection ({op})")));
        }
        Ok(())
    }
}

impl<S: KvStore> KvStore for ChaoticKv<S> {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.roll("put")?;
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.roll("get")?;
        self.inner.get(key)
    }

    fn erase(&self, key: &str) -> Result<(), KvError> {
        self.roll("erase")?;
        self.inner.erase(key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.roll("list_keys")?;
        self.inner.list_keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn zero_rate_never_fails() {
        let kv = ChaoticKv::new(MemoryKv::new(), 0.0);
        for i in 0..100 {
            kv.put(&format!("k{i}"), b"v").unwrap();
        }
        assert_eq!(kv.inner().len(), 100);
        assert_eq!(kv.operation_count(), 100);
    }

    #[test]
    fn full_rate_always_fails() {
        let kv = ChaoticKv::new(MemoryKv::new(), 1.0);
        assert!(matches!(kv.put("k", b"v"), Err(KvError::Io(_))));
        assert!(kv.inner().is_empty());
    }

    #[test]
    fn same_seed_same_failures() {
        let pattern = |seed| {
            let kv = ChaoticKv::with_seed(MemoryKv::new(), 0.5, seed);
            (0..32).map(|i| kv.put(&format!("k{i}"), b"v").is_ok()).collect::<Vec<_>>()
        };
        assert_eq!(pattern(7), pattern(7));
        assert!(pattern(7).contains(&true) && pattern(7).contains(&false));
    }
}
