//! Simulated environment.
//!
//! Monotonic time is tokio's clock, so tests running with
//! `#[tokio::test(start_paused = true)]` get virtual time that auto-advances
//! while every task is idle. The wall clock starts at a fixed epoch and can be
//! jumped forward with [`SimEnv::advance`] to age keys by days without
//! waiting.

use std::{sync::Arc, time::Duration};

use ephemera_core::{Environment, UnixTime};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock at simulation start (2023-11-14).
pub const SIM_EPOCH: UnixTime = UnixTime(1_700_000_000);

struct Inner {
    rng: Mutex<ChaCha20Rng>,
    start: tokio::time::Instant,
    skew: Mutex<Duration>,
}

/// Deterministic environment shared by every simulated device.
///
/// Clones share the RNG and the clock.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Inner>,
}

impl SimEnv {
    /// Environment whose randomness is fully determined by `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
                start: tokio::time::Instant::now(),
                skew: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Jump both clocks forward by `duration` without sleeping.
    pub fn advance(&self, duration: Duration) {
        *self.inner.skew.lock() += duration;
    }

    /// Total time jumped with [`advance`](Self::advance).
    pub fn skew(&self) -> Duration {
        *self.inner.skew.lock()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now() + self.skew()
    }

    fn wall_clock(&self) -> UnixTime {
        SIM_EPOCH + self.inner.start.elapsed() + self.skew()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.rng.lock().fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn advance_moves_both_clocks() {
        let env = SimEnv::with_seed(1);
        let (t0, w0) = (env.now(), env.wall_clock());

        env.advance(Duration::from_secs(3600));

        assert_eq!(env.now() - t0, Duration::from_secs(3600));
        assert_eq!(env.wall_clock(), w0 + Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_uses_virtual_time() {
        let env = SimEnv::with_seed(1);
        let w0 = env.wall_clock();

        env.sleep(Duration::from_secs(120)).await;

        assert_eq!(env.wall_clock(), w0 + Duration::from_secs(120));
    }

    #[tokio::test]
    async fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_ne!(a.random_array::<32>(), SimEnv::with_seed(43).random_array::<32>());
    }
}
