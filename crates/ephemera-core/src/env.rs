//! Environment abstraction for deterministic testing.
//!
//! Decouples key lifecycle logic from system resources (clocks, randomness,
//! sleeping). Production uses [`SystemEnv`](crate::SystemEnv); the harness
//! crate drives the same code with a manual clock and a seeded RNG.

use std::time::Duration;

use ephemera_crypto::{SEED_SIZE, Seed};

use crate::types::UnixTime;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`; simulation uses virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time.
    ///
    /// Only used for local bookkeeping (device key creation time). Lifetime
    /// decisions use Merkle root time instead.
    fn wall_clock(&self) -> UnixTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random fixed-size array.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Fresh 32-byte ephemeral key seed.
    fn new_seed(&self) -> Seed {
        Seed::from_bytes(self.random_array::<SEED_SIZE>())
    }
}
