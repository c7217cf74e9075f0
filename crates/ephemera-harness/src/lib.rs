//! Deterministic simulation harness for the ephemeral key engine.
//!
//! Provides in-memory implementations of every collaborator [`EkLib`] talks
//! to, wired through a shared [`SimWorld`]:
//!
//! - [`SimEnv`]: seeded RNG, tokio virtual time and a skewable wall clock
//! - [`SimDirectory`]: statement and box directory enforcing the generation
//!   rules, with fault injection and post barriers for races
//! - [`SimMerkle`]: Merkle roots stamped from the simulated wall clock
//! - [`SimIdentity`] / [`SimTeams`]: users, devices, PUKs, teams and PTKs,
//!   with the same stale-cache behavior as real clients
//! - [`RecordingNotifier`]: captures outbound notifications
//!
//! [`EkLib`]: ephemera_core::EkLib

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod notifier;
pub mod sim_env;
pub mod world;

pub use directory::{SimDirectory, SimMerkle};
pub use notifier::{Notification, RecordingNotifier};
pub use sim_env::SimEnv;
pub use world::{SimClient, SimIdentity, SimTeams, SimWorld};

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
