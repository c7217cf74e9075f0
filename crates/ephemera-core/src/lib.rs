//! Ephemeral Key Lifecycle Engine
//!
//! Creates, publishes, stores, rotates, unboxes and expires the keys behind
//! exploding messages. Keys form a four-level hierarchy, each level boxed to
//! the one below:
//!
//! ```text
//! DeviceEK  (per device, seed stays local)
//!    │  boxed to every active device
//!    ▼
//! UserEK    (per user, signed by the PUK)
//!    │  boxed to every member's UserEK
//!    ▼
//! TeamEK    (per team, signed by the PTK)
//!    │  HMAC-derived per bot, boxed to the bot's UserEK
//!    ▼
//! TeambotEK (per team and restricted bot)
//! ```
//!
//! Every level rotates through a monotonic generation per principal. A new
//! generation is signed by the level's authority, published to the directory
//! (which only accepts the server maximum plus one) and boxed to the
//! recipients of the level below.
//!
//! # Components
//!
//! - [`GenerationStore`]: per-kind, per-principal persistent map of
//!   generations with cached per-generation errors
//! - [`EphemeralKeyer`]: box, fetch and unbox for the boxed kinds
//! - [`expired_generations`]: gap-tolerant expiry
//! - [`EkLib`]: needed-checks, publish with retry, caches, background task
//!
//! # Storage
//!
//! Everything persists through the synchronous [`KvStore`] trait:
//! [`MemoryKv`] for tests, [`RedbKv`] on disk, [`SealedKv`] for encryption
//! at rest and [`ChaoticKv`] for fault injection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod background;
pub mod config;
pub mod context;
mod ek_lib;
pub mod env;
pub mod error;
pub mod expiry;
pub mod external;
pub mod generation_cache;
pub mod keyer;
pub mod kv;
pub mod metadata;
mod retry;
pub mod statement;
pub mod store;
mod system_env;
pub mod types;

pub use background::AppState;
pub use config::{EkConfig, KeyLifetimes};
pub use context::{Collaborators, EkContext};
pub use ek_lib::{EkLib, KeygenOutcome, TeamEkNeed};
pub use env::Environment;
pub use error::{EkError, EphemeralKeyError, UnavailableReason};
pub use expiry::{ExpiryPolicy, expired_generations};
pub use external::{
    ActiveDevice, DeviceInfo, DirectoryError, DirectoryService, EkNotifier, IdentityProvider,
    LoginState, MerkleOracle, StatementPost, TeamDirectory,
};
pub use keyer::{EphemeralKeyer, TeamKeyer, TeambotKeyer, UserKeyer};
pub use kv::{ChaoticKv, KvError, KvStore, MemoryKv, RedbKv, SealedKv};
pub use metadata::{
    DeviceEk, DeviceEkMetadata, EkBoxed, EkMetadata, EphemeralKey, SignedStatement, TeamEk,
    TeamEkMetadata, TeambotEk, TeambotEkMetadata, UserEk, UserEkMetadata,
};
pub use statement::{VerifiedStatement, active_user_ek_metadata, derive_teambot_ek};
pub use store::{BoxStorage, DeviceEkStorage, GenerationRecord, GenerationStore};
pub use system_env::SystemEnv;
pub use types::{
    DeviceId, EkGeneration, EkKind, HashMeta, MerkleRoot, Principal, Recipient, TeamId, TeambotId,
    UnixTime, Uid,
};
