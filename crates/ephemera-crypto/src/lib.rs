//! Ephemera Cryptographic Primitives
//!
//! Cryptographic building blocks for ephemeral keys. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Hierarchy
//!
//! Every ephemeral key level (device, user, team, teambot) owns a 32-byte
//! [`Seed`]. The seed is never used directly: a Diffie-Hellman keypair is
//! derived from it under a level-specific [`DeriveReason`], and the public half
//! of that keypair is the key's [`Kid`].
//!
//! ```text
//! Seed (32 random bytes, or HMAC(team seed, bot uid) for teambots)
//!        │
//!        ▼
//! HKDF(reason) → X25519 secret → Kid (public key)
//!        │
//!        ▼
//! Sealed box: seed of the level above, encrypted to this Kid
//! ```
//!
//! # Security
//!
//! Domain separation:
//! - Each level derives under its own reason string
//! - A reason is bound to one wire format; a new format gets a new reason
//!
//! Confidentiality:
//! - Seeds leave their owner only inside a [`SealedBox`]
//! - Boxes use an ephemeral X25519 sender key and XChaCha20-Poly1305
//! - Non-contributory shared secrets are rejected
//!
//! Authenticity:
//! - Statements are Ed25519-signed by the level's authority
//! - Seeds and secrets are zeroized on drop

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod derivation;
mod error;
mod sealed_box;
mod seed;
mod signature;

pub use derivation::{DeriveReason, DhKeyPair, Kid, derive_dh_keypair, derive_teambot_seed};
pub use error::CryptoError;
pub use sealed_box::{NONCE_SIZE, SealedBox, open, seal};
pub use seed::{SEED_SIZE, Seed};
pub use signature::{Signature, SigningKeyPair, VerifyingKey, verify};
