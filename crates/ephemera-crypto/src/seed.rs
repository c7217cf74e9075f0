//! Ephemeral key seeds.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of every ephemeral key seed in bytes.
pub const SEED_SIZE: usize = 32;

/// Private key material for one generation of an ephemeral key.
///
/// The seed is zeroized on drop and never printed. Callers supply the random
/// bytes so tests can use a seeded RNG.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct Seed([u8; SEED_SIZE]);

impl Seed {
    /// Wrap 32 bytes of key material.
    ///
    /// In production the bytes MUST come from a cryptographically secure RNG.
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(bytes)
    }

    /// Rebuild a seed from an opened box payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SEED_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength { expected: SEED_SIZE, actual: bytes.len() })?;
        Ok(Self(array))
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}
