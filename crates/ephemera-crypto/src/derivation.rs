//! Domain-separated key derivation for ephemeral keys.

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    error::CryptoError,
    seed::{SEED_SIZE, Seed},
};

type HmacSha256 = Hmac<Sha256>;

/// Label appended to the bot uid when deriving a teambot seed.
const TEAMBOT_SEED_LABEL: &[u8] = b"Ephemera-Derived-Teambot-EK-v1";

/// Why a DH keypair is being derived from a seed.
///
/// Every variant maps to a distinct HKDF info string. A reason must never be
/// reused across incompatible wire formats: bump the version suffix instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeriveReason {
    /// Device ephemeral key
    DeviceEkEncryption,
    /// User ephemeral key
    UserEkEncryption,
    /// Team ephemeral key
    TeamEkEncryption,
    /// Teambot ephemeral key
    TeambotEkEncryption,
}

impl DeriveReason {
    /// HKDF info string for this reason.
    pub const fn label(self) -> &'static [u8] {
        match self {
            Self::DeviceEkEncryption => b"Ephemera-Derived-DeviceEK-DH-v1",
            Self::UserEkEncryption => b"Ephemera-Derived-UserEK-DH-v1",
            Self::TeamEkEncryption => b"Ephemera-Derived-TeamEK-DH-v1",
            Self::TeambotEkEncryption => b"Ephemera-Derived-TeambotEK-DH-v1",
        }
    }
}

/// Public identifier of an ephemeral key: its X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kid([u8; 32]);

impl Kid {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kid({self})")
    }
}

/// X25519 keypair derived from a seed.
///
/// The secret half is zeroized on drop by `x25519-dalek`.
pub struct DhKeyPair {
    secret: StaticSecret,
    kid: Kid,
}

impl DhKeyPair {
    /// Public key identifying this keypair.
    pub fn kid(&self) -> Kid {
        self.kid
    }

    /// X25519 shared secret with `their_public`.
    ///
    /// # Errors
    ///
    /// - `NonContributory` if the peer key is a low-order point
    pub(crate) fn shared_secret(&self, their_public: &Kid) -> Result<[u8; 32], CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(*shared.as_bytes())
    }

    /// Build a keypair from raw secret bytes (sealing uses a one-shot sender
    /// key).
    pub(crate) fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let kid = Kid(PublicKey::from(&secret).to_bytes());
        Self { secret, kid }
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair").field("kid", &self.kid).finish_non_exhaustive()
    }
}

/// Derive the DH keypair for `seed` under `reason`.
///
/// # Security
///
/// - Different reasons produce unrelated keypairs from the same seed
/// - Deterministic: same inputs always produce the same keypair
pub fn derive_dh_keypair(seed: &Seed, reason: DeriveReason) -> DhKeyPair {
    let hkdf = Hkdf::<Sha256>::new(None, seed.as_bytes());

    let mut secret = [0u8; 32];
    let Ok(()) = hkdf.expand(reason.label(), &mut secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    DhKeyPair::from_secret_bytes(secret)
}

/// Derive the teambot seed for `bot_uid` from a team key seed.
///
/// `HMAC-SHA256(team_seed, bot_uid || label)`. Any team member holding the
/// team key can recompute this without a separate box.
pub fn derive_teambot_seed(team_seed: &Seed, bot_uid: &[u8]) -> Seed {
    let Ok(mut mac) = HmacSha256::new_from_slice(team_seed.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(bot_uid);
    mac.update(TEAMBOT_SEED_LABEL);
    let result = mac.finalize().into_bytes();

    let mut bytes = [0u8; SEED_SIZE];
    bytes.copy_from_slice(&result);
    Seed::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> Seed {
        let mut bytes = [0u8; SEED_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Seed::from_bytes(bytes)
    }

    #[test]
    fn derive_is_deterministic() {
        let first = derive_dh_keypair(&test_seed(), DeriveReason::UserEkEncryption);
        let second = derive_dh_keypair(&test_seed(), DeriveReason::UserEkEncryption);
        assert_eq!(first.kid(), second.kid());
    }

    #[test]
    fn reasons_separate_domains() {
        let seed = test_seed();
        let reasons = [
            DeriveReason::DeviceEkEncryption,
            DeriveReason::UserEkEncryption,
            DeriveReason::TeamEkEncryption,
            DeriveReason::TeambotEkEncryption,
        ];

        for (i, a) in reasons.iter().enumerate() {
            for b in &reasons[i + 1..] {
                assert_ne!(a.label(), b.label());
                assert_ne!(
                    derive_dh_keypair(&seed, *a).kid(),
                    derive_dh_keypair(&seed, *b).kid(),
                    "{a:?} and {b:?} must not collide"
                );
            }
        }
    }

    #[test]
    fn teambot_seed_depends_on_bot() {
        let team_seed = test_seed();
        let bot_a = derive_teambot_seed(&team_seed, b"bot-a");
        let bot_b = derive_teambot_seed(&team_seed, b"bot-b");
        assert_ne!(bot_a, bot_b);
        assert_eq!(bot_a, derive_teambot_seed(&team_seed, b"bot-a"));
    }

    #[test]
    fn teambot_seed_differs_from_team_seed() {
        let team_seed = test_seed();
        assert_ne!(derive_teambot_seed(&team_seed, b"bot"), team_seed);
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let alice = derive_dh_keypair(&test_seed(), DeriveReason::DeviceEkEncryption);
        let bob = derive_dh_keypair(&Seed::from_bytes([9; 32]), DeriveReason::DeviceEkEncryption);

        assert_eq!(
            alice.shared_secret(&bob.kid()).unwrap(),
            bob.shared_secret(&alice.kid()).unwrap()
        );
    }

    #[test]
    fn low_order_peer_is_rejected() {
        let alice = derive_dh_keypair(&test_seed(), DeriveReason::DeviceEkEncryption);
        let result = alice.shared_secret(&Kid::from_bytes([0u8; 32]));
        assert_eq!(result, Err(CryptoError::NonContributory));
    }

    #[test]
    fn kid_displays_as_hex() {
        let kid = Kid::from_bytes([0xAB; 32]);
        assert_eq!(kid.to_string(), "ab".repeat(32));
    }
}
