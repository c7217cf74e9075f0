//! Anonymous sealed boxes using X25519 and `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{
    derivation::{DhKeyPair, Kid},
    error::CryptoError,
};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Label for deriving the box key from the shared secret
const BOX_KEY_LABEL: &[u8] = b"Ephemera-SealedBox-v1";

/// A payload encrypted to one recipient's [`Kid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// One-shot sender public key
    pub ephemeral_public: Kid,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

/// Seal `plaintext` to `recipient`.
///
/// # Security
///
/// - `ephemeral_secret` and `nonce` MUST be fresh random bytes in production
/// - Both public keys are bound into the key derivation and the AAD
///
/// # Errors
///
/// - `NonContributory` if `recipient` is a low-order point
pub fn seal(
    recipient: &Kid,
    plaintext: &[u8],
    ephemeral_secret: [u8; 32],
    nonce: [u8; NONCE_SIZE],
) -> Result<SealedBox, CryptoError> {
    let sender = DhKeyPair::from_secret_bytes(ephemeral_secret);
    let mut key = box_key(&sender, &sender.kid(), recipient, recipient)?;
    let aad = associated_data(&sender.kid(), recipient);

    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Ok(SealedBox { ephemeral_public: sender.kid(), nonce, ciphertext })
}

/// Open a box sealed to `recipient`.
///
/// # Errors
///
/// - `DecryptionFailed` if the box was sealed to another key or tampered
/// - `NonContributory` if the sender key is a low-order point
pub fn open(recipient: &DhKeyPair, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    let recipient_kid = recipient.kid();
    let mut key =
        box_key(recipient, &sealed.ephemeral_public, &recipient_kid, &sealed.ephemeral_public)?;
    let aad = associated_data(&sealed.ephemeral_public, &recipient_kid);

    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    cipher
        .decrypt(
            XNonce::from_slice(&sealed.nonce),
            Payload { msg: sealed.ciphertext.as_slice(), aad: &aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}

/// Derive the symmetric box key.
///
/// `sender_public` and `recipient_public` are always passed in the same order
/// on both sides; `peer` is the key our half of the exchange uses.
fn box_key(
    ours: &DhKeyPair,
    sender_public: &Kid,
    recipient_public: &Kid,
    peer: &Kid,
) -> Result<[u8; 32], CryptoError> {
    let mut shared = ours.shared_secret(peer)?;
    let hkdf = Hkdf::<Sha256>::new(None, &shared);
    shared.zeroize();

    let mut info = Vec::with_capacity(BOX_KEY_LABEL.len() + 64);
    info.extend_from_slice(BOX_KEY_LABEL);
    info.extend_from_slice(sender_public.as_bytes());
    info.extend_from_slice(recipient_public.as_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    Ok(key)
}

fn associated_data(sender_public: &Kid, recipient_public: &Kid) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(sender_public.as_bytes());
    aad[32..].copy_from_slice(recipient_public.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{DeriveReason, Seed, derive_dh_keypair};

    fn recipient() -> DhKeyPair {
        derive_dh_keypair(&Seed::from_bytes([3; 32]), DeriveReason::UserEkEncryption)
    }

    #[test]
    fn seal_open_roundtrip() {
        let recipient = recipient();
        let sealed = seal(&recipient.kid(), b"seed bytes", [1; 32], [2; NONCE_SIZE]).unwrap();

        assert_eq!(open(&recipient, &sealed).unwrap(), b"seed bytes");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let sealed = seal(&recipient().kid(), b"secret", [1; 32], [2; NONCE_SIZE]).unwrap();
        let other = derive_dh_keypair(&Seed::from_bytes([4; 32]), DeriveReason::UserEkEncryption);

        assert!(matches!(open(&other, &sealed), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let recipient = recipient();
        let mut sealed = seal(&recipient.kid(), b"secret", [1; 32], [2; NONCE_SIZE]).unwrap();
        sealed.ciphertext[0] ^= 0x01;

        assert!(matches!(open(&recipient, &sealed), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn swapped_sender_key_is_rejected() {
        let recipient = recipient();
        let mut sealed = seal(&recipient.kid(), b"secret", [1; 32], [2; NONCE_SIZE]).unwrap();
        let decoy = seal(&recipient.kid(), b"secret", [5; 32], [2; NONCE_SIZE]).unwrap();
        sealed.ephemeral_public = decoy.ephemeral_public;

        assert!(open(&recipient, &sealed).is_err());
    }

    #[test]
    fn sealing_to_low_order_point_fails() {
        let result = seal(&Kid::from_bytes([0; 32]), b"secret", [1; 32], [2; NONCE_SIZE]);
        assert_eq!(result, Err(CryptoError::NonContributory));
    }

    proptest! {
        #[test]
        fn prop_any_payload_roundtrips(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            ephemeral in any::<[u8; 32]>(),
            nonce in any::<[u8; NONCE_SIZE]>(),
        ) {
            let recipient = recipient();
            // x25519 clamps every secret, so any 32 bytes are a usable sender key
            let sealed = seal(&recipient.kid(), &payload, ephemeral, nonce).unwrap();
            prop_assert_eq!(open(&recipient, &sealed).unwrap(), payload);
        }
    }
}
