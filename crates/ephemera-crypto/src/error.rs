//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from sealing, opening, signing and verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD authentication failed (wrong key or tampered ciphertext)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Why decryption failed
        reason: String,
    },

    /// Signature did not verify under the claimed key
    #[error("invalid signature")]
    InvalidSignature,

    /// Public key bytes are not a valid key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Diffie-Hellman produced a low-order (all zero) shared secret
    #[error("non-contributory key exchange")]
    NonContributory,

    /// Input had the wrong length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Provided length
        actual: usize,
    },
}
