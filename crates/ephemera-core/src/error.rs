//! Error types for the key lifecycle engine.
//!
//! Two families matter to callers:
//!
//! - [`EphemeralKeyError`]: a key exists but is not reachable from this device
//!   right now (a lower level is missing, a box does not open). These are
//!   self-healing: rotating the named level fixes future content.
//! - everything else in [`EkError`]: publishing, storage and authority
//!   failures, classified by [`EkError::is_retryable`].

use std::fmt;

use ephemera_crypto::CryptoError;
use thiserror::Error;

use crate::{
    kv::KvError,
    types::{EkGeneration, EkKind},
};

/// Why a key could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// No local record and no box on the server
    Missing,
    /// The box would not open with the lower-level key
    DecryptFailed,
    /// Derived public key does not match the signed one
    KidMismatch,
    /// Box, statement or lower key disagree on the generation
    GenerationMismatch,
    /// The statement carried with the box did not verify
    BadStatement,
    /// The local record could not be decoded
    Corrupted,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Missing => "missing",
            Self::DecryptFailed => "box did not open",
            Self::KidMismatch => "kid mismatch",
            Self::GenerationMismatch => "generation mismatch",
            Self::BadStatement => "statement did not verify",
            Self::Corrupted => "corrupted",
        };
        f.write_str(text)
    }
}

/// A key of `kind`/`generation` is not reachable because `missing_level` is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} generation {generation} unavailable: {missing_level} {reason}")]
pub struct EphemeralKeyError {
    /// Kind of the key that was requested
    pub kind: EkKind,
    /// Generation that was requested
    pub generation: EkGeneration,
    /// Deepest level that could not be resolved
    pub missing_level: EkKind,
    /// What went wrong at that level
    pub reason: UnavailableReason,
    /// The content being decrypted is older than the content lifetime
    pub content_expired: bool,
}

impl EphemeralKeyError {
    /// Error for a key whose own level is broken.
    pub fn at_level(kind: EkKind, generation: EkGeneration, reason: UnavailableReason) -> Self {
        Self { kind, generation, missing_level: kind, reason, content_expired: false }
    }

    /// Error for a key whose lower level (`missing_level`) is broken.
    pub fn below(
        kind: EkKind,
        generation: EkGeneration,
        missing_level: EkKind,
        reason: UnavailableReason,
    ) -> Self {
        Self { kind, generation, missing_level, reason, content_expired: false }
    }

    /// Text suitable for display in place of the message.
    pub fn human_message(&self) -> &'static str {
        if self.content_expired {
            "This exploding message has expired"
        } else {
            "This exploding message is not available to you"
        }
    }
}

/// Errors returned by the key lifecycle engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EkError {
    /// The principal never published a key of this kind
    #[error("no {kind} published for {principal}")]
    NotFound {
        /// Kind that was looked up
        kind: EkKind,
        /// Principal that was looked up
        principal: String,
    },

    /// The key exists but cannot be unboxed right now
    #[error(transparent)]
    Unbox(#[from] EphemeralKeyError),

    /// A stored record failed its self-consistency checks
    #[error("corrupted {kind} record at generation {generation}: {reason}")]
    Corrupted {
        /// Kind of the record
        kind: EkKind,
        /// Generation the record is stored under
        generation: EkGeneration,
        /// What did not check out
        reason: String,
    },

    /// The latest statement was signed by an authority that is no longer
    /// current
    #[error("{kind} statement at generation {generation} is signed by a stale authority")]
    WrongKid {
        /// Kind of the statement
        kind: EkKind,
        /// Generation the statement claims
        generation: EkGeneration,
    },

    /// Another writer published first
    #[error("{kind} generation {attempted} rejected, server is at {server_max:?}")]
    GenerationConflict {
        /// Kind being published
        kind: EkKind,
        /// Generation that was attempted
        attempted: EkGeneration,
        /// Generation the server already has
        server_max: Option<EkGeneration>,
    },

    /// The directory rejected or failed a request
    #[error("directory error: {0}")]
    Directory(String),

    /// Network or service hiccup; retrying may help
    #[error("transient failure: {0}")]
    Transient(String),

    /// No user is logged in
    #[error("not logged in")]
    NotLoggedIn,

    /// One-shot sessions never generate ephemeral keys
    #[error("one-shot session cannot manage ephemeral keys")]
    Oneshot,

    /// The engine is shutting down
    #[error("operation cancelled")]
    Cancelled,

    /// The KV substrate failed
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    /// A cryptographic primitive failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A record or statement could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A statement is malformed or does not verify
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
}

impl EkError {
    /// Returns true if retrying a publish may succeed.
    ///
    /// Login state, cancellation and malformed data are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GenerationConflict { .. } | Self::Transient(_))
    }

    /// Returns true if rotating a key level fixes this error.
    ///
    /// Needed-checks treat these as "a new key is needed" instead of failing.
    pub fn is_self_healing(&self) -> bool {
        matches!(self, Self::Unbox(_) | Self::Corrupted { .. } | Self::NotFound { .. })
    }

    /// The wrapped [`EphemeralKeyError`], if any.
    pub fn as_unbox(&self) -> Option<&EphemeralKeyError> {
        match self {
            Self::Unbox(err) => Some(err),
            _ => None,
        }
    }

    /// Mark an unbox failure as belonging to expired content.
    #[must_use]
    pub fn with_content_expired(self, content_expired: bool) -> Self {
        match self {
            Self::Unbox(mut err) => {
                err.content_expired = content_expired;
                Self::Unbox(err)
            },
            other => other,
        }
    }

    pub(crate) fn serialization(err: impl fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unbox_error() -> EphemeralKeyError {
        EphemeralKeyError::below(
            EkKind::Team,
            EkGeneration(3),
            EkKind::User,
            UnavailableReason::Missing,
        )
    }

    #[test]
    fn classification() {
        let conflict = EkError::GenerationConflict {
            kind: EkKind::User,
            attempted: EkGeneration(2),
            server_max: Some(EkGeneration(2)),
        };
        assert!(conflict.is_retryable());
        assert!(EkError::Transient("timeout".into()).is_retryable());
        assert!(!EkError::NotLoggedIn.is_retryable());
        assert!(!EkError::Cancelled.is_retryable());

        assert!(EkError::Unbox(unbox_error()).is_self_healing());
        assert!(!EkError::Oneshot.is_self_healing());
    }

    #[test]
    fn display_keeps_the_chain() {
        let text = EkError::Unbox(unbox_error()).to_string();
        assert_eq!(text, "teamEK generation 3 unavailable: userEK missing");
    }

    #[test]
    fn human_message_reflects_content_expiry() {
        let err = EkError::Unbox(unbox_error());
        assert_eq!(
            err.as_unbox().map(EphemeralKeyError::human_message),
            Some("This exploding message is not available to you")
        );

        let expired = err.with_content_expired(true);
        assert_eq!(
            expired.as_unbox().map(EphemeralKeyError::human_message),
            Some("This exploding message has expired")
        );
    }
}
