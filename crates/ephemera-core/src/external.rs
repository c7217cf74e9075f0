//! Collaborators the engine talks to but does not implement.
//!
//! Everything here crosses a process or network boundary in production, so
//! the traits are async (via `async-trait`, to stay object safe) and shared as
//! `Arc<dyn Trait>`. The harness crate provides in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use ephemera_crypto::{SigningKeyPair, VerifyingKey};
use thiserror::Error;

use crate::{
    error::EkError,
    metadata::{EkBoxed, SignedStatement},
    types::{DeviceId, EkGeneration, MerkleRoot, Principal, Recipient, TeamId, Uid},
};

/// Errors reported by the directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The posted generation is not `server_max + 1`
    #[error("generation {attempted} rejected for {principal}, server max is {server_max:?}")]
    GenerationConflict {
        /// Principal the post was for
        principal: Principal,
        /// Generation that was posted
        attempted: EkGeneration,
        /// Generation the server holds
        server_max: Option<EkGeneration>,
    },

    /// The request did not reach the server or timed out
    #[error("network error: {0}")]
    Network(String),

    /// The server refused the request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<DirectoryError> for EkError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::GenerationConflict { principal, attempted, server_max } => {
                Self::GenerationConflict { kind: principal.kind(), attempted, server_max }
            },
            DirectoryError::Network(reason) => Self::Transient(reason),
            DirectoryError::Rejected(reason) => Self::Directory(reason),
        }
    }
}

/// A new generation and the boxes that distribute it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementPost {
    /// Principal the generation belongs to
    pub principal: Principal,
    /// Generation being published
    pub generation: EkGeneration,
    /// Signed statement of the generation
    pub statement: SignedStatement,
    /// One box per recipient (empty for device keys)
    pub boxes: Vec<EkBoxed>,
}

/// Server-side directory of statements and boxes.
///
/// The principal determines the key kind of every request.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Publish a generation.
    ///
    /// # Errors
    ///
    /// - `GenerationConflict` unless `post.generation` is the server's max + 1
    async fn post_statement(&self, post: StatementPost) -> Result<(), DirectoryError>;

    /// Latest statement of `principal`, if any.
    async fn get_statement(
        &self,
        principal: &Principal,
    ) -> Result<Option<SignedStatement>, DirectoryError>;

    /// Latest statements of several principals. Principals without one are
    /// absent from the map.
    async fn get_statements(
        &self,
        principals: &[Principal],
    ) -> Result<HashMap<Principal, SignedStatement>, DirectoryError>;

    /// Box of `principal`'s `generation` addressed to `recipient`, if any.
    async fn get_box(
        &self,
        principal: &Principal,
        generation: EkGeneration,
        recipient: &Recipient,
    ) -> Result<Option<EkBoxed>, DirectoryError>;
}

/// Source of signed server time.
#[async_trait]
pub trait MerkleOracle: Send + Sync {
    /// Current Merkle root.
    async fn current_root(&self) -> Result<MerkleRoot, EkError>;
}

/// Team membership and per-team key (PTK) directory.
#[async_trait]
pub trait TeamDirectory: Send + Sync {
    /// Current PTK public key of `team`.
    ///
    /// `force_reload` bypasses any local cache.
    async fn team_verifying_key(
        &self,
        team: &TeamId,
        force_reload: bool,
    ) -> Result<VerifyingKey, EkError>;

    /// Current PTK signing pair. Only available to members.
    async fn team_signing_key(&self, team: &TeamId) -> Result<SigningKeyPair, EkError>;

    /// Members that receive team key boxes (restricted bots excluded).
    async fn members(&self, team: &TeamId) -> Result<Vec<Uid>, EkError>;

    /// Whether `uid` is in `team` in any role, bots included.
    async fn is_member(&self, team: &TeamId, uid: &Uid) -> Result<bool, EkError>;
}

/// Session login state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Full session with a provisioned device
    LoggedIn,
    /// No session
    LoggedOut,
    /// One-shot session that must never create keys
    Oneshot,
}

/// The device this engine runs on.
#[derive(Debug, Clone)]
pub struct ActiveDevice {
    /// Owner
    pub uid: Uid,
    /// Device id
    pub device_id: DeviceId,
    /// Device signing key (authority for device key statements)
    pub signing_key: SigningKeyPair,
}

/// A device of some user, as published in their sigchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device id
    pub device_id: DeviceId,
    /// Device signing key
    pub verifying_key: VerifyingKey,
}

/// Identity of the local session and key lookups for other users.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current login state.
    fn login_state(&self) -> LoginState;

    /// The local device.
    fn active_device(&self) -> Result<ActiveDevice, EkError>;

    /// Current PUK signing pair of the local user.
    async fn current_puk(&self) -> Result<SigningKeyPair, EkError>;

    /// Current PUK public key of `uid`.
    ///
    /// `force_reload` bypasses any local cache.
    async fn puk_verifying_key(&self, uid: &Uid, force_reload: bool)
    -> Result<VerifyingKey, EkError>;

    /// Active devices of `uid`.
    ///
    /// `force_reload` bypasses any local cache.
    async fn user_devices(&self, uid: &Uid, force_reload: bool)
    -> Result<Vec<DeviceInfo>, EkError>;
}

/// Outbound notifications for peers.
///
/// Delivery is fire-and-forget; implementations must not block.
pub trait EkNotifier: Send + Sync {
    /// A team key generation was published.
    fn new_team_ek(&self, team: &TeamId, generation: EkGeneration);

    /// A teambot key generation was published.
    fn new_teambot_ek(&self, team: &TeamId, bot: &Uid, generation: EkGeneration);

    /// A bot is missing a teambot key; `generation` is `None` when it has none
    /// at all.
    fn teambot_ek_needed(&self, team: &TeamId, bot: &Uid, generation: Option<EkGeneration>);
}
