//! Building, signing and verifying statements for each key kind.
//!
//! Generation assignment follows the latest published statement: the next
//! generation is its generation plus one, even when that statement was signed
//! by an authority that has since rotated (its number is still trusted, only
//! its key is not). Device keys also consider local generations, including
//! ones that failed to decode, so a number is never reused on this device.

pub(crate) mod device;
pub(crate) mod team;
pub(crate) mod teambot;
pub(crate) mod user;

use ephemera_crypto::{Kid, SealedBox, Seed, VerifyingKey, seal};
use tracing::debug;

pub use self::{
    device::sign_device_ek_statement, teambot::derive_teambot_ek, user::active_user_ek_metadata,
};
use crate::{
    context::EkContext,
    env::Environment,
    error::EkError,
    metadata::{EkMetadata, SignedStatement},
    types::{DeviceId, EkGeneration, Principal, TeamId, Uid},
};

/// Latest statement of a principal, checked against the current authority.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifiedStatement<M> {
    /// Nothing published yet
    Missing,
    /// Signed by the current authority
    Current(M),
    /// Signed by an authority that is no longer current
    WrongKid {
        /// Generation the statement claims
        generation: EkGeneration,
    },
}

impl<M: EkMetadata> VerifiedStatement<M> {
    /// Generation of the latest statement, trusted or not.
    pub fn latest_generation(&self) -> Option<EkGeneration> {
        match self {
            Self::Missing => None,
            Self::Current(metadata) => Some(metadata.generation()),
            Self::WrongKid { generation } => Some(*generation),
        }
    }

    /// Generation a new publish should use.
    pub fn next_generation(&self) -> Result<EkGeneration, EkError> {
        EkGeneration::after(self.latest_generation())
    }

    /// Metadata, if signed by the current authority.
    pub fn current(&self) -> Option<&M> {
        match self {
            Self::Current(metadata) => Some(metadata),
            Self::Missing | Self::WrongKid { .. } => None,
        }
    }
}

/// Who signs statements of a principal.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Authority<'a> {
    /// A device signing key
    Device {
        /// Owner of the device
        uid: &'a Uid,
        /// The device
        device: &'a DeviceId,
    },
    /// A user's PUK
    User(&'a Uid),
    /// A team's PTK
    Team(&'a TeamId),
}

async fn authority_key<E: Environment>(
    ctx: &EkContext<E>,
    authority: Authority<'_>,
    force_reload: bool,
) -> Result<Option<VerifyingKey>, EkError> {
    match authority {
        Authority::Device { uid, device } => {
            let devices = ctx.identity.user_devices(uid, force_reload).await?;
            Ok(devices.into_iter().find(|d| &d.device_id == device).map(|d| d.verifying_key))
        },
        Authority::User(uid) => ctx.identity.puk_verifying_key(uid, force_reload).await.map(Some),
        Authority::Team(team) => ctx.teams.team_verifying_key(team, force_reload).await.map(Some),
    }
}

/// Check `statement` and decide whether its signer is today's authority.
///
/// A mismatch triggers one forced reload of the authority before the
/// statement is declared [`VerifiedStatement::WrongKid`]. A revoked device
/// has no authority at all and is treated the same way.
pub(crate) async fn verify_statement<E: Environment, M: EkMetadata>(
    ctx: &EkContext<E>,
    statement: &SignedStatement,
    authority: Authority<'_>,
) -> Result<VerifiedStatement<M>, EkError> {
    let metadata: M = statement.verify()?;

    if authority_key(ctx, authority, false).await? == Some(statement.signer) {
        return Ok(VerifiedStatement::Current(metadata));
    }
    if authority_key(ctx, authority, true).await? == Some(statement.signer) {
        return Ok(VerifiedStatement::Current(metadata));
    }

    debug!(kind = %M::KIND, generation = %metadata.generation(), ?authority, "statement signed by stale authority");
    Ok(VerifiedStatement::WrongKid { generation: metadata.generation() })
}

/// Fetch and verify the latest statement of `principal`.
pub(crate) async fn fetch_statement<E: Environment, M: EkMetadata>(
    ctx: &EkContext<E>,
    principal: &Principal,
    authority: Authority<'_>,
) -> Result<VerifiedStatement<M>, EkError> {
    match ctx.directory.get_statement(principal).await? {
        Some(statement) => verify_statement(ctx, &statement, authority).await,
        None => Ok(VerifiedStatement::Missing),
    }
}

/// Seal `seed` to `recipient` with fresh randomness.
pub(crate) fn seal_seed<E: Environment>(
    env: &E,
    seed: &Seed,
    recipient: &Kid,
) -> Result<SealedBox, EkError> {
    Ok(seal(recipient, seed.as_bytes(), env.random_array(), env.random_array())?)
}
