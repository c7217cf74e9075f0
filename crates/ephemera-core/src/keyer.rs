//! Box, fetch and unbox for the boxed key kinds.
//!
//! User, team and teambot keys all reach a device the same way: a seed sealed
//! to a lower-level key, plus the statement of the generation. The keyers
//! differ in who the lower level is and how a new generation is published.
//! [`BoxStorage`](crate::store::BoxStorage) is generic over them.

use std::fmt;

use async_trait::async_trait;
use ephemera_crypto::{DhKeyPair, Seed, derive_dh_keypair, open};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    context::EkContext,
    env::Environment,
    error::{EkError, EphemeralKeyError, UnavailableReason},
    metadata::{
        EkBoxed, EkMetadata, EphemeralKey, TeamEk, TeamEkMetadata, TeambotEkMetadata, UserEkMetadata,
    },
    statement::{Authority, VerifiedStatement, fetch_statement, team, teambot, user, verify_statement},
    types::{EkGeneration, EkKind, MerkleRoot, Principal, Recipient, TeamId, TeambotId, UnixTime, Uid},
};

/// One boxed key kind.
#[async_trait]
pub trait EphemeralKeyer: Send + Sync + 'static {
    /// What a principal of this kind is identified by.
    type Id: Clone + fmt::Display + Send + Sync + 'static;

    /// Statement body of this kind.
    type Metadata: EkMetadata;

    /// What a new generation is made from: `()` for kinds that draw a fresh
    /// seed, the source team key for teambot keys.
    type Source: Send + Sync;

    /// Kind handled.
    fn kind(&self) -> EkKind;

    /// Principal for `id`.
    fn principal(&self, id: &Self::Id) -> Principal;

    /// Whose boxes this device opens.
    fn local_recipient<E: Environment>(&self, ctx: &EkContext<E>) -> Result<Recipient, EkError>;

    /// Create, sign, box and post a new generation for `id`.
    async fn publish_new_ek<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &Self::Id,
        source: &Self::Source,
        merkle_root: &MerkleRoot,
    ) -> Result<Self::Metadata, EkError>;

    /// Box of `generation` addressed to this device, from the directory.
    async fn fetch<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &Self::Id,
        generation: EkGeneration,
    ) -> Result<Option<EkBoxed>, EkError> {
        let recipient = self.local_recipient(ctx)?;
        Ok(ctx.directory.get_box(&self.principal(id), generation, &recipient).await?)
    }

    /// Open `boxed` through the lower level and verify the result.
    async fn unbox<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &Self::Id,
        boxed: &EkBoxed,
        content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<Self::Metadata>, EkError>;
}

/// User keys, boxed to each device key of the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserKeyer;

/// Team keys, boxed to each member's user key.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamKeyer;

/// Teambot keys, boxed to the bot's user key and derivable by members.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeambotKeyer;

#[async_trait]
impl EphemeralKeyer for UserKeyer {
    type Id = Uid;
    type Metadata = UserEkMetadata;
    type Source = ();

    fn kind(&self) -> EkKind {
        EkKind::User
    }

    fn principal(&self, id: &Uid) -> Principal {
        Principal::User(id.clone())
    }

    fn local_recipient<E: Environment>(&self, ctx: &EkContext<E>) -> Result<Recipient, EkError> {
        Ok(Recipient::Device(ctx.identity.active_device()?.device_id))
    }

    async fn publish_new_ek<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &Uid,
        _source: &(),
        merkle_root: &MerkleRoot,
    ) -> Result<UserEkMetadata, EkError> {
        let device = ctx.identity.active_device()?;
        if &device.uid != id {
            return Err(EkError::InvalidStatement(format!("cannot publish a userEK for {id}")));
        }
        user::publish_new_user_ek(ctx, merkle_root).await
    }

    async fn unbox<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &Uid,
        boxed: &EkBoxed,
        _content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<UserEkMetadata>, EkError> {
        let device = ctx.identity.active_device()?;
        let lower = match ctx.device_ek_storage.get(&device.device_id, boxed.recipient_generation) {
            Ok(Some(device_ek)) => device_ek,
            Ok(None) => {
                return Err(below(EkKind::User, boxed.generation, EkKind::Device, UnavailableReason::Missing));
            },
            Err(err) if err.is_self_healing() => {
                return Err(below(EkKind::User, boxed.generation, EkKind::Device, UnavailableReason::Corrupted));
            },
            Err(err) => return Err(err),
        };
        let key = open_box(boxed, &lower.dh_keypair())?;
        check_signer::<E, UserEkMetadata>(ctx, &self.principal(id), Authority::User(id), boxed).await?;
        Ok(key)
    }
}

#[async_trait]
impl EphemeralKeyer for TeamKeyer {
    type Id = TeamId;
    type Metadata = TeamEkMetadata;
    type Source = ();

    fn kind(&self) -> EkKind {
        EkKind::Team
    }

    fn principal(&self, id: &TeamId) -> Principal {
        Principal::Team(id.clone())
    }

    fn local_recipient<E: Environment>(&self, ctx: &EkContext<E>) -> Result<Recipient, EkError> {
        Ok(Recipient::User(ctx.identity.active_device()?.uid))
    }

    async fn publish_new_ek<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &TeamId,
        _source: &(),
        merkle_root: &MerkleRoot,
    ) -> Result<TeamEkMetadata, EkError> {
        team::publish_new_team_ek(ctx, id, merkle_root).await
    }

    async fn unbox<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &TeamId,
        boxed: &EkBoxed,
        content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<TeamEkMetadata>, EkError> {
        let lower = resolve_user_ek(ctx, EkKind::Team, boxed, content_ctime).await?;
        let key = open_box(boxed, &lower.dh_keypair())?;
        check_signer::<E, TeamEkMetadata>(ctx, &self.principal(id), Authority::Team(id), boxed).await?;
        Ok(key)
    }
}

#[async_trait]
impl EphemeralKeyer for TeambotKeyer {
    type Id = TeambotId;
    type Metadata = TeambotEkMetadata;
    type Source = TeamEk;

    fn kind(&self) -> EkKind {
        EkKind::Teambot
    }

    fn principal(&self, id: &TeambotId) -> Principal {
        Principal::Teambot(id.clone())
    }

    fn local_recipient<E: Environment>(&self, ctx: &EkContext<E>) -> Result<Recipient, EkError> {
        Ok(Recipient::User(ctx.identity.active_device()?.uid))
    }

    /// Publish the teambot key derived from `team_ek`, at its generation.
    async fn publish_new_ek<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &TeambotId,
        team_ek: &TeamEk,
        merkle_root: &MerkleRoot,
    ) -> Result<TeambotEkMetadata, EkError> {
        teambot::publish_teambot_ek(ctx, id, team_ek, merkle_root).await
    }

    async fn unbox<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &TeambotId,
        boxed: &EkBoxed,
        content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<TeambotEkMetadata>, EkError> {
        let lower = resolve_user_ek(ctx, EkKind::Teambot, boxed, content_ctime).await?;
        let key: EphemeralKey<TeambotEkMetadata> = open_box(boxed, &lower.dh_keypair())?;
        if key.metadata.user_ek_generation != Some(boxed.recipient_generation) {
            return Err(below(
                EkKind::Teambot,
                boxed.generation,
                EkKind::Teambot,
                UnavailableReason::GenerationMismatch,
            ));
        }
        check_signer::<E, TeambotEkMetadata>(ctx, &self.principal(id), Authority::Team(&id.team), boxed)
            .await?;
        Ok(key)
    }
}

/// The local user's key that `boxed` was sealed to.
async fn resolve_user_ek<E: Environment>(
    ctx: &EkContext<E>,
    kind: EkKind,
    boxed: &EkBoxed,
    content_ctime: Option<UnixTime>,
) -> Result<EphemeralKey<UserEkMetadata>, EkError> {
    let uid = ctx.identity.active_device()?.uid;
    match ctx.user_ek_storage.get(ctx, &uid, boxed.recipient_generation, content_ctime).await {
        Ok(user_ek) => Ok(user_ek),
        Err(EkError::Unbox(inner)) => {
            debug!(%kind, generation = %boxed.generation, error = %inner, "lower level unavailable");
            Err(below(kind, boxed.generation, inner.missing_level, inner.reason))
        },
        Err(err) if err.is_self_healing() => {
            Err(below(kind, boxed.generation, EkKind::User, UnavailableReason::Missing))
        },
        Err(err) => Err(err),
    }
}

/// Reject a box whose statement was not signed by `authority`.
///
/// A box carries its own copy of the statement, so its signature alone proves
/// nothing about who created the key. A statement from a rotated authority is
/// accepted only below the latest generation the current authority signed.
async fn check_signer<E: Environment, M: EkMetadata>(
    ctx: &EkContext<E>,
    principal: &Principal,
    authority: Authority<'_>,
    boxed: &EkBoxed,
) -> Result<(), EkError> {
    match verify_statement::<E, M>(ctx, &boxed.statement, authority).await? {
        VerifiedStatement::Current(_) => return Ok(()),
        VerifiedStatement::Missing | VerifiedStatement::WrongKid { .. } => {},
    }

    let latest = fetch_statement::<E, M>(ctx, principal, authority).await?;
    if latest.current().is_some_and(|metadata| metadata.generation() > boxed.generation) {
        debug!(%principal, generation = %boxed.generation, "box signed by a rotated authority");
        return Ok(());
    }

    warn!(%principal, generation = %boxed.generation, "box statement not signed by the current authority");
    Err(below(M::KIND, boxed.generation, M::KIND, UnavailableReason::BadStatement))
}

fn below(
    kind: EkKind,
    generation: EkGeneration,
    missing_level: EkKind,
    reason: UnavailableReason,
) -> EkError {
    EkError::Unbox(EphemeralKeyError::below(kind, generation, missing_level, reason))
}

/// Open a box with the lower-level key and check it against its statement.
pub(crate) fn open_box<M: EkMetadata>(
    boxed: &EkBoxed,
    recipient_key: &DhKeyPair,
) -> Result<EphemeralKey<M>, EkError> {
    let generation = boxed.generation;
    let unavailable = |reason| below(M::KIND, generation, M::KIND, reason);

    let metadata: M =
        boxed.statement.verify().map_err(|_| unavailable(UnavailableReason::BadStatement))?;
    if metadata.generation() != generation {
        return Err(unavailable(UnavailableReason::GenerationMismatch));
    }

    let plaintext = Zeroizing::new(
        open(recipient_key, &boxed.sealed).map_err(|_| unavailable(UnavailableReason::DecryptFailed))?,
    );
    let seed = Seed::from_slice(&plaintext).map_err(|_| unavailable(UnavailableReason::DecryptFailed))?;

    if derive_dh_keypair(&seed, M::REASON).kid() != metadata.kid() {
        return Err(unavailable(UnavailableReason::KidMismatch));
    }
    Ok(EphemeralKey { seed, metadata })
}
