//! Team key statements.

use ephemera_crypto::{DeriveReason, derive_dh_keypair};
use tracing::{info, instrument, warn};

use super::{Authority, VerifiedStatement, fetch_statement, seal_seed, user};
use crate::{
    context::EkContext,
    env::Environment,
    error::EkError,
    external::StatementPost,
    metadata::{EkBoxed, SignedStatement, TeamEkMetadata},
    types::{MerkleRoot, Principal, Recipient, TeamId},
};

/// Latest team key statement of `team`, checked against the current PTK.
pub(crate) async fn fetch_team_ek_statement<E: Environment>(
    ctx: &EkContext<E>,
    team: &TeamId,
) -> Result<VerifiedStatement<TeamEkMetadata>, EkError> {
    fetch_statement(ctx, &Principal::Team(team.clone()), Authority::Team(team)).await
}

/// Generate and publish a team key boxed to every member with an active user
/// key, then store the local user's box.
#[instrument(skip_all, fields(%team))]
pub(crate) async fn publish_new_team_ek<E: Environment>(
    ctx: &EkContext<E>,
    team: &TeamId,
    merkle_root: &MerkleRoot,
) -> Result<TeamEkMetadata, EkError> {
    let me = ctx.identity.active_device()?.uid;
    let ptk = ctx.teams.team_signing_key(team).await?;

    let previous = fetch_team_ek_statement(ctx, team).await?;
    let generation = previous.next_generation()?;

    let seed = ctx.env.new_seed();
    let metadata = TeamEkMetadata {
        kid: derive_dh_keypair(&seed, DeriveReason::TeamEkEncryption).kid(),
        generation,
        hash_meta: merkle_root.hash_meta,
        ctime: merkle_root.ctime,
    };
    let statement = SignedStatement::sign(&metadata, &ptk)?;

    let members = ctx.teams.members(team).await?;
    let statements = user::fetch_user_ek_statements(ctx, &members).await?;
    let active = user::active_user_ek_metadata(&statements, merkle_root, &ctx.config.lifetimes);

    let mut boxes = Vec::with_capacity(active.len());
    for (uid, user_ek) in &active {
        boxes.push(EkBoxed {
            generation,
            ctime: metadata.ctime,
            recipient: Recipient::User(uid.clone()),
            recipient_generation: user_ek.generation,
            statement: statement.clone(),
            sealed: seal_seed(&ctx.env, &seed, &user_ek.kid)?,
        });
    }

    let own_recipient = Recipient::User(me.clone());
    let own_box = boxes.iter().find(|b| b.recipient == own_recipient).cloned();
    if own_box.is_none() {
        warn!(uid = %me, "no active userEK for the local user, teamEK will not be readable here");
    }

    let recipients = boxes.len();
    ctx.directory
        .post_statement(StatementPost {
            principal: Principal::Team(team.clone()),
            generation,
            statement,
            boxes,
        })
        .await?;

    if let Some(own_box) = own_box {
        ctx.team_ek_storage.put(team, own_box)?;
    }
    ctx.notifier.new_team_ek(team, generation);

    info!(%generation, recipients, skipped = members.len() - recipients, "published new teamEK");
    Ok(metadata)
}
