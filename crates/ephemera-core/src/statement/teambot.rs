//! Teambot key statements.
//!
//! A teambot key is never random: its seed is derived from the team key of
//! the same generation, so every member can recompute it. The statement and
//! box exist for the bot, which is not a full member and cannot open team
//! keys.

use ephemera_crypto::{DeriveReason, derive_dh_keypair, derive_teambot_seed};
use tracing::{info, instrument};

use super::{Authority, VerifiedStatement, fetch_statement, seal_seed, user};
use crate::{
    context::EkContext,
    env::Environment,
    error::EkError,
    external::StatementPost,
    metadata::{EkBoxed, SignedStatement, TeamEk, TeambotEk, TeambotEkMetadata},
    types::{EkGeneration, EkKind, MerkleRoot, Principal, Recipient, TeambotId, Uid},
};

/// Latest teambot statement of `id`, checked against the team's PTK.
pub(crate) async fn fetch_teambot_ek_statement<E: Environment>(
    ctx: &EkContext<E>,
    id: &TeambotId,
) -> Result<VerifiedStatement<TeambotEkMetadata>, EkError> {
    fetch_statement(ctx, &Principal::Teambot(id.clone()), Authority::Team(&id.team)).await
}

/// The teambot key for `bot` at the generation of `team_ek`.
pub fn derive_teambot_ek(team_ek: &TeamEk, bot: &Uid) -> TeambotEk {
    derive_with_user_generation(team_ek, bot, None)
}

fn derive_with_user_generation(
    team_ek: &TeamEk,
    bot: &Uid,
    user_ek_generation: Option<EkGeneration>,
) -> TeambotEk {
    let seed = derive_teambot_seed(&team_ek.seed, bot.as_str().as_bytes());
    let kid = derive_dh_keypair(&seed, DeriveReason::TeambotEkEncryption).kid();
    TeambotEk {
        seed,
        metadata: TeambotEkMetadata {
            kid,
            generation: team_ek.generation(),
            uid: bot.clone(),
            user_ek_generation,
            hash_meta: team_ek.metadata.hash_meta,
            ctime: team_ek.metadata.ctime,
        },
    }
}

/// Publish the teambot key derived from `team_ek`, boxed to the bot's
/// current user key.
#[instrument(skip_all, fields(teambot = %id, generation = %team_ek.generation()))]
pub(crate) async fn publish_teambot_ek<E: Environment>(
    ctx: &EkContext<E>,
    id: &TeambotId,
    team_ek: &TeamEk,
    merkle_root: &MerkleRoot,
) -> Result<TeambotEkMetadata, EkError> {
    let ptk = ctx.teams.team_signing_key(&id.team).await?;

    let bot_user_ek = match user::fetch_user_ek_statement(ctx, &id.bot).await? {
        VerifiedStatement::Current(metadata)
            if !ctx.config.lifetimes.is_stale(metadata.ctime, merkle_root.ctime) =>
        {
            metadata
        },
        _ => {
            return Err(EkError::NotFound {
                kind: EkKind::User,
                principal: Principal::User(id.bot.clone()).to_string(),
            });
        },
    };

    let teambot_ek = derive_with_user_generation(team_ek, &id.bot, Some(bot_user_ek.generation));
    let metadata = teambot_ek.metadata.clone();
    let statement = SignedStatement::sign(&metadata, &ptk)?;

    let boxed = EkBoxed {
        generation: metadata.generation,
        ctime: metadata.ctime,
        recipient: Recipient::User(id.bot.clone()),
        recipient_generation: bot_user_ek.generation,
        statement: statement.clone(),
        sealed: seal_seed(&ctx.env, &teambot_ek.seed, &bot_user_ek.kid)?,
    };

    ctx.directory
        .post_statement(StatementPost {
            principal: Principal::Teambot(id.clone()),
            generation: metadata.generation,
            statement,
            boxes: vec![boxed],
        })
        .await?;
    ctx.notifier.new_teambot_ek(&id.team, &id.bot, metadata.generation);

    info!(bot_user_ek_generation = %bot_user_ek.generation, "published new teambotEK");
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use ephemera_crypto::Seed;

    use super::*;
    use crate::{
        metadata::TeamEkMetadata,
        types::{HashMeta, UnixTime},
    };

    fn team_ek(generation: u64) -> TeamEk {
        let seed = Seed::from_bytes([generation as u8; 32]);
        TeamEk {
            metadata: TeamEkMetadata {
                kid: derive_dh_keypair(&seed, DeriveReason::TeamEkEncryption).kid(),
                generation: EkGeneration(generation),
                hash_meta: HashMeta([1; 32]),
                ctime: UnixTime(77),
            },
            seed,
        }
    }

    #[test]
    fn derived_key_follows_team_generation() {
        let derived = derive_teambot_ek(&team_ek(4), &Uid::new("bot"));

        assert_eq!(derived.generation(), EkGeneration(4));
        assert_eq!(derived.metadata.ctime, UnixTime(77));
        assert_eq!(derived.metadata.user_ek_generation, None);
        assert_eq!(derived.dh_keypair().kid(), derived.kid());
    }

    #[test]
    fn bots_get_distinct_keys() {
        let team = team_ek(4);
        assert_ne!(
            derive_teambot_ek(&team, &Uid::new("bot-a")).kid(),
            derive_teambot_ek(&team, &Uid::new("bot-b")).kid()
        );
    }

    #[test]
    fn derivation_is_reproducible_by_any_member() {
        let team = team_ek(9);
        assert_eq!(
            derive_teambot_ek(&team, &Uid::new("bot")),
            derive_teambot_ek(&team_ek(9), &Uid::new("bot"))
        );
    }
}
