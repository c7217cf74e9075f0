//! User key statements.

use std::collections::HashMap;

use ephemera_crypto::{DeriveReason, derive_dh_keypair};
use tracing::{debug, info, instrument, warn};

use super::{Authority, VerifiedStatement, device::active_device_ek_statements, fetch_statement, seal_seed, verify_statement};
use crate::{
    config::KeyLifetimes,
    context::EkContext,
    env::Environment,
    error::EkError,
    external::StatementPost,
    metadata::{EkBoxed, SignedStatement, UserEkMetadata},
    types::{MerkleRoot, Principal, Recipient, Uid},
};

/// Latest user key statement of `uid`, checked against their current PUK.
pub(crate) async fn fetch_user_ek_statement<E: Environment>(
    ctx: &EkContext<E>,
    uid: &Uid,
) -> Result<VerifiedStatement<UserEkMetadata>, EkError> {
    fetch_statement(ctx, &Principal::User(uid.clone()), Authority::User(uid)).await
}

/// Latest user key statements of several users in one directory round trip.
///
/// Users without a statement map to [`VerifiedStatement::Missing`]. A
/// statement that fails to verify is logged and treated as missing.
pub(crate) async fn fetch_user_ek_statements<E: Environment>(
    ctx: &EkContext<E>,
    uids: &[Uid],
) -> Result<HashMap<Uid, VerifiedStatement<UserEkMetadata>>, EkError> {
    let principals: Vec<Principal> = uids.iter().map(|uid| Principal::User(uid.clone())).collect();
    let statements = ctx.directory.get_statements(&principals).await?;

    let mut verified = HashMap::with_capacity(uids.len());
    for uid in uids {
        let result = match statements.get(&Principal::User(uid.clone())) {
            Some(statement) => {
                match verify_statement(ctx, statement, Authority::User(uid)).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(%uid, error = %err, "ignoring unverifiable userEK statement");
                        VerifiedStatement::Missing
                    },
                }
            },
            None => VerifiedStatement::Missing,
        };
        verified.insert(uid.clone(), result);
    }
    Ok(verified)
}

/// Current, non-stale user key metadata per user.
///
/// Staleness is advisory: stale and wrong-authority statements are dropped
/// and logged, never turned into errors.
pub fn active_user_ek_metadata(
    statements: &HashMap<Uid, VerifiedStatement<UserEkMetadata>>,
    merkle_root: &MerkleRoot,
    lifetimes: &KeyLifetimes,
) -> HashMap<Uid, UserEkMetadata> {
    statements
        .iter()
        .filter_map(|(uid, statement)| match statement {
            VerifiedStatement::Current(metadata) => {
                if lifetimes.is_stale(metadata.ctime, merkle_root.ctime) {
                    debug!(%uid, generation = %metadata.generation, "skipping stale userEK");
                    None
                } else {
                    Some((uid.clone(), metadata.clone()))
                }
            },
            VerifiedStatement::WrongKid { generation } => {
                debug!(%uid, %generation, "skipping userEK signed by stale PUK");
                None
            },
            VerifiedStatement::Missing => None,
        })
        .collect()
}

/// Generate and publish a user key boxed to every active device of the local
/// user, then store this device's box.
#[instrument(skip_all)]
pub(crate) async fn publish_new_user_ek<E: Environment>(
    ctx: &EkContext<E>,
    merkle_root: &MerkleRoot,
) -> Result<UserEkMetadata, EkError> {
    let device = ctx.identity.active_device()?;
    let puk = ctx.identity.current_puk().await?;

    let previous = fetch_user_ek_statement(ctx, &device.uid).await?;
    let generation = previous.next_generation()?;

    let seed = ctx.env.new_seed();
    let metadata = UserEkMetadata {
        kid: derive_dh_keypair(&seed, DeriveReason::UserEkEncryption).kid(),
        generation,
        hash_meta: merkle_root.hash_meta,
        ctime: merkle_root.ctime,
    };
    let statement = SignedStatement::sign(&metadata, &puk)?;

    let devices = active_device_ek_statements(ctx, &device.uid, merkle_root).await?;
    let mut boxes = Vec::with_capacity(devices.len());
    for (device_id, device_ek) in &devices {
        boxes.push(EkBoxed {
            generation,
            ctime: metadata.ctime,
            recipient: Recipient::Device(device_id.clone()),
            recipient_generation: device_ek.generation,
            statement: statement.clone(),
            sealed: seal_seed(&ctx.env, &seed, &device_ek.kid)?,
        });
    }

    let own_recipient = Recipient::Device(device.device_id.clone());
    let own_box = boxes.iter().find(|b| b.recipient == own_recipient).cloned();
    if own_box.is_none() {
        warn!(device = %device.device_id, "no active deviceEK for this device, userEK will not be readable here");
    }

    let recipients = boxes.len();
    ctx.directory
        .post_statement(StatementPost {
            principal: Principal::User(device.uid.clone()),
            generation,
            statement,
            boxes,
        })
        .await?;

    if let Some(own_box) = own_box {
        ctx.user_ek_storage.put(&device.uid, own_box)?;
    }

    info!(uid = %device.uid, %generation, recipients, "published new userEK");
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ephemera_crypto::Kid;

    use super::*;
    use crate::types::{EkGeneration, HashMeta, UnixTime};

    fn metadata(generation: u64, ctime: u64) -> UserEkMetadata {
        UserEkMetadata {
            kid: Kid::from_bytes([generation as u8; 32]),
            generation: EkGeneration(generation),
            hash_meta: HashMeta::default(),
            ctime: UnixTime(ctime),
        }
    }

    #[test]
    fn active_metadata_filters_stale_and_untrusted() {
        let lifetimes = KeyLifetimes {
            max_key_staleness: Duration::from_secs(100),
            ..KeyLifetimes::default()
        };
        let root = MerkleRoot { ctime: UnixTime(1_000), hash_meta: HashMeta::default() };

        let statements = HashMap::from([
            (Uid::new("fresh"), VerifiedStatement::Current(metadata(3, 950))),
            (Uid::new("limit"), VerifiedStatement::Current(metadata(5, 900))),
            (Uid::new("stale"), VerifiedStatement::Current(metadata(2, 899))),
            (Uid::new("rotated"), VerifiedStatement::WrongKid { generation: EkGeneration(4) }),
            (Uid::new("new"), VerifiedStatement::Missing),
        ]);

        let active = active_user_ek_metadata(&statements, &root, &lifetimes);

        assert_eq!(active.len(), 2);
        assert_eq!(active.get(&Uid::new("fresh")), Some(&metadata(3, 950)));
        assert_eq!(active.get(&Uid::new("limit")), Some(&metadata(5, 900)));
    }

    #[test]
    fn next_generation_trusts_wrong_kid_numbers() {
        let rotated: VerifiedStatement<UserEkMetadata> =
            VerifiedStatement::WrongKid { generation: EkGeneration(6) };
        let missing: VerifiedStatement<UserEkMetadata> = VerifiedStatement::Missing;

        assert_eq!(rotated.next_generation(), Ok(EkGeneration(7)));
        assert_eq!(missing.next_generation(), Ok(EkGeneration(1)));
        assert_eq!(VerifiedStatement::Current(metadata(2, 0)).next_generation(), Ok(EkGeneration(3)));
    }

    #[test]
    fn exhausted_server_generation_is_rejected() {
        let rotated: VerifiedStatement<UserEkMetadata> =
            VerifiedStatement::WrongKid { generation: EkGeneration(u64::MAX) };

        assert!(matches!(rotated.next_generation(), Err(EkError::InvalidStatement(_))));
    }
}
