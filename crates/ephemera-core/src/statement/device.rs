//! Device key statements.

use std::collections::HashMap;

use ephemera_crypto::{DeriveReason, Seed, SigningKeyPair, derive_dh_keypair};
use tracing::{debug, info, instrument, warn};

use super::{Authority, VerifiedStatement, verify_statement};
use crate::{
    context::EkContext,
    env::Environment,
    error::EkError,
    external::StatementPost,
    metadata::{DeviceEk, DeviceEkMetadata, SignedStatement},
    types::{DeviceId, EkGeneration, MerkleRoot, Principal, UnixTime, Uid},
};

/// Metadata and signed statement for a device key built from `seed`.
pub fn sign_device_ek_statement(
    generation: EkGeneration,
    seed: &Seed,
    signing_key: &SigningKeyPair,
    merkle_root: &MerkleRoot,
    device_ctime: UnixTime,
) -> Result<(DeviceEkMetadata, SignedStatement), EkError> {
    let metadata = DeviceEkMetadata {
        kid: derive_dh_keypair(seed, DeriveReason::DeviceEkEncryption).kid(),
        generation,
        hash_meta: merkle_root.hash_meta,
        ctime: merkle_root.ctime,
        device_ctime,
    };
    let statement = SignedStatement::sign(&metadata, signing_key)?;
    Ok((metadata, statement))
}

/// Generation claimed by the latest published statement of `device`.
async fn server_max_generation<E: Environment>(
    ctx: &EkContext<E>,
    device: &DeviceId,
) -> Result<Option<EkGeneration>, EkError> {
    match ctx.directory.get_statement(&Principal::Device(device.clone())).await? {
        Some(statement) => statement.claimed_generation().map(Some),
        None => Ok(None),
    }
}

/// Generate, store and publish a device key for the local device.
///
/// The key is stored before it is posted so a successful post can never
/// leave the server pointing at a key this device lost. A failed post erases
/// the local copy again.
#[instrument(skip_all)]
pub(crate) async fn publish_new_device_ek<E: Environment>(
    ctx: &EkContext<E>,
    merkle_root: &MerkleRoot,
) -> Result<DeviceEkMetadata, EkError> {
    let device = ctx.identity.active_device()?;

    let local_max = ctx.device_ek_storage.max_generation(&device.device_id, true)?;
    let server_max = server_max_generation(ctx, &device.device_id).await?;
    let generation = EkGeneration::after(local_max.max(server_max))?;

    let seed = ctx.env.new_seed();
    let (metadata, statement) = sign_device_ek_statement(
        generation,
        &seed,
        &device.signing_key,
        merkle_root,
        ctx.env.wall_clock(),
    )?;

    ctx.device_ek_storage
        .put(&device.device_id, DeviceEk { seed, metadata: metadata.clone() })?;

    let post = StatementPost {
        principal: Principal::Device(device.device_id.clone()),
        generation,
        statement,
        boxes: Vec::new(),
    };
    if let Err(err) = ctx.directory.post_statement(post).await {
        if let Err(erase_err) = ctx.device_ek_storage.delete(&device.device_id, generation) {
            warn!(%generation, error = %erase_err, "failed to erase unpublished deviceEK");
        }
        return Err(err.into());
    }

    info!(device = %device.device_id, %generation, ?local_max, ?server_max, "published new deviceEK");
    Ok(metadata)
}

/// Latest device key of each of `uid`'s devices that verifies and is fresh.
pub(crate) async fn active_device_ek_statements<E: Environment>(
    ctx: &EkContext<E>,
    uid: &Uid,
    merkle_root: &MerkleRoot,
) -> Result<HashMap<DeviceId, DeviceEkMetadata>, EkError> {
    let devices = ctx.identity.user_devices(uid, false).await?;
    let principals: Vec<Principal> =
        devices.iter().map(|d| Principal::Device(d.device_id.clone())).collect();
    let statements = ctx.directory.get_statements(&principals).await?;

    let mut active = HashMap::new();
    for info in &devices {
        let Some(statement) = statements.get(&Principal::Device(info.device_id.clone())) else {
            debug!(device = %info.device_id, "device has no deviceEK");
            continue;
        };

        let authority = Authority::Device { uid, device: &info.device_id };
        match verify_statement::<E, DeviceEkMetadata>(ctx, statement, authority).await {
            Ok(VerifiedStatement::Current(metadata)) => {
                if ctx.config.lifetimes.is_stale(metadata.ctime, merkle_root.ctime) {
                    warn!(device = %info.device_id, generation = %metadata.generation, "skipping stale deviceEK");
                    continue;
                }
                active.insert(info.device_id.clone(), metadata);
            },
            Ok(VerifiedStatement::WrongKid { generation }) => {
                warn!(device = %info.device_id, %generation, "skipping deviceEK signed by stale key");
            },
            Ok(VerifiedStatement::Missing) => {},
            Err(err) => {
                warn!(device = %info.device_id, error = %err, "skipping unverifiable deviceEK");
            },
        }
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HashMeta;

    #[test]
    fn signed_statement_binds_seed_and_root() {
        let seed = Seed::from_bytes([6; 32]);
        let signing_key = SigningKeyPair::from_secret_bytes([1; 32]);
        let root = MerkleRoot { ctime: UnixTime(500), hash_meta: HashMeta([3; 32]) };

        let (metadata, statement) =
            sign_device_ek_statement(EkGeneration(2), &seed, &signing_key, &root, UnixTime(499))
                .unwrap();

        assert_eq!(metadata.ctime, UnixTime(500));
        assert_eq!(metadata.device_ctime, UnixTime(499));
        assert_eq!(metadata.kid, derive_dh_keypair(&seed, DeriveReason::DeviceEkEncryption).kid());
        assert_eq!(statement.verify::<DeviceEkMetadata>().unwrap(), metadata);
        assert_eq!(statement.signer, signing_key.verifying_key());
    }
}
