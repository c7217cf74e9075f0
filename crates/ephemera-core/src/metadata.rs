//! Key records, signed statements and boxes.
//!
//! A statement binds `(generation, kid, ctime)` for one principal and is
//! signed by that kind's authority: the device signing key for device keys,
//! the PUK for user keys, the PTK for team and teambot keys. Statements travel
//! CBOR-encoded so the signature covers the exact bytes that were published.

use std::fmt;

use ephemera_crypto::{
    DeriveReason, DhKeyPair, Kid, SealedBox, Seed, Signature, SigningKeyPair, VerifyingKey,
    derive_dh_keypair,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::EkError,
    types::{EkGeneration, EkKind, HashMeta, Recipient, UnixTime, Uid},
};

/// Domain separator for statement signatures.
const STATEMENT_CONTEXT: &[u8] = b"Ephemera-EK-Statement-v1";

/// Fields shared by every kind's metadata.
pub trait EkMetadata:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// Kind this metadata describes.
    const KIND: EkKind;

    /// Derivation reason for the kind's DH keypair.
    const REASON: DeriveReason;

    /// Public key of the generation.
    fn kid(&self) -> Kid;

    /// Generation number.
    fn generation(&self) -> EkGeneration;

    /// Merkle root time at creation.
    fn ctime(&self) -> UnixTime;
}

/// Device key statement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEkMetadata {
    /// Public key
    pub kid: Kid,
    /// Generation
    pub generation: EkGeneration,
    /// Merkle root hash at creation
    pub hash_meta: HashMeta,
    /// Merkle root time at creation
    pub ctime: UnixTime,
    /// Local wall clock at creation
    pub device_ctime: UnixTime,
}

/// User key statement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEkMetadata {
    /// Public key
    pub kid: Kid,
    /// Generation
    pub generation: EkGeneration,
    /// Merkle root hash at creation
    pub hash_meta: HashMeta,
    /// Merkle root time at creation
    pub ctime: UnixTime,
}

/// Team key statement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEkMetadata {
    /// Public key
    pub kid: Kid,
    /// Generation
    pub generation: EkGeneration,
    /// Merkle root hash at creation
    pub hash_meta: HashMeta,
    /// Merkle root time at creation
    pub ctime: UnixTime,
}

/// Teambot key statement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeambotEkMetadata {
    /// Public key
    pub kid: Kid,
    /// Generation, equal to the source team key generation
    pub generation: EkGeneration,
    /// The bot this key belongs to
    pub uid: Uid,
    /// Bot user key generation the seed was boxed to.
    ///
    /// `None` for keys a member derived locally from the team key.
    pub user_ek_generation: Option<EkGeneration>,
    /// Merkle root hash at creation
    pub hash_meta: HashMeta,
    /// Merkle root time at creation
    pub ctime: UnixTime,
}

macro_rules! impl_metadata {
    ($ty:ty, $kind:expr, $reason:expr) => {
        impl EkMetadata for $ty {
            const KIND: EkKind = $kind;
            const REASON: DeriveReason = $reason;

            fn kid(&self) -> Kid {
                self.kid
            }

            fn generation(&self) -> EkGeneration {
                self.generation
            }

            fn ctime(&self) -> UnixTime {
                self.ctime
            }
        }
    };
}

impl_metadata!(DeviceEkMetadata, EkKind::Device, DeriveReason::DeviceEkEncryption);
impl_metadata!(UserEkMetadata, EkKind::User, DeriveReason::UserEkEncryption);
impl_metadata!(TeamEkMetadata, EkKind::Team, DeriveReason::TeamEkEncryption);
impl_metadata!(TeambotEkMetadata, EkKind::Teambot, DeriveReason::TeambotEkEncryption);

/// A usable ephemeral key: the secret seed and its public metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralKey<M> {
    /// Secret seed
    pub seed: Seed,
    /// Public metadata
    pub metadata: M,
}

impl<M: EkMetadata> EphemeralKey<M> {
    /// Generation of this key.
    pub fn generation(&self) -> EkGeneration {
        self.metadata.generation()
    }

    /// Public key of this key.
    pub fn kid(&self) -> Kid {
        self.metadata.kid()
    }

    /// DH keypair for opening boxes addressed to this key.
    pub fn dh_keypair(&self) -> DhKeyPair {
        derive_dh_keypair(&self.seed, M::REASON)
    }
}

/// Device ephemeral key.
pub type DeviceEk = EphemeralKey<DeviceEkMetadata>;
/// User ephemeral key.
pub type UserEk = EphemeralKey<UserEkMetadata>;
/// Team ephemeral key.
pub type TeamEk = EphemeralKey<TeamEkMetadata>;
/// Teambot ephemeral key.
pub type TeambotEk = EphemeralKey<TeambotEkMetadata>;

/// CBOR-encoded metadata plus the authority's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedStatement {
    /// Kind of the encoded metadata
    pub kind: EkKind,
    /// CBOR metadata bytes
    pub body: Vec<u8>,
    /// Public key of the signing authority
    pub signer: VerifyingKey,
    /// Signature over context, kind and body
    pub signature: Signature,
}

#[derive(Deserialize)]
struct GenerationOnly {
    generation: EkGeneration,
}

impl SignedStatement {
    /// Encode and sign `metadata` with `authority`.
    pub fn sign<M: EkMetadata>(metadata: &M, authority: &SigningKeyPair) -> Result<Self, EkError> {
        let mut body = Vec::new();
        ciborium::into_writer(metadata, &mut body).map_err(EkError::serialization)?;

        let signature = authority.sign(&signing_input(M::KIND, &body));
        Ok(Self { kind: M::KIND, body, signer: authority.verifying_key(), signature })
    }

    /// Check the signature against the embedded signer and decode.
    ///
    /// This proves integrity only. Whether the signer is the current
    /// authority is checked by the statement protocol.
    pub fn verify<M: EkMetadata>(&self) -> Result<M, EkError> {
        if self.kind != M::KIND {
            return Err(EkError::InvalidStatement(format!(
                "expected {} statement, got {}",
                M::KIND,
                self.kind
            )));
        }
        ephemera_crypto::verify(&self.signer, &signing_input(self.kind, &self.body), &self.signature)
            .map_err(|e| EkError::InvalidStatement(e.to_string()))?;
        self.decode()
    }

    /// Generation claimed by the statement, without checking the signature.
    ///
    /// Used to keep counting generations when the statement was signed by an
    /// authority that has since rotated.
    pub fn claimed_generation(&self) -> Result<EkGeneration, EkError> {
        let header: GenerationOnly =
            ciborium::from_reader(self.body.as_slice()).map_err(EkError::serialization)?;
        Ok(header.generation)
    }

    fn decode<M: EkMetadata>(&self) -> Result<M, EkError> {
        ciborium::from_reader(self.body.as_slice()).map_err(EkError::serialization)
    }
}

fn signing_input(kind: EkKind, body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(STATEMENT_CONTEXT.len() + 1 + body.len());
    input.extend_from_slice(STATEMENT_CONTEXT);
    input.push(kind as u8);
    input.extend_from_slice(body);
    input
}

/// A seed sealed to one recipient, with the statement of its generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EkBoxed {
    /// Generation of the boxed key
    pub generation: EkGeneration,
    /// Merkle ctime of the boxed key, copied from the statement
    pub ctime: UnixTime,
    /// Who can open the box
    pub recipient: Recipient,
    /// The recipient's own key generation the box was sealed to
    pub recipient_generation: EkGeneration,
    /// Signed statement of the boxed generation
    pub statement: SignedStatement,
    /// The sealed seed
    pub sealed: SealedBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(generation: u64) -> UserEkMetadata {
        UserEkMetadata {
            kid: Kid::from_bytes([1; 32]),
            generation: EkGeneration(generation),
            hash_meta: HashMeta([2; 32]),
            ctime: UnixTime(1_000),
        }
    }

    fn authority() -> SigningKeyPair {
        SigningKeyPair::from_secret_bytes([9; 32])
    }

    #[test]
    fn sign_then_verify() {
        let statement = SignedStatement::sign(&metadata(4), &authority()).unwrap();

        assert_eq!(statement.signer, authority().verifying_key());
        assert_eq!(statement.verify::<UserEkMetadata>().unwrap(), metadata(4));
        assert_eq!(statement.claimed_generation().unwrap(), EkGeneration(4));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let mut statement = SignedStatement::sign(&metadata(4), &authority()).unwrap();
        let last = statement.body.len() - 1;
        statement.body[last] ^= 0x01;

        assert!(matches!(
            statement.verify::<UserEkMetadata>(),
            Err(EkError::InvalidStatement(_))
        ));
    }

    #[test]
    fn kind_is_part_of_the_signature() {
        let mut statement = SignedStatement::sign(&metadata(4), &authority()).unwrap();
        statement.kind = EkKind::Team;

        assert!(statement.verify::<TeamEkMetadata>().is_err());
        assert!(statement.verify::<UserEkMetadata>().is_err());
    }

    #[test]
    fn claimed_generation_reads_every_kind() {
        let teambot = TeambotEkMetadata {
            kid: Kid::from_bytes([1; 32]),
            generation: EkGeneration(12),
            uid: Uid::new("bot"),
            user_ek_generation: Some(EkGeneration(3)),
            hash_meta: HashMeta::default(),
            ctime: UnixTime(5),
        };
        let statement = SignedStatement::sign(&teambot, &authority()).unwrap();
        assert_eq!(statement.claimed_generation().unwrap(), EkGeneration(12));
    }

    #[test]
    fn key_dh_pair_matches_reason() {
        let seed = Seed::from_bytes([4; 32]);
        let kid = derive_dh_keypair(&seed, DeriveReason::UserEkEncryption).kid();
        let key = UserEk { seed, metadata: UserEkMetadata { kid, ..metadata(1) } };

        assert_eq!(key.dh_keypair().kid(), key.kid());
    }
}
