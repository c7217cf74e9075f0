//! Fuzz target for statement and box decoding
//!
//! Boxes and statements arrive from the directory and from local storage, so
//! every byte of them is attacker- or corruption-controlled.
//!
//! # Strategy
//!
//! - Random bytes: arbitrary CBOR decoded as a box
//! - Body tampering: flip bytes of a correctly signed statement
//! - Kind confusion: verify a valid statement as every other kind
//!
//! # Invariants
//!
//! - Decoding and verification NEVER panic
//! - A statement with any modified body byte never verifies
//! - A statement only verifies as the kind it was signed as
//! - Opening a box with the wrong key fails cleanly

#![no_main]

use arbitrary::Arbitrary;
use ephemera_core::{
    DeviceEkMetadata, EkBoxed, EkGeneration, HashMeta, SignedStatement, TeamEkMetadata,
    TeambotEkMetadata, UnixTime, UserEkMetadata,
};
use ephemera_crypto::{DeriveReason, Seed, SigningKeyPair, derive_dh_keypair};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum StatementAttack {
    RandomBox { bytes: Vec<u8> },
    TamperBody { seed: [u8; 32], generation: u64, position: u16, xor: u8 },
    KindConfusion { seed: [u8; 32], generation: u64 },
}

fuzz_target!(|attack: StatementAttack| {
    match attack {
        StatementAttack::RandomBox { bytes } => {
            let Ok(boxed) = ciborium::from_reader::<EkBoxed, _>(bytes.as_slice()) else {
                return;
            };
            verify_as_every_kind(&boxed.statement);
            let _ = boxed.statement.claimed_generation();

            let key = derive_dh_keypair(&Seed::from_bytes([1; 32]), DeriveReason::UserEkEncryption);
            let _ = ephemera_crypto::open(&key, &boxed.sealed);
        },

        StatementAttack::TamperBody { seed, generation, position, xor } => {
            let mut statement = signed_user_statement(seed, generation);
            if statement.body.is_empty() || xor == 0 {
                return;
            }
            let index = usize::from(position) % statement.body.len();
            statement.body[index] ^= xor;

            assert!(statement.verify::<UserEkMetadata>().is_err(), "tampered statement verified");
        },

        StatementAttack::KindConfusion { seed, generation } => {
            let statement = signed_user_statement(seed, generation);

            assert!(statement.verify::<UserEkMetadata>().is_ok());
            assert!(statement.verify::<DeviceEkMetadata>().is_err());
            assert!(statement.verify::<TeamEkMetadata>().is_err());
            assert!(statement.verify::<TeambotEkMetadata>().is_err());
        },
    }
});

fn signed_user_statement(seed: [u8; 32], generation: u64) -> SignedStatement {
    let seed = Seed::from_bytes(seed);
    let metadata = UserEkMetadata {
        kid: derive_dh_keypair(&seed, DeriveReason::UserEkEncryption).kid(),
        generation: EkGeneration(generation),
        hash_meta: HashMeta::default(),
        ctime: UnixTime(generation),
    };
    let authority = SigningKeyPair::from_secret_bytes(*seed.as_bytes());
    let Ok(statement) = SignedStatement::sign(&metadata, &authority) else {
        unreachable!("encoding fixed-size metadata cannot fail");
    };
    statement
}

fn verify_as_every_kind(statement: &SignedStatement) {
    let _ = statement.verify::<DeviceEkMetadata>();
    let _ = statement.verify::<UserEkMetadata>();
    let _ = statement.verify::<TeamEkMetadata>();
    let _ = statement.verify::<TeambotEkMetadata>();
}
