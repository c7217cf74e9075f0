//! Property tests: published generations stay gap-free and every local key
//! matches what was published, whatever mix of rotation, failures and local
//! key loss happens.

use std::{sync::Arc, time::Duration};

use ephemera_core::{ChaoticKv, DeviceEkMetadata, EkGeneration, MemoryKv, Principal, TeamId};
use ephemera_harness::{SimClient, SimWorld, init_tracing};
use proptest::prelude::*;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum Op {
    Advance { hours: u16 },
    Keygen { device: usize },
    LoseLatestDeviceKey { device: usize },
    FailPosts { count: usize },
    ClearCaches { device: usize },
    TeamKey { device: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let device = 0..2usize;
    prop_oneof![
        3 => (0..72u16).prop_map(|hours| Op::Advance { hours }),
        4 => device.clone().prop_map(|device| Op::Keygen { device }),
        1 => device.clone().prop_map(|device| Op::LoseLatestDeviceKey { device }),
        1 => (0..8usize).prop_map(|count| Op::FailPosts { count }),
        1 => device.clone().prop_map(|device| Op::ClearCaches { device }),
        2 => device.prop_map(|device| Op::TeamKey { device }),
    ]
}

fn contiguous(gens: &[EkGeneration]) -> bool {
    gens.iter().zip(1u64..).all(|(g, expected)| g.0 == expected)
}

/// Every readable local device key has a published statement with the same kid.
fn local_keys_match_published(world: &SimWorld, client: &SimClient) -> Result<(), TestCaseError> {
    let principal = Principal::Device(client.device().clone());
    let local = client.lib.context().device_ek_storage.get_all(client.device()).unwrap();

    for (generation, key) in local {
        let statement = world.directory().statement(&principal, generation);
        prop_assert!(statement.is_some(), "local {} was never published", generation);
        let published = statement.unwrap().verify::<DeviceEkMetadata>().unwrap();
        prop_assert_eq!(published.kid, key.metadata.kid);
    }
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

async fn apply(world: &SimWorld, clients: &[SimClient], team: &TeamId, op: &Op) {
    match op {
        Op::Advance { hours } => world.env().advance(Duration::from_secs(u64::from(*hours) * 3600)),
        Op::Keygen { device } => {
            let _ = clients[*device].lib.keygen_if_needed().await;
        },
        Op::LoseLatestDeviceKey { device } => {
            let client = &clients[*device];
            let storage = &client.lib.context().device_ek_storage;
            if let Some(latest) = storage.max_generation(client.device(), true).unwrap() {
                storage.delete(client.device(), latest).unwrap();
            }
        },
        Op::FailPosts { count } => world.directory().fail_next_posts(*count),
        Op::ClearCaches { device } => clients[*device].lib.clear_caches(),
        Op::TeamKey { device } => {
            let _ = clients[*device].lib.get_or_create_latest_team_ek(team).await;
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_generations_are_gap_free(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        init_tracing();
        runtime().block_on(async {
            let world = SimWorld::new(seed);
            let alice = world.add_user("alice");
            let team = world.add_team("acme", &[&alice]);
            let clients = vec![world.client(&alice, "phone"), world.client(&alice, "laptop")];

            for op in &ops {
                apply(&world, &clients, &team, op).await;

                for client in &clients {
                    let device = Principal::Device(client.device().clone());
                    let gens = world.directory().generations(&device);
                    prop_assert!(contiguous(&gens), "device gap after {:?}: {:?}", op, gens);
                    local_keys_match_published(&world, client)?;
                }

                let user = world.directory().generations(&Principal::User(alice.clone()));
                prop_assert!(contiguous(&user), "user gap after {:?}: {:?}", op, user);

                let team_gens = world.directory().generations(&Principal::Team(team.clone()));
                prop_assert!(contiguous(&team_gens), "team gap after {:?}: {:?}", op, team_gens);
            }

            for client in &clients {
                client.lib.shutdown().await;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_local_generation_never_exceeds_published(
        seed in any::<u64>(),
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        init_tracing();
        runtime().block_on(async {
            let world = SimWorld::new(seed);
            let alice = world.add_user("alice");
            let team = world.add_team("acme", &[&alice]);
            let clients = vec![world.client(&alice, "phone"), world.client(&alice, "laptop")];

            for op in &ops {
                apply(&world, &clients, &team, op).await;
            }

            for client in &clients {
                let device = Principal::Device(client.device().clone());
                let local = client
                    .lib
                    .context()
                    .device_ek_storage
                    .max_generation(client.device(), true)
                    .unwrap();
                prop_assert!(local <= world.directory().max_generation(&device));
                client.lib.shutdown().await;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test(start_paused = true)]
async fn storage_failures_never_leave_unpublished_keys() {
    init_tracing();
    let world = SimWorld::new(31);
    let alice = world.add_user("alice");
    let kv = MemoryKv::new();
    let chaotic = ChaoticKv::with_seed(kv.clone(), 0.2, 99);

    let client = world.client_with_kv(&alice, "phone", Arc::new(chaotic.clone()));
    let mut failures = 0;
    for _ in 0..30 {
        if client.lib.keygen_if_needed().await.is_err() {
            failures += 1;
        }
        client.lib.clear_caches();
        world.env().advance(DAY);
    }
    client.lib.shutdown().await;
    assert!(failures > 0);
    assert!(chaotic.operation_count() > 0);

    // Restart on the same records without injected failures.
    let restarted = world.client_with_kv(&alice, "phone", Arc::new(kv));
    local_keys_match_published(&world, &restarted).unwrap();

    let outcome = restarted.lib.keygen_if_needed().await.unwrap();
    let device = Principal::Device(restarted.device().clone());
    assert_eq!(outcome.device_ek, world.directory().max_generation(&device));
    assert!(contiguous(&world.directory().generations(&device)));
    assert!(contiguous(&world.directory().generations(&Principal::User(alice))));
}
