//! Keys persisted in Redb survive a restart of the device.

use std::{sync::Arc, time::Duration};

use ephemera_core::{EkGeneration, KvStore, Principal, RedbKv, SealedKv};
use ephemera_harness::{SimWorld, init_tracing};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn open_kv(path: &std::path::Path) -> Arc<dyn KvStore> {
    Arc::new(SealedKv::new(RedbKv::open(path).unwrap(), [7; 32]))
}

#[tokio::test]
async fn restart_continues_after_persisted_generation() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.redb");
    let world = SimWorld::new(21);
    let alice = world.add_user("alice");

    {
        let client = world.client_with_kv(&alice, "phone", open_kv(&path));
        client.lib.keygen_if_needed().await.unwrap();
        client.lib.shutdown().await;
    }

    world.env().advance(DAY);
    let client = world.client_with_kv(&alice, "phone", open_kv(&path));

    let storage = &client.lib.context().device_ek_storage;
    assert_eq!(storage.max_generation(client.device(), false).unwrap(), Some(EkGeneration(1)));

    let outcome = client.lib.keygen_if_needed().await.unwrap();
    assert_eq!(outcome.device_ek, Some(EkGeneration(2)));
    assert_eq!(
        world.directory().generations(&Principal::Device(client.device().clone())),
        vec![EkGeneration(1), EkGeneration(2)]
    );
}

#[tokio::test]
async fn restart_within_interval_publishes_nothing() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.redb");
    let world = SimWorld::new(22);
    let alice = world.add_user("alice");

    let first_user_ek = {
        let client = world.client_with_kv(&alice, "phone", open_kv(&path));
        client.lib.keygen_if_needed().await.unwrap();
        let ctx = client.lib.context();
        let key = ctx.user_ek_storage.get(ctx, &alice, EkGeneration(1), None).await.unwrap();
        client.lib.shutdown().await;
        key
    };
    let posts = world.directory().post_count();

    let client = world.client_with_kv(&alice, "phone", open_kv(&path));
    let outcome = client.lib.keygen_if_needed().await.unwrap();

    assert_eq!(outcome.device_ek, None);
    assert_eq!(outcome.user_ek, None);
    assert_eq!(world.directory().post_count(), posts);

    // The user key opens from the persisted box without refetching.
    world.directory().set_offline(true);
    let ctx = client.lib.context();
    let reopened = ctx.user_ek_storage.get(ctx, &alice, EkGeneration(1), None).await.unwrap();
    assert_eq!(reopened, first_user_ek);
}

#[tokio::test]
async fn records_are_encrypted_at_rest() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.redb");
    let world = SimWorld::new(23);
    let alice = world.add_user("alice");

    {
        let client = world.client_with_kv(&alice, "phone", open_kv(&path));
        client.lib.keygen_if_needed().await.unwrap();
        client.lib.shutdown().await;
    }

    // Opened with the wrong at-rest key, every record reads as corrupted.
    let wrong: Arc<dyn KvStore> = Arc::new(SealedKv::new(RedbKv::open(&path).unwrap(), [8; 32]));
    let client = world.client_with_kv(&alice, "phone", wrong);
    let storage = &client.lib.context().device_ek_storage;

    assert_eq!(storage.max_generation(client.device(), false).unwrap(), None);
}
