//! Background rotation loop on virtual time.

use std::time::Duration;

use ephemera_core::{AppState, EkGeneration, Principal};
use ephemera_harness::{SimClient, SimWorld, init_tracing};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn setup() -> (SimWorld, SimClient) {
    init_tracing();
    let world = SimWorld::new(11);
    let alice = world.add_user("alice");
    let client = world.client(&alice, "phone");
    (world, client)
}

#[tokio::test(start_paused = true)]
async fn startup_pass_runs_keygen() {
    let (world, client) = setup();

    client.lib.start_background();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.lib.background_run_count(), 1);
    let device = Principal::Device(client.device().clone());
    assert_eq!(world.directory().max_generation(&device), Some(EkGeneration(1)));

    client.lib.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ticker_runs_once_per_interval() {
    let (_world, client) = setup();
    client.lib.start_background();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.lib.background_run_count(), 1);

    tokio::time::sleep(HOUR).await;
    assert_eq!(client.lib.background_run_count(), 2);

    tokio::time::sleep(HOUR).await;
    assert_eq!(client.lib.background_run_count(), 3);

    client.lib.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn background_wakeup_runs_only_when_due() {
    let (world, client) = setup();
    client.lib.start_background();
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.lib.on_app_state(AppState::BackgroundActive);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.lib.background_run_count(), 1);

    // Suspended for a day: the timer never fired but the wall clock moved.
    world.env().advance(DAY);
    client.lib.on_app_state(AppState::BackgroundActive);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.lib.background_run_count(), 2);

    let device = Principal::Device(client.device().clone());
    assert_eq!(world.directory().max_generation(&device), Some(EkGeneration(2)));

    client.lib.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn other_app_states_do_not_trigger_keygen() {
    let (world, client) = setup();
    client.lib.start_background();
    tokio::time::sleep(Duration::from_secs(1)).await;

    world.env().advance(DAY);
    client.lib.on_app_state(AppState::Background);
    client.lib.on_app_state(AppState::Foreground);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(client.lib.background_run_count(), 1);
    client.lib.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_loop() {
    let (world, client) = setup();
    client.lib.start_background();
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.lib.shutdown().await;
    assert!(client.lib.cancellation_token().is_cancelled());

    tokio::time::sleep(3 * HOUR).await;
    client.lib.on_app_state(AppState::BackgroundActive);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(client.lib.background_run_count(), 1);
    assert_eq!(world.directory().post_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn starting_twice_keeps_one_loop() {
    let (_world, client) = setup();

    client.lib.start_background();
    client.lib.start_background();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.lib.background_run_count(), 1);
    client.lib.shutdown().await;
}

#[tokio::test]
async fn login_runs_keygen() {
    let (world, client) = setup();

    client.lib.on_login().await;

    let user = Principal::User(client.uid().clone());
    assert_eq!(world.directory().max_generation(&user), Some(EkGeneration(1)));
}

#[tokio::test]
async fn cleanup_deletes_expired_local_keys() {
    let (world, client) = setup();
    client.lib.keygen_if_needed().await.unwrap();
    world.env().advance(10 * DAY);
    client.lib.keygen_if_needed().await.unwrap();
    world.env().advance(90 * DAY);

    client.lib.cleanup_stale_user_and_device_eks().await.unwrap();

    let ctx = client.lib.context();
    assert!(ctx.device_ek_storage.get_all(client.device()).unwrap().is_empty());
    assert!(ctx.user_ek_storage.get_all_boxed(client.uid()).unwrap().is_empty());
}
