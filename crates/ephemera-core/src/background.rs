//! Periodic key rotation.
//!
//! One task per [`EkLib`]: a forced pass at startup, then a pass whenever
//! the rotation interval of wall time has elapsed since the last one. The
//! interval is checked on a timer and again when the app becomes active in
//! the background, since timers do not fire while the app is suspended.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EkLib, env::Environment, types::UnixTime};

/// Application lifecycle state, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Visible and running
    Foreground,
    /// Suspended
    Background,
    /// Woken in the background for a short time
    BackgroundActive,
}

pub(crate) struct BackgroundHandle {
    pub(crate) events: mpsc::UnboundedSender<AppState>,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) async fn run<E: Environment>(
    lib: Arc<EkLib<E>>,
    mut events: mpsc::UnboundedReceiver<AppState>,
    cancel: CancellationToken,
) {
    let env = lib.context().env.clone();
    let config = lib.context().config.clone();
    let mut last_run: Option<UnixTime> = None;

    debug!(interval = ?config.background_interval, "background keygen starting");
    run_if_needed(&lib, &mut last_run, config.background_interval, true).await;

    let ticker = env.sleep(config.background_interval);
    tokio::pin!(ticker);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("background keygen shutting down");
                break;
            },
            event = events.recv() => match event {
                Some(AppState::BackgroundActive) => {
                    let delay = jitter(&env, config.app_state_jitter);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = env.sleep(delay) => {},
                    }
                    run_if_needed(&lib, &mut last_run, config.background_interval, false).await;
                },
                Some(state) => debug!(?state, "app state changed"),
                None => break,
            },
            () = &mut ticker => {
                run_if_needed(&lib, &mut last_run, config.background_interval, false).await;
                ticker.set(env.sleep(config.background_interval));
            },
        }
    }
}

async fn run_if_needed<E: Environment>(
    lib: &EkLib<E>,
    last_run: &mut Option<UnixTime>,
    interval: Duration,
    force: bool,
) {
    let now = lib.context().env.wall_clock();
    let due = last_run.is_none_or(|last| now.since(last) >= interval);
    debug!(?last_run, %now, due, force, "background keygen check");
    if !force && !due {
        return;
    }

    lib.record_background_run();
    match lib.keygen_if_needed().await {
        Ok(outcome) => debug!(?outcome, "background keygen finished"),
        Err(err) => warn!(error = %err, "background keygen failed"),
    }
    *last_run = Some(lib.context().env.wall_clock());
}

/// Random delay in `[0, max)` so woken devices do not stampede.
fn jitter<E: Environment>(env: &E, max: Duration) -> Duration {
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(env.random_u64() % max_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_env::SystemEnv;

    #[test]
    fn jitter_stays_below_max() {
        let env = SystemEnv::new();
        for _ in 0..100 {
            assert!(jitter(&env, Duration::from_secs(1)) < Duration::from_secs(1));
        }
        assert_eq!(jitter(&env, Duration::ZERO), Duration::ZERO);
    }
}
