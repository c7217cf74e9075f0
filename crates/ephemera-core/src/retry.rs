//! Bounded retry for publish operations.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{env::Environment, error::EkError};

/// Retry budget for one publish.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay, multiplied by the attempt number
    pub backoff: Duration,
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// budget runs out.
///
/// Each attempt re-derives its generation from the server, so a retry after
/// a [`EkError::GenerationConflict`] lands on the winner's generation plus
/// one. Cancelling `cancel` aborts an in-flight attempt or backoff with
/// [`EkError::Cancelled`].
pub(crate) async fn with_publish_retry<E, T, F, Fut>(
    env: &E,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, EkError>
where
    E: Environment,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EkError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt_number = 1;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EkError::Cancelled),
            result = attempt() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt_number >= max_attempts {
            warn!(operation, attempts = attempt_number, error = %err, "publish retries exhausted");
            return Err(err);
        }

        debug!(operation, attempt = attempt_number, error = %err, "retrying publish");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EkError::Cancelled),
            () = env.sleep(policy.backoff * attempt_number) => {},
        }
        attempt_number += 1;
    }
}
