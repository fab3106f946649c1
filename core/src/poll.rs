use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::PollError;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    interval: Duration,
    max_wait: Duration,
}

impl PollConfig {
    /// Intervals below one millisecond are raised to one millisecond so the
    /// wait budget always drains.
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            max_wait,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Invoke `task` until `is_ready` accepts its result or `max_wait` has been
/// spent sleeping between attempts.
///
/// Task errors go to `on_error` and do not stop the loop. There is no
/// cancellation: an attempt that never resolves blocks the loop.
pub async fn poll_until_ready<T, E, F, Fut, P, O>(
    config: PollConfig,
    mut task: F,
    is_ready: P,
    mut on_error: O,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
    O: FnMut(&E),
{
    let mut elapsed = Duration::ZERO;
    let mut attempts = 0_u32;

    while elapsed < config.max_wait {
        attempts += 1;
        match task().await {
            Ok(value) if is_ready(&value) => return Ok(value),
            Ok(_) => {
                tracing::debug!(attempt = attempts, "poll attempt not ready");
            }
            Err(err) => on_error(&err),
        }
        tokio::time::sleep(config.interval).await;
        elapsed += config.interval;
    }

    Err(PollError::Timeout {
        waited: elapsed,
        attempts,
    })
}

/// [`poll_until_ready`] with the default readiness rule: the task produced
/// `Some`. Attempt failures are logged.
pub async fn poll_until_some<T, E, F, Fut>(config: PollConfig, task: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Display,
{
    let ready = poll_until_ready(config, task, Option::is_some, |err: &E| {
        tracing::warn!(error = %err, "poll attempt failed");
    })
    .await?;
    let Some(value) = ready else {
        unreachable!("readiness rule only accepts Some");
    };
    Ok(value)
}
