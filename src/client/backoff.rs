//! Reconnection backoff for upstream MCP servers.
//!
//! Delay grows geometrically from a 1s base, capped at 5 minutes, with
//! jitter so that a fleet of servers that all dropped at once (e.g. a
//! network blip) doesn't hammer back in lockstep.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{error, info, warn};

use crate::error::McpResult;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);
const RANDOMIZATION_FACTOR: f64 = 0.2;
const MULTIPLIER: f64 = 2.0;

/// Builds the `backoff` crate policy used for reconnect attempts. Never
/// gives up on its own (`max_elapsed_time: None`) — the supervisor decides
/// when a server should be quarantined instead of retried forever.
pub fn policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(BASE_DELAY)
        .with_max_interval(MAX_DELAY)
        .with_multiplier(MULTIPLIER)
        .with_randomization_factor(RANDOMIZATION_FACTOR)
        .with_max_elapsed_time(None)
        .build()
}

/// Drives repeated reconnect attempts against `connect_fn` using `policy()`,
/// sleeping between attempts and stopping after `max_attempts` failures.
/// Returns the last error if every attempt failed.
pub async fn reconnect_with_backoff<F, Fut, T>(
    server_name: &str,
    max_attempts: u32,
    mut connect_fn: F,
) -> McpResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = McpResult<T>>,
{
    let mut backoff = policy();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connect_fn().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(server = server_name, attempt, "reconnected");
                }
                return Ok(val);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    error!(server = server_name, attempt, error = %e, "giving up reconnecting");
                    return Err(e);
                }
                let delay = backoff.next_backoff().unwrap_or(MAX_DELAY);
                warn!(server = server_name, attempt, error = %e, delay_ms = delay.as_millis() as u64, "reconnect attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_bounds() {
        let mut backoff = policy();
        for _ in 0..20 {
            let delay = backoff.next_backoff().expect("never elapses");
            assert!(delay <= MAX_DELAY + MAX_DELAY.mul_f64(RANDOMIZATION_FACTOR));
        }
    }

    #[test]
    fn test_policy_grows_then_caps() {
        let mut backoff = policy();
        let first = backoff.next_backoff().unwrap();
        // with 20% jitter, first delay is within [0.8s, 1.2s]
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        for _ in 0..30 {
            backoff.next_backoff().unwrap();
        }
        let later = backoff.next_backoff().unwrap();
        assert!(later <= MAX_DELAY + MAX_DELAY.mul_f64(RANDOMIZATION_FACTOR));
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_eventually() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = AtomicU32::new(0);
        let result = reconnect_with_backoff("test-server", 5, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(crate::error::McpError::Transport("not yet".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up() {
        let result: McpResult<()> = reconnect_with_backoff("test-server", 2, || async {
            Err(crate::error::McpError::Transport("down".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
