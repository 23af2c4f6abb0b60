use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use waypoint_core::error::{Result, WaypointError};

const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff with jitter before retry number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let exp = attempt.saturating_sub(1).min(16);
    let ms = base_ms.saturating_mul(2u64.pow(exp)).min(MAX_BACKOFF_MS);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Await `fut`, giving up on cancellation or after `timeout`.
///
/// A zero timeout means no time limit.
pub async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(WaypointError::Cancelled);
    }
    if timeout.is_zero() {
        return tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WaypointError::Cancelled),
            result = fut => result,
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WaypointError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(WaypointError::Timeout {
                what: what.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        },
    }
}

/// Sleep for `delay`, waking early with `Cancelled` if the run is cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(WaypointError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_base_means_no_backoff() {
        assert_eq!(calculate_backoff(3, 0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = calculate_backoff(1, 100);
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));
        let third = calculate_backoff(3, 100);
        assert!(third >= Duration::from_millis(320) && third <= Duration::from_millis(480));
        let huge = calculate_backoff(30, 1_000);
        assert!(huge <= Duration::from_millis(36_000));
    }

    #[tokio::test]
    async fn test_guarded_passes_result_through() {
        let token = CancellationToken::new();
        let v = guarded(&token, Duration::from_secs(1), "op", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_times_out() {
        let token = CancellationToken::new();
        let err = guarded(&token, Duration::from_secs(2), "tool slow", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        match err {
            WaypointError::Timeout { what, timeout_secs } => {
                assert_eq!(what, "tool slow");
                assert_eq!(timeout_secs, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_guarded_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let err = guarded(&token, Duration::ZERO, "op", async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::Cancelled));
    }
}
