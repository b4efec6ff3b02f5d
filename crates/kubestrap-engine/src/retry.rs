use std::time::Duration;

use kubestrap_core::error::StrapError;
use kubestrap_core::types::RetryPolicy;

/// Whether a failed attempt may be retried under `policy`.
pub fn is_retryable(err: &StrapError, policy: &RetryPolicy) -> bool {
    match err {
        StrapError::CommandFailed { .. } => policy.retry_command_errors,
        e => e.is_transient(),
    }
}

/// Delay before the attempt following `attempt` (1-based):
/// `base * 2^(attempt-1)`, capped at `max_ms`, with 0.8x-1.2x jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let ms = base_ms.saturating_mul(2u64.saturating_pow(exp)).min(max_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
