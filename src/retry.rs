//! Backoff computation and transient-error classification.
//!
//! The pull loop retries transient failures with capped exponential
//! backoff; everything else in the crate classifies once and surfaces the
//! error directly. Classification lives here so the supervisor, catalog,
//! and completion clients all agree on what counts as transient.

use crate::error::RuntimeError;
use std::time::Duration;

/// Message fragments that mark an otherwise-opaque error as transient.
///
/// Structural causes (reset/refused/DNS/broken pipe) are matched by their
/// conventional message phrasing when the error type does not expose them
/// directly.
const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "socket",
    "aborted",
    "connection reset",
    "connection refused",
    "broken pipe",
    "dns",
];

/// Delay before retry attempt `attempt` (1-based): `min(base · 2^(attempt−1), cap)`.
///
/// With the default base of 2000ms and cap of 8000ms the series is
/// 2000, 4000, 8000, 8000, ...
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let shift = attempt.saturating_sub(1).min(63);
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(cap_ms);
    Duration::from_millis(delay_ms)
}

/// Whether an error message indicates a transient network-level fault.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Classify a reqwest error into a [`RuntimeError`].
///
/// Timeouts and connect failures map to their dedicated variants; other
/// transport errors are transient only if their message says so.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RuntimeError {
    if err.is_timeout() {
        RuntimeError::Timeout(err.to_string())
    } else if err.is_connect() {
        RuntimeError::ConnectionFailed(err.to_string())
    } else {
        let detail = format!("transport error: {err}");
        if is_transient_message(&detail) {
            RuntimeError::ConnectionFailed(detail)
        } else {
            RuntimeError::Protocol(detail)
        }
    }
}
