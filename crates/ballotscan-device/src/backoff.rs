// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconnect policy with exponential backoff + jitter.
//
// Classifies device errors into Transient (reconnect), UserAction (reconnect,
// but someone has to fix the hardware first) and Permanent (give up).

use std::time::Duration;

use tracing::{debug, info, warn};

use ballotscan_core::types::ErrorClass;

use crate::client::DeviceError;

/// Reconnect configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts. `u32::MAX` retries forever.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Result of evaluating whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Do not retry, the error will not go away on its own.
    GiveUp(ErrorClass),
    Exhausted,
}

pub fn classify_error(err: &DeviceError) -> ErrorClass {
    match err {
        DeviceError::Disconnected | DeviceError::Io(_) => ErrorClass::Transient,
        DeviceError::PaperFeed | DeviceError::NoPaper => ErrorClass::Transient,
        DeviceError::Jammed => ErrorClass::UserAction,
        DeviceError::InvalidResponse(_) => ErrorClass::Permanent,
        DeviceError::Command(detail) => classify_command_detail(detail),
    }
}

/// Classify a driver failure message.
fn classify_command_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out") || lower.contains("busy") || lower.contains("resource temporarily") {
        return ErrorClass::Transient;
    }

    if lower.contains("jam") || lower.contains("cover open") || lower.contains("paper") {
        return ErrorClass::UserAction;
    }

    if lower.contains("not found") || lower.contains("permission denied") || lower.contains("unsupported") {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}

/// Decide whether to try reconnecting after `err` on attempt `attempt`.
pub fn should_retry(err: &DeviceError, attempt: u32, config: &RetryConfig) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!(error = %err, "permanent device error, not reconnecting");
            RetryDecision::GiveUp(ErrorClass::Permanent)
        }
        class => {
            if attempt >= config.max_retries {
                warn!(attempt, max = config.max_retries, "reconnect limit exhausted");
                return RetryDecision::Exhausted;
            }
            let delay = compute_delay(attempt, config);
            debug!(attempt, ?class, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            RetryDecision::RetryAfter(delay)
        }
    }
}

/// delay = min(base * 2^attempt + jitter, max_delay), jitter in [0, base).
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(10));
    let total_ms = exp_ms.saturating_add(jitter(base_ms, attempt));
    let capped_ms = total_ms.min(config.max_delay.as_millis() as u64);
    Duration::from_millis(capped_ms)
}

/// Deterministic spread across [0, base).
fn jitter(base_ms: u64, attempt: u32) -> u64 {
    let hash = (attempt as u64).wrapping_mul(6364136223846793005);
    hash % base_ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_is_transient() {
        assert_eq!(classify_error(&DeviceError::Disconnected), ErrorClass::Transient);
    }

    #[test]
    fn jam_is_user_action() {
        assert_eq!(classify_error(&DeviceError::Jammed), ErrorClass::UserAction);
        assert_eq!(
            classify_error(&DeviceError::Command("cover open".into())),
            ErrorClass::UserAction
        );
    }

    #[test]
    fn missing_driver_is_permanent() {
        let err = DeviceError::Command("driver binary not found".into());
        assert_eq!(classify_error(&err), ErrorClass::Permanent);
        assert_eq!(
            should_retry(&err, 0, &RetryConfig::default()),
            RetryDecision::GiveUp(ErrorClass::Permanent)
        );
    }

    #[test]
    fn retry_respects_max() {
        let config = RetryConfig {
            max_retries: 3,
            ..Default::default()
        };
        let err = DeviceError::Disconnected;
        assert!(matches!(should_retry(&err, 0, &config), RetryDecision::RetryAfter(_)));
        assert_eq!(should_retry(&err, 3, &config), RetryDecision::Exhausted);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        };
        let d0 = compute_delay(0, &config);
        let d1 = compute_delay(1, &config);
        let d2 = compute_delay(2, &config);
        assert!(d1 > d0);
        assert!(d2 > d1);
        assert_eq!(compute_delay(20, &config), Duration::from_secs(2));
    }
}
