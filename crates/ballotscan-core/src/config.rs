// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scanner configuration: state machine delays, worker pool sizing and
// on-disk locations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{BallotscanError, Result};

/// Maximum number of consecutive scan attempts for one sheet before the
/// machine gives up and rejects it with `scanning_failed`.
pub const MAX_FAILED_SCAN_ATTEMPTS: u32 = 10;

/// Every timeout and settle delay used by the precinct scanner state machine.
///
/// Production defaults are generous; tests shrink them to a few milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delays {
    #[serde(with = "duration_ms")]
    pub paper_status_polling_interval: Duration,
    #[serde(with = "duration_ms")]
    pub paper_status_polling_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub scanning_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub accepting_timeout: Duration,
    /// How long paper in front is ignored after an accept, so the operator
    /// sees the "accepted" screen before the next ballot is picked up.
    #[serde(with = "duration_ms")]
    pub accepted_ready_for_next_ballot: Duration,
    #[serde(with = "duration_ms")]
    pub accepted_reset_to_no_paper: Duration,
    #[serde(with = "duration_ms")]
    pub wait_for_hold_after_reject: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_on_unexpected_error: Duration,
    #[serde(with = "duration_ms")]
    pub kill_after_disconnect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub calibrate_command_timeout: Duration,
    /// Upper bound for the exponential reconnect backoff.
    #[serde(with = "duration_ms")]
    pub max_reconnect_backoff: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            paper_status_polling_interval: Duration::from_millis(500),
            paper_status_polling_timeout: Duration::from_millis(2_000),
            scanning_timeout: Duration::from_millis(5_000),
            accepting_timeout: Duration::from_millis(5_000),
            accepted_ready_for_next_ballot: Duration::from_millis(2_000),
            accepted_reset_to_no_paper: Duration::from_millis(5_000),
            wait_for_hold_after_reject: Duration::from_millis(1_000),
            reconnect: Duration::from_millis(500),
            reconnect_on_unexpected_error: Duration::from_millis(3_000),
            kill_after_disconnect_timeout: Duration::from_millis(1_000),
            calibrate_command_timeout: Duration::from_millis(20_000),
            max_reconnect_backoff: Duration::from_millis(30_000),
        }
    }
}

impl Delays {
    /// Uniformly short delays for tests that drive the machine end to end.
    pub fn for_tests() -> Self {
        Self {
            paper_status_polling_interval: Duration::from_millis(10),
            paper_status_polling_timeout: Duration::from_millis(200),
            scanning_timeout: Duration::from_millis(1_000),
            accepting_timeout: Duration::from_millis(500),
            accepted_ready_for_next_ballot: Duration::from_millis(50),
            accepted_reset_to_no_paper: Duration::from_millis(150),
            wait_for_hold_after_reject: Duration::from_millis(50),
            reconnect: Duration::from_millis(20),
            reconnect_on_unexpected_error: Duration::from_millis(50),
            kill_after_disconnect_timeout: Duration::from_millis(100),
            calibrate_command_timeout: Duration::from_millis(2_000),
            max_reconnect_backoff: Duration::from_millis(200),
        }
    }
}

/// Persistent scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Identifier stamped onto every exported cast vote record.
    pub scanner_id: String,
    /// State machine timing.
    pub delays: Delays,
    /// Number of concurrent interpretation workers.
    pub interpret_workers: usize,
    /// Directory searched for ballot package zips.
    pub ballot_package_dir: Option<PathBuf>,
    /// Root directory that receives backups.
    pub backup_dir: Option<PathBuf>,
    /// Command line of the external scanner driver. `None` selects the mock
    /// scanner.
    pub driver_command: Option<Vec<String>>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scanner_id: "000".into(),
            delays: Delays::default(),
            interpret_workers: 2,
            ballot_package_dir: None,
            backup_dir: None,
            driver_command: None,
        }
    }
}

impl ScannerConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        if config.interpret_workers == 0 {
            return Err(BallotscanError::Configuration(
                "interpret_workers must be at least 1".into(),
            ));
        }
        info!(scanner_id = %config.scanner_id, "scanner config loaded");
        Ok(config)
    }
}

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ScannerConfig::load(dir.path().join("config.json")).expect("load");
        assert_eq!(config.delays, Delays::default());
        assert_eq!(config.interpret_workers, 2);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"scanner_id":"SC-7","delays":{"scanning_timeout":1234}}"#,
        )
        .expect("write");

        let config = ScannerConfig::load(&path).expect("load");
        assert_eq!(config.scanner_id, "SC-7");
        assert_eq!(config.delays.scanning_timeout, Duration::from_millis(1234));
        assert_eq!(
            config.delays.accepting_timeout,
            Delays::default().accepting_timeout
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"interpret_workers":0}"#).expect("write");
        assert!(ScannerConfig::load(&path).is_err());
    }
}
