// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scanner capability traits.
//
// The paper transport is an opaque device. Everything the state machine needs
// from it is expressed here; the real driver and the mock both implement
// these traits. Calls are blocking; async callers wrap them in
// `tokio::task::spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ballotscan_core::error::BallotscanError;
use ballotscan_core::types::SheetOf;

/// Where the paper is, as reported by the transport sensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperStatus {
    NoPaper,
    /// Paper held in the front, ready to be pulled in.
    ReadyToScan,
    /// Paper held in the back, waiting to be dropped or returned.
    ReadyToEject,
    /// Paper held in the back while another sheet is inserted in front.
    BothSidesHavePaper,
    Jam,
    /// Any status code the state machine has no transition for.
    Unexpected(String),
}

impl PaperStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoPaper => "no_paper",
            Self::ReadyToScan => "ready_to_scan",
            Self::ReadyToEject => "ready_to_eject",
            Self::BothSidesHavePaper => "both_sides_have_paper",
            Self::Jam => "jam",
            Self::Unexpected(code) => code,
        }
    }

    /// Parse a driver status code. Unknown codes become `Unexpected`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "no_paper" | "dev_ready_no_paper" => Self::NoPaper,
            "ready_to_scan" => Self::ReadyToScan,
            "ready_to_eject" => Self::ReadyToEject,
            "both_sides_have_paper" => Self::BothSidesHavePaper,
            "jam" | "front_and_back_sensor_have_paper_ready" => Self::Jam,
            other => Self::Unexpected(other.to_owned()),
        }
    }
}

/// Failures reported by a scanner client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("scanner disconnected")]
    Disconnected,

    #[error("paper jammed")]
    Jammed,

    /// The rollers did not grab the sheet.
    #[error("error feeding paper")]
    PaperFeed,

    /// The feeder was empty when a scan started.
    #[error("no paper in feeder")]
    NoPaper,

    #[error("invalid response from scanner: {0}")]
    InvalidResponse(String),

    #[error("scanner command failed: {0}")]
    Command(String),

    #[error("scanner I/O error: {0}")]
    Io(String),
}

impl DeviceError {
    /// Scan failures caused by the sheet not being fed, worth another try.
    pub fn is_feeder_error(&self) -> bool {
        matches!(self, Self::PaperFeed | Self::NoPaper)
    }

    /// The driver returned a single image; reconnecting does not help.
    pub fn is_missing_page(&self) -> bool {
        matches!(self, Self::InvalidResponse(message) if message.starts_with("expected two"))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset => DeviceError::Disconnected,
            _ => DeviceError::Io(err.to_string()),
        }
    }
}

impl From<DeviceError> for BallotscanError {
    fn from(err: DeviceError) -> Self {
        BallotscanError::Device(err.to_string())
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// A connected scanner.
pub trait ScannerClient: Send + Sync {
    fn paper_status(&self) -> DeviceResult<PaperStatus>;

    /// Pull the sheet in and image both sides. Returns the front and back
    /// image files.
    fn scan(&self) -> DeviceResult<SheetOf<PathBuf>>;

    /// Drop the sheet held in the back into the ballot box.
    fn accept(&self) -> DeviceResult<()>;

    /// Push the sheet back out the front. With `hold` the transport keeps a
    /// grip on it until the voter pulls it out.
    fn reject(&self, hold: bool) -> DeviceResult<()>;

    fn calibrate(&self) -> DeviceResult<()>;

    /// Disconnect cleanly.
    fn close(&self) -> DeviceResult<()>;

    /// Forcefully terminate the connection when `close` hangs.
    fn kill(&self) -> DeviceResult<()>;
}

/// Opens connections to a scanner.
pub trait ScannerConnector: Send + Sync {
    fn connect(&self) -> DeviceResult<Arc<dyn ScannerClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            PaperStatus::NoPaper,
            PaperStatus::ReadyToScan,
            PaperStatus::ReadyToEject,
            PaperStatus::BothSidesHavePaper,
            PaperStatus::Jam,
        ] {
            assert_eq!(PaperStatus::from_code(status.as_str()), status);
        }
        assert_eq!(PaperStatus::from_code("dev_ready_no_paper"), PaperStatus::NoPaper);
        assert_eq!(
            PaperStatus::from_code("calibrating"),
            PaperStatus::Unexpected("calibrating".into())
        );
    }

    #[test]
    fn feeder_and_missing_page_errors() {
        assert!(DeviceError::PaperFeed.is_feeder_error());
        assert!(DeviceError::NoPaper.is_feeder_error());
        assert!(!DeviceError::Jammed.is_feeder_error());
        assert!(DeviceError::InvalidResponse("expected two files, got 1".into()).is_missing_page());
        assert!(!DeviceError::InvalidResponse("bad json".into()).is_missing_page());
    }

    #[test]
    fn broken_pipe_means_disconnected() {
        let err: DeviceError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, DeviceError::Disconnected);
        let err: BallotscanError = DeviceError::Jammed.into();
        assert_eq!(err.to_string(), "scanner device error: paper jammed");
    }
}
