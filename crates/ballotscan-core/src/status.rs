// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator-facing scanner status.

use serde::{Deserialize, Serialize};

use crate::interpretation::SheetInterpretation;

/// Scanner state as reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Connecting,
    Disconnected,
    NoPaper,
    ReadyToScan,
    Scanning,
    ReadyToAccept,
    Accepting,
    Accepted,
    NeedsReview,
    AcceptingAfterReview,
    Returning,
    Returned,
    Rejecting,
    Rejected,
    Calibrating,
    Jammed,
    BothSidesHavePaper,
    RecoveringFromError,
    UnrecoverableError,
}

impl ScannerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
            Self::NoPaper => "no_paper",
            Self::ReadyToScan => "ready_to_scan",
            Self::Scanning => "scanning",
            Self::ReadyToAccept => "ready_to_accept",
            Self::Accepting => "accepting",
            Self::Accepted => "accepted",
            Self::NeedsReview => "needs_review",
            Self::AcceptingAfterReview => "accepting_after_review",
            Self::Returning => "returning",
            Self::Returned => "returned",
            Self::Rejecting => "rejecting",
            Self::Rejected => "rejected",
            Self::Calibrating => "calibrating",
            Self::Jammed => "jammed",
            Self::BothSidesHavePaper => "both_sides_have_paper",
            Self::RecoveringFromError => "recovering_from_error",
            Self::UnrecoverableError => "unrecoverable_error",
        }
    }

    /// States in which the status payload carries the error.
    pub fn reports_error(&self) -> bool {
        matches!(
            self,
            Self::Rejecting | Self::Rejected | Self::RecoveringFromError | Self::UnrecoverableError
        )
    }
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the scanner is rejecting, recovering, or stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerErrorType {
    PaperStatusTimedOut,
    ScanningTimedOut,
    ScanningFailed,
    BothSidesHavePaper,
    PaperInBackAfterAccept,
    PaperInFrontAfterReconnect,
    PaperInBackAfterReconnect,
    UnexpectedPaperStatus,
    UnexpectedEvent,
    DeviceError,
}

impl ScannerErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaperStatusTimedOut => "paper_status_timed_out",
            Self::ScanningTimedOut => "scanning_timed_out",
            Self::ScanningFailed => "scanning_failed",
            Self::BothSidesHavePaper => "both_sides_have_paper",
            Self::PaperInBackAfterAccept => "paper_in_back_after_accept",
            Self::PaperInFrontAfterReconnect => "paper_in_front_after_reconnect",
            Self::PaperInBackAfterReconnect => "paper_in_back_after_reconnect",
            Self::UnexpectedPaperStatus => "unexpected_paper_status",
            Self::UnexpectedEvent => "unexpected_event",
            Self::DeviceError => "device_error",
        }
    }
}

impl std::fmt::Display for ScannerErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `getScannerStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerStatus {
    pub state: ScannerState,
    pub ballots_counted: u64,
    pub can_unconfigure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScannerErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<SheetInterpretation>,
}
