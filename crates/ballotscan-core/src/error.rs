// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for ballotscan.

use thiserror::Error;

/// Top-level error type for all ballotscan operations.
#[derive(Debug, Error)]
pub enum BallotscanError {
    // -- Configuration errors --
    #[error("no election configured")]
    NoElection,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("ballot package error: {0}")]
    Package(String),

    #[error("invalid value: {0}")]
    Validation(String),

    // -- Interpretation errors --
    #[error("image processing failed: {0}")]
    Image(String),

    #[error("interpretation failed: {0}")]
    Interpretation(String),

    // -- Scanner errors --
    #[error("scanner device error: {0}")]
    Device(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("{command} is not allowed while the scanner is {state}")]
    CommandRejected { command: String, state: String },

    // -- Storage / persistence --
    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BallotscanError>;
