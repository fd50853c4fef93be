// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan — Core types and error definitions shared across all crates.

pub mod config;
pub mod election;
pub mod error;
pub mod interpretation;
pub mod layout;
pub mod status;
pub mod types;

pub use config::{Delays, ScannerConfig};
pub use error::BallotscanError;
pub use types::*;
