// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan-device — Scanner device capability: client traits, reconnect
// backoff, a deterministic mock and the external driver process client.

pub mod backoff;
pub mod client;
pub mod mock;
pub mod process;

pub use backoff::{RetryConfig, RetryDecision, classify_error, compute_delay, should_retry};
pub use client::{DeviceError, DeviceResult, PaperStatus, ScannerClient, ScannerConnector};
pub use mock::{MockCounters, MockScanner};
pub use process::ProcessConnector;
