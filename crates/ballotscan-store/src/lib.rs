// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan-store — Durable ledger of batches and sheets, election
// configuration, scanner audit trail and cast vote record export.

pub mod audit;
pub mod cvr;
pub mod store;

pub use audit::{AuditEntry, AuditLog};
pub use store::{AdjudicationStatus, ResultSheet, Store};
