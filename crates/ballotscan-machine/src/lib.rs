// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan-machine — Precinct scanner state machine: pure transition core
// plus the tokio actor that drives the device, interpreter and store.

pub mod fsm;
pub mod runtime;

pub use fsm::{Command, CommandError, Effect, Event, MachineStatus, Phase, ScannerMachine, Timer};
pub use runtime::PrecinctScanner;
