// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan-interpret — Ballot page interpretation, QR payload codecs,
// adjudication policy, worker pool and ballot package loading.

pub mod adjudication;
pub mod align;
pub mod interpreter;
pub mod marks;
pub mod package;
pub mod pool;
pub mod qr;
pub mod sheet;

pub use adjudication::sheet_requires_adjudication;
pub use interpreter::{InterpretFileResult, Interpreter, InterpreterOptions};
pub use package::{BallotPackage, find_newest_package, read_ballot_package};
pub use pool::{InterpretRequest, InterpretResponse, InterpretWorkerPool};
pub use qr::{QrCodeDetector, SidecarQrDetector};
pub use sheet::classify_sheet;
