// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded pool that runs sheet interpretation off the async runtime.
//
// Interpretation is CPU-bound and touches the filesystem, so each request
// runs under `spawn_blocking`. A semaphore caps how many run at once.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::interpretation::SheetInterpretation;
use ballotscan_core::types::{SheetId, SheetOf, SheetPage};

use crate::interpreter::Interpreter;

/// A scanned sheet waiting to be interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretRequest {
    pub sheet_id: SheetId,
    pub images: SheetOf<PathBuf>,
}

/// A fully interpreted sheet, ready to be routed and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretResponse {
    pub sheet_id: SheetId,
    pub interpretation: SheetInterpretation,
    pub pages: SheetOf<SheetPage>,
    /// Adjudication policy verdict recorded with the sheet.
    pub requires_adjudication: bool,
}

#[derive(Clone)]
pub struct InterpretWorkerPool {
    interpreter: Arc<Interpreter>,
    permits: Arc<Semaphore>,
    output_dir: PathBuf,
}

impl InterpretWorkerPool {
    /// Create a pool running at most `workers` interpretations concurrently.
    /// Normalized images are written to `output_dir`.
    pub fn new(interpreter: Interpreter, workers: usize, output_dir: impl Into<PathBuf>) -> Result<Self> {
        if workers == 0 {
            return Err(BallotscanError::Configuration(
                "interpret worker pool needs at least one worker".into(),
            ));
        }
        Ok(Self {
            interpreter: Arc::new(interpreter),
            permits: Arc::new(Semaphore::new(workers)),
            output_dir: output_dir.into(),
        })
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    #[instrument(skip_all, fields(sheet_id = %request.sheet_id))]
    pub async fn interpret(&self, request: InterpretRequest) -> Result<InterpretResponse> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BallotscanError::Interpretation(format!("worker pool closed: {e}")))?;
        debug!(available = self.permits.available_permits(), "interpret worker acquired");

        let interpreter = Arc::clone(&self.interpreter);
        let output_dir = self.output_dir.clone();
        tokio::task::spawn_blocking(move || {
            interpreter.interpret_sheet(request.sheet_id, &request.images, &output_dir)
        })
        .await
        .map_err(|e| BallotscanError::Interpretation(format!("interpret worker failed: {e}")))?
    }
}
