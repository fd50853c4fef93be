// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// External scanner driver process.
//
// The vendor driver runs as a child process speaking JSON lines. Each request
// is one object on stdin:
//
//   {"command":"paper_status"} {"command":"scan"} {"command":"accept"}
//   {"command":"reject","hold":true} {"command":"calibrate"} {"command":"exit"}
//
// and each response is one object on stdout, either `{"ok": <value>}` or
// `{"error": {"kind": "<kind>", "message": "..."}}`.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use ballotscan_core::types::SheetOf;

use crate::client::{DeviceError, DeviceResult, PaperStatus, ScannerClient, ScannerConnector};

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum DriverRequest {
    PaperStatus,
    Scan,
    Accept,
    Reject { hold: bool },
    Calibrate,
    Exit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DriverResponse {
    Ok(serde_json::Value),
    Error(DriverFailure),
}

#[derive(Debug, Deserialize)]
struct DriverFailure {
    kind: String,
    #[serde(default)]
    message: String,
}

impl From<DriverFailure> for DeviceError {
    fn from(failure: DriverFailure) -> Self {
        match failure.kind.as_str() {
            "disconnected" => DeviceError::Disconnected,
            "jam" => DeviceError::Jammed,
            "paper_feed" => DeviceError::PaperFeed,
            "no_paper" => DeviceError::NoPaper,
            "invalid_response" => DeviceError::InvalidResponse(failure.message),
            _ => DeviceError::Command(failure.message),
        }
    }
}

/// Spawns the driver command for each connection.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    command: Vec<String>,
}

impl ProcessConnector {
    /// `command` is the program followed by its arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ScannerConnector for ProcessConnector {
    #[instrument(skip_all, fields(program = ?self.command.first()))]
    fn connect(&self) -> DeviceResult<Arc<dyn ScannerClient>> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(DeviceError::Command("driver command is empty".into()));
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DeviceError::Command(format!("{program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DeviceError::Io("driver pipes unavailable".into()));
        };
        info!(pid = child.id(), "scanner driver started");
        Ok(Arc::new(ProcessClient {
            io: Mutex::new(DriverIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
        }))
    }
}

struct DriverIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A running driver process. Requests are serialized on the pipe lock; the
/// child handle has its own lock so `kill` works while a request hangs.
pub struct ProcessClient {
    io: Mutex<DriverIo>,
    child: Mutex<Child>,
}

fn lock<T>(mutex: &Mutex<T>) -> DeviceResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| DeviceError::Io("driver lock poisoned".into()))
}

impl ProcessClient {
    fn request(&self, request: &DriverRequest) -> DeviceResult<serde_json::Value> {
        let mut io = lock(&self.io)?;
        let line = serde_json::to_string(request).map_err(|e| DeviceError::Io(e.to_string()))?;
        writeln!(io.stdin, "{line}")?;
        io.stdin.flush()?;

        let mut reply = String::new();
        if io.stdout.read_line(&mut reply)? == 0 {
            return Err(DeviceError::Disconnected);
        }
        debug!(?request, "driver replied");
        match serde_json::from_str(&reply) {
            Ok(DriverResponse::Ok(value)) => Ok(value),
            Ok(DriverResponse::Error(failure)) => Err(failure.into()),
            Err(e) => Err(DeviceError::InvalidResponse(format!("{e}: {}", reply.trim_end()))),
        }
    }
}

impl ScannerClient for ProcessClient {
    fn paper_status(&self) -> DeviceResult<PaperStatus> {
        match self.request(&DriverRequest::PaperStatus)? {
            serde_json::Value::String(code) => Ok(PaperStatus::from_code(&code)),
            other => Err(DeviceError::InvalidResponse(format!("paper status {other}"))),
        }
    }

    fn scan(&self) -> DeviceResult<SheetOf<PathBuf>> {
        let files: Vec<PathBuf> = serde_json::from_value(self.request(&DriverRequest::Scan)?)
            .map_err(|e| DeviceError::InvalidResponse(e.to_string()))?;
        match <[PathBuf; 2]>::try_from(files) {
            Ok([front, back]) => Ok(SheetOf::new(front, back)),
            Err(files) => Err(DeviceError::InvalidResponse(format!(
                "expected two files, got {}",
                files.len()
            ))),
        }
    }

    fn accept(&self) -> DeviceResult<()> {
        self.request(&DriverRequest::Accept).map(drop)
    }

    fn reject(&self, hold: bool) -> DeviceResult<()> {
        self.request(&DriverRequest::Reject { hold }).map(drop)
    }

    fn calibrate(&self) -> DeviceResult<()> {
        self.request(&DriverRequest::Calibrate).map(drop)
    }

    fn close(&self) -> DeviceResult<()> {
        self.request(&DriverRequest::Exit)?;
        let status = lock(&self.child)?.wait()?;
        info!(%status, "scanner driver exited");
        Ok(())
    }

    fn kill(&self) -> DeviceResult<()> {
        let mut child = lock(&self.child)?;
        warn!(pid = child.id(), "killing scanner driver");
        child
            .kill()
            .map_err(|e| DeviceError::Command(format!("kill failed: {e}")))?;
        child.wait()?;
        Ok(())
    }
}
