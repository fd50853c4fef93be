// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// JSON-lines RPC transport.
//
// One request object per input line:
//   {"id": 1, "method": "scanBallot", "params": {}}
// answered by one response line:
//   {"id": 1, "result": ...}  or  {"id": 1, "error": {"message": "..."}}

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::types::{MarkThresholds, PollsState, PrecinctSelection};

use crate::services::app_services::AppServices;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Result { id: Value, result: Value },
    Error { id: Value, error: RpcError },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ConfigureParams {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UnconfigureParams {
    ignore_backup_requirement: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PrecinctSelectionParams {
    precinct_selection: Option<PrecinctSelection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MarkThresholdParams {
    mark_threshold_overrides: Option<MarkThresholds>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestModeParams {
    is_test_mode: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollsStateParams {
    polls_state: PollsState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportParams {
    path: PathBuf,
    #[serde(default)]
    include_images: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuditParams {
    limit: Option<u32>,
}

fn params<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    // Absent params read as an empty object.
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value)
        .map_err(|e| BallotscanError::Validation(format!("{method}: bad params: {e}")))
}

fn done() -> Result<Value> {
    Ok(Value::Null)
}

/// Run one method against the services.
pub async fn dispatch(svc: &AppServices, method: &str, raw: Value) -> Result<Value> {
    match method {
        "configureFromBallotPackage" => {
            let p: ConfigureParams = params(method, raw)?;
            Ok(serde_json::to_value(svc.configure_from_ballot_package(p.path).await?)?)
        }
        "getConfig" => Ok(serde_json::to_value(svc.config_snapshot()?)?),
        "unconfigureElection" => {
            let p: UnconfigureParams = params(method, raw)?;
            svc.unconfigure_election(p.ignore_backup_requirement).await?;
            done()
        }
        "setPrecinctSelection" => {
            let p: PrecinctSelectionParams = params(method, raw)?;
            svc.set_precinct_selection(p.precinct_selection).await?;
            done()
        }
        "setMarkThresholdOverrides" => {
            let p: MarkThresholdParams = params(method, raw)?;
            svc.set_mark_threshold_overrides(p.mark_threshold_overrides).await?;
            done()
        }
        "setTestMode" => {
            let p: TestModeParams = params(method, raw)?;
            svc.set_test_mode(p.is_test_mode).await?;
            done()
        }
        "setPollsState" => {
            let p: PollsStateParams = params(method, raw)?;
            svc.set_polls_state(p.polls_state)?;
            done()
        }
        "recordBallotBagReplaced" => {
            svc.record_ballot_bag_replaced()?;
            done()
        }
        "getScannerStatus" => Ok(serde_json::to_value(svc.scanner_status()?)?),
        "scanBallot" => {
            svc.scan_ballot().await?;
            done()
        }
        "acceptBallot" => {
            svc.accept_ballot().await?;
            done()
        }
        "returnBallot" => {
            svc.return_ballot().await?;
            done()
        }
        "calibrate" => {
            svc.calibrate().await?;
            done()
        }
        "backupToUsb" => Ok(serde_json::to_value(svc.backup()?)?),
        "exportCastVoteRecords" => {
            let p: ExportParams = params(method, raw)?;
            let written = svc.export_cast_vote_records(&p.path, p.include_images)?;
            Ok(json!({ "count": written }))
        }
        "getAuditLog" => {
            let p: AuditParams = params(method, raw)?;
            Ok(serde_json::to_value(svc.recent_audit_entries(p.limit.unwrap_or(100))?)?)
        }
        other => Err(BallotscanError::Validation(format!("unknown method: {other}"))),
    }
}

/// Answer one raw request line.
pub async fn handle_line(svc: &AppServices, line: &str) -> String {
    let response = match serde_json::from_str::<Request>(line) {
        Ok(request) => {
            debug!(method = %request.method, "rpc request");
            match dispatch(svc, &request.method, request.params).await {
                Ok(result) => Response::Result {
                    id: request.id,
                    result,
                },
                Err(e) => {
                    warn!(method = %request.method, error = %e, "rpc request failed");
                    Response::Error {
                        id: request.id,
                        error: RpcError { message: e.to_string() },
                    }
                }
            }
        }
        Err(e) => Response::Error {
            id: Value::Null,
            error: RpcError {
                message: format!("malformed request: {e}"),
            },
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        json!({ "id": null, "error": { "message": format!("unserializable response: {e}") } }).to_string()
    })
}

/// Serve requests until the input closes.
pub async fn serve<R, W>(svc: &AppServices, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(svc, &line).await;
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    info!("rpc input closed");
    Ok(())
}
