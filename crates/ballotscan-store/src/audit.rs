// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Scanner event log: append-only SQLite record of state machine transitions
// and operator commands.
//
// Schema:
//   scanner_events(
//     id          INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp   TEXT    NOT NULL,   -- RFC 3339
//     event       TEXT    NOT NULL,   -- event or command kind, e.g. "scan"
//     from_state  TEXT    NOT NULL,
//     to_state    TEXT    NOT NULL,
//     success     INTEGER NOT NULL,   -- 0 = rejected/failed, 1 = applied
//     detail      TEXT                -- interpretation type or error code
//   )
//
// Entries never carry vote content. Callers pass variant names only.

use std::path::Path;

use ballotscan_core::error::BallotscanError;
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS scanner_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL,
    event       TEXT    NOT NULL,
    from_state  TEXT    NOT NULL,
    to_state    TEXT    NOT NULL,
    success     INTEGER NOT NULL,
    detail      TEXT
);";

fn db_err(e: rusqlite::Error) -> BallotscanError {
    BallotscanError::Database(e.to_string())
}

/// A single entry in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub event: String,
    pub from_state: String,
    pub to_state: String,
    pub success: bool,
    pub detail: Option<String>,
}

/// Append-only scanner event log backed by a SQLite database.
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open (or create) the event database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BallotscanError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;").map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("scanner event log opened");
        Ok(Self { conn })
    }

    /// Open an in-memory event log (useful for tests).
    pub fn open_in_memory() -> Result<Self, BallotscanError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory scanner event log opened");
        Ok(Self { conn })
    }

    /// Record one transition or command outcome.
    #[instrument(skip(self, detail), fields(%event, %from_state, %to_state, success))]
    pub fn record(
        &self,
        event: &str,
        from_state: &str,
        to_state: &str,
        success: bool,
        detail: Option<&str>,
    ) -> Result<(), BallotscanError> {
        self.conn
            .execute(
                "INSERT INTO scanner_events (timestamp, event, from_state, to_state, success, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Utc::now().to_rfc3339(),
                    event,
                    from_state,
                    to_state,
                    success as i32,
                    detail
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<AuditEntry>, BallotscanError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, event, from_state, to_state, success, detail
                 FROM scanner_events
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event: row.get(2)?,
                    from_state: row.get(3)?,
                    to_state: row.get(4)?,
                    success: row.get::<_, i32>(5)? != 0,
                    detail: row.get(6)?,
                })
            })
            .map_err(db_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn count(&self) -> Result<u64, BallotscanError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM scanner_events", [], |row| row.get(0))
            .map_err(db_err)
    }
}
