// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ballot ledger backed by SQLite.
//
// Holds the single configured election, its hand-marked templates, and the
// batches and sheets scanned against it. Batch boundaries follow the polls
// state and ballot-bag replacement; every mutation that touches both batches
// and configuration runs in one transaction.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use ballotscan_core::election::ElectionDefinition;
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::interpretation::PageInterpretation;
use ballotscan_core::layout::BallotPageLayout;
use ballotscan_core::types::{
    Batch, BatchId, BatchInfo, MarkThresholds, PollsState, PrecinctSelection, Sheet, SheetId,
    SheetOf, SheetPage,
};

/// SQLite schema.
const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS election (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        election_data TEXT NOT NULL,
        is_test_mode INTEGER NOT NULL DEFAULT 1,
        skip_election_hash_check INTEGER NOT NULL DEFAULT 0,
        precinct_selection TEXT,
        polls_state TEXT NOT NULL DEFAULT 'polls_closed_initial',
        mark_threshold_overrides TEXT,
        ballot_count_when_ballot_bag_last_replaced INTEGER NOT NULL DEFAULT 0,
        scanner_backed_up_at TEXT,
        cvrs_backed_up_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        batch_number INTEGER NOT NULL,
        label TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        error TEXT,
        deleted_at TEXT
    );

    CREATE TABLE IF NOT EXISTS sheets (
        id TEXT PRIMARY KEY,
        batch_id TEXT NOT NULL REFERENCES batches(id),
        front_interpretation TEXT NOT NULL,
        back_interpretation TEXT NOT NULL,
        front_original_filename TEXT NOT NULL UNIQUE,
        back_original_filename TEXT NOT NULL UNIQUE,
        front_normalized_filename TEXT NOT NULL,
        back_normalized_filename TEXT NOT NULL,
        requires_adjudication INTEGER NOT NULL,
        finished_adjudication_at TEXT,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    );

    CREATE TABLE IF NOT EXISTS templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        layout TEXT NOT NULL,
        image BLOB NOT NULL
    );
"#;

const SHEET_COLUMNS: &str = "s.id, s.batch_id, s.front_interpretation, s.back_interpretation,
    s.front_original_filename, s.back_original_filename,
    s.front_normalized_filename, s.back_normalized_filename,
    s.requires_adjudication, s.finished_adjudication_at, s.created_at, s.deleted_at";

/// Live, counted sheets: neither the sheet nor its batch is soft-deleted.
const LIVE_SHEETS: &str = "s.deleted_at IS NULL AND b.deleted_at IS NULL";

/// Progress through the adjudication queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjudicationStatus {
    pub adjudicated: u64,
    pub remaining: u64,
}

/// A sheet eligible for CVR export, with its batch label.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSheet {
    pub sheet: Sheet,
    pub batch_label: String,
}

/// Ballot ledger backed by a SQLite database.
///
/// All methods are synchronous because `rusqlite` does not support async
/// natively. In an async context, wrap calls in `tokio::task::spawn_blocking`
/// or hold the store behind a mutex and keep calls short.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the ledger database at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| BallotscanError::Database(format!("open: {e}")))?;

        // Status reads must not wait on an in-flight sheet insert.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| BallotscanError::Database(format!("WAL pragma: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| BallotscanError::Database(format!("foreign_keys pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| BallotscanError::Database(format!("create tables: {e}")))?;

        info!("ballot store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BallotscanError::Database(format!("open in-memory: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| BallotscanError::Database(format!("foreign_keys pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| BallotscanError::Database(format!("create tables: {e}")))?;

        debug!("in-memory ballot store opened");
        Ok(Self { conn })
    }

    // -- Election configuration -----------------------------------------------

    /// Replace the configured election and its templates. Clears any previous
    /// session.
    #[instrument(skip_all, fields(election_hash = %definition.election_hash, templates = templates.len()))]
    pub fn configure(
        &mut self,
        definition: &ElectionDefinition,
        templates: &[(BallotPageLayout, Vec<u8>)],
    ) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        clear_session(&tx)?;
        tx.execute(
            "INSERT INTO election (id, election_data, created_at) VALUES (1, ?1, ?2)",
            params![definition.election_data, timestamp(Utc::now())],
        )
        .map_err(|e| BallotscanError::Database(format!("insert election: {e}")))?;

        for (layout, image) in templates {
            let layout_json = serde_json::to_string(layout)?;
            tx.execute(
                "INSERT INTO templates (layout, image) VALUES (?1, ?2)",
                params![layout_json, image],
            )
            .map_err(|e| BallotscanError::Database(format!("insert template: {e}")))?;
        }
        tx.commit().map_err(db_err)?;

        info!("election configured");
        Ok(())
    }

    /// Remove the election, its templates and every batch and sheet.
    #[instrument(skip(self))]
    pub fn unconfigure(&mut self) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        clear_session(&tx)?;
        tx.commit().map_err(db_err)?;
        info!("election unconfigured");
        Ok(())
    }

    pub fn has_election(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM election", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// The configured election, re-validated and re-hashed from stored bytes.
    pub fn election_definition(&self) -> Result<Option<ElectionDefinition>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT election_data FROM election", [], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        data.map(|d| {
            ElectionDefinition::from_json(&d)
                .map_err(|e| BallotscanError::Database(format!("stored election is corrupt: {e}")))
        })
        .transpose()
    }

    /// Hand-marked templates stored with the election.
    pub fn templates(&self) -> Result<Vec<(BallotPageLayout, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT layout, image FROM templates ORDER BY id")
            .map_err(|e| BallotscanError::Database(format!("prepare templates: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                let layout_json: String = row.get(0)?;
                let image: Vec<u8> = row.get(1)?;
                let layout: BallotPageLayout = serde_json::from_str(&layout_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
                Ok((layout, image))
            })
            .map_err(|e| BallotscanError::Database(format!("query templates: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BallotscanError::Database(format!("collect templates: {e}")))?;
        Ok(rows)
    }

    pub fn is_test_mode(&self) -> Result<bool> {
        Ok(self.election_column::<i64>("is_test_mode")?.map_or(true, |v| v != 0))
    }

    /// Switch between test and official ballots. Always starts a clean
    /// session.
    pub fn set_test_mode(&mut self, test_mode: bool) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        require_election(&tx, "test mode")?;
        reset_ballots(&tx)?;
        tx.execute(
            "UPDATE election SET is_test_mode = ?1, polls_state = ?2,
             ballot_count_when_ballot_bag_last_replaced = 0",
            params![test_mode as i64, PollsState::PollsClosedInitial.as_str()],
        )
        .map_err(|e| BallotscanError::Database(format!("set test mode: {e}")))?;
        tx.commit().map_err(db_err)?;
        info!(test_mode, "test mode set");
        Ok(())
    }

    pub fn skip_election_hash_check(&self) -> Result<bool> {
        Ok(self
            .election_column::<i64>("skip_election_hash_check")?
            .is_some_and(|v| v != 0))
    }

    pub fn set_skip_election_hash_check(&self, skip: bool) -> Result<()> {
        self.update_election("skip election hash check", "skip_election_hash_check", skip as i64)
    }

    pub fn precinct_selection(&self) -> Result<Option<PrecinctSelection>> {
        self.election_json_column("precinct_selection")
    }

    pub fn set_precinct_selection(&self, selection: Option<&PrecinctSelection>) -> Result<()> {
        let json = selection.map(serde_json::to_string).transpose()?;
        self.update_election("precinct selection", "precinct_selection", json)
    }

    pub fn mark_threshold_overrides(&self) -> Result<Option<MarkThresholds>> {
        self.election_json_column("mark_threshold_overrides")
    }

    pub fn set_mark_threshold_overrides(&self, thresholds: Option<&MarkThresholds>) -> Result<()> {
        let json = thresholds.map(serde_json::to_string).transpose()?;
        self.update_election("mark threshold overrides", "mark_threshold_overrides", json)
    }

    pub fn polls_state(&self) -> Result<PollsState> {
        match self.election_column::<String>("polls_state")? {
            None => Ok(PollsState::PollsClosedInitial),
            Some(raw) => PollsState::parse(&raw).ok_or_else(|| {
                BallotscanError::Database(format!("stored polls state is corrupt: {raw}"))
            }),
        }
    }

    /// Move to a new polls state, opening or finishing the current batch to
    /// match.
    #[instrument(skip(self))]
    pub fn set_polls_state(&mut self, polls_state: PollsState) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        require_election(&tx, "polls state")?;

        match (polls_state == PollsState::PollsOpen, ongoing_batch_id(&tx)?) {
            (true, None) => {
                insert_batch(&tx)?;
            }
            (false, Some(batch_id)) => finish_batch(&tx, batch_id, None)?,
            _ => {}
        }

        tx.execute(
            "UPDATE election SET polls_state = ?1",
            params![polls_state.as_str()],
        )
        .map_err(|e| BallotscanError::Database(format!("set polls state: {e}")))?;
        tx.commit().map_err(db_err)?;

        info!(polls_state = %polls_state, "polls state updated");
        Ok(())
    }

    /// Close the current batch and start a fresh one for the new ballot bag.
    #[instrument(skip(self))]
    pub fn record_ballot_bag_replaced(&mut self) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        require_election(&tx, "ballot bag replacement")?;

        if let Some(batch_id) = ongoing_batch_id(&tx)? {
            finish_batch(&tx, batch_id, None)?;
        }
        insert_batch(&tx)?;

        let counted = count_ballots(&tx)?;
        tx.execute(
            "UPDATE election SET ballot_count_when_ballot_bag_last_replaced = ?1",
            params![counted as i64],
        )
        .map_err(|e| BallotscanError::Database(format!("record ballot bag: {e}")))?;
        tx.commit().map_err(db_err)?;

        info!(counted, "ballot bag replaced");
        Ok(())
    }

    pub fn ballot_count_when_ballot_bag_last_replaced(&self) -> Result<u64> {
        Ok(self
            .election_column::<i64>("ballot_count_when_ballot_bag_last_replaced")?
            .unwrap_or(0) as u64)
    }

    pub fn set_scanner_backed_up(&self, at: DateTime<Utc>) -> Result<()> {
        self.update_election("scanner backup time", "scanner_backed_up_at", timestamp(at))
    }

    pub fn set_cvrs_backed_up(&self, at: DateTime<Utc>) -> Result<()> {
        self.update_election("CVR backup time", "cvrs_backed_up_at", timestamp(at))
    }

    pub fn scanner_backed_up_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.election_column::<String>("scanner_backed_up_at")?
            .map(|raw| parse_timestamp(&raw))
            .transpose()
    }

    // -- Batches --------------------------------------------------------------

    /// Start a batch. Fails while another batch is still open.
    pub fn add_batch(&self) -> Result<BatchId> {
        insert_batch(&self.conn)
    }

    pub fn finish_batch(&self, batch_id: BatchId, error: Option<&str>) -> Result<()> {
        finish_batch(&self.conn, batch_id, error)
    }

    pub fn ongoing_batch_id(&self) -> Result<Option<BatchId>> {
        ongoing_batch_id(&self.conn)
    }

    /// Soft-delete a batch. Its sheets stop counting.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub fn delete_batch(&self, batch_id: BatchId) -> Result<()> {
        let now = timestamp(Utc::now());
        let rows = self
            .conn
            .execute(
                "UPDATE batches SET deleted_at = ?1, ended_at = COALESCE(ended_at, ?1)
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, batch_id.to_string()],
            )
            .map_err(|e| BallotscanError::Database(format!("delete batch: {e}")))?;
        if rows == 0 {
            return Err(BallotscanError::Database(format!("batch {batch_id} not found")));
        }
        info!("batch deleted");
        Ok(())
    }

    pub fn batch(&self, batch_id: BatchId) -> Result<Option<Batch>> {
        self.conn
            .query_row(
                "SELECT id, label, started_at, ended_at, error, deleted_at FROM batches WHERE id = ?1",
                params![batch_id.to_string()],
                row_to_batch,
            )
            .optional()
            .map_err(|e| BallotscanError::Database(format!("get batch: {e}")))
    }

    /// Live batches with their live sheet counts, oldest first.
    pub fn batch_status(&self) -> Result<Vec<BatchInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT b.id, b.label, b.started_at, b.ended_at, b.error, b.deleted_at,
                        (SELECT COUNT(*) FROM sheets s WHERE s.batch_id = b.id AND s.deleted_at IS NULL)
                 FROM batches b WHERE b.deleted_at IS NULL ORDER BY b.batch_number ASC",
            )
            .map_err(|e| BallotscanError::Database(format!("prepare batch_status: {e}")))?;
        let batches = stmt
            .query_map([], |row| {
                let batch = row_to_batch(row)?;
                let count: i64 = row.get(6)?;
                Ok(BatchInfo {
                    id: batch.id,
                    label: batch.label,
                    started_at: batch.started_at,
                    ended_at: batch.ended_at,
                    error: batch.error,
                    count: count as u64,
                })
            })
            .map_err(|e| BallotscanError::Database(format!("query batch_status: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BallotscanError::Database(format!("collect rows: {e}")))?;
        Ok(batches)
    }

    // -- Sheets ---------------------------------------------------------------

    /// Record an interpreted sheet.
    ///
    /// Idempotent on the front page's original filename: a retried insert of
    /// the same scan returns the id already stored.
    #[instrument(skip(self, pages), fields(sheet_id = %sheet_id, batch_id = %batch_id))]
    pub fn add_sheet(
        &self,
        sheet_id: SheetId,
        batch_id: BatchId,
        pages: &SheetOf<SheetPage>,
        requires_adjudication: bool,
    ) -> Result<SheetId> {
        let now = timestamp(Utc::now());
        // Hand-marked sheets whose pages each came back clean are
        // auto-finished even when the pairing itself is flagged.
        let auto_finished = both_pages_clean_hmpb(pages);
        let finished_adjudication_at = auto_finished.then(|| now.clone());

        let result = self.conn.execute(
            "INSERT INTO sheets (id, batch_id, front_interpretation, back_interpretation,
             front_original_filename, back_original_filename,
             front_normalized_filename, back_normalized_filename,
             requires_adjudication, finished_adjudication_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sheet_id.to_string(),
                batch_id.to_string(),
                serde_json::to_string(&pages.front.interpretation)?,
                serde_json::to_string(&pages.back.interpretation)?,
                pages.front.original_filename,
                pages.back.original_filename,
                pages.front.normalized_filename,
                pages.back.normalized_filename,
                requires_adjudication as i64,
                finished_adjudication_at,
                now,
            ],
        );

        match result {
            Ok(_) => {
                info!(requires_adjudication, "sheet added");
                Ok(sheet_id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let existing: Option<String> = self
                    .conn
                    .query_row(
                        "SELECT id FROM sheets WHERE front_original_filename = ?1",
                        params![pages.front.original_filename],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                match existing {
                    Some(id) => {
                        warn!(existing = %id, "sheet already stored, returning existing id");
                        parse_sheet_id(&id)
                    }
                    None => Err(BallotscanError::Database(format!(
                        "insert sheet {sheet_id}: constraint violation: {err}"
                    ))),
                }
            }
            Err(e) => Err(BallotscanError::Database(format!("insert sheet: {e}"))),
        }
    }

    pub fn sheet(&self, sheet_id: SheetId) -> Result<Option<Sheet>> {
        let sql = format!(
            "SELECT {SHEET_COLUMNS} FROM sheets s WHERE s.id = ?1"
        );
        self.conn
            .query_row(&sql, params![sheet_id.to_string()], row_to_sheet)
            .optional()
            .map_err(|e| BallotscanError::Database(format!("get sheet: {e}")))
    }

    /// Soft-delete a sheet.
    #[instrument(skip(self), fields(sheet_id = %sheet_id))]
    pub fn delete_sheet(&self, sheet_id: SheetId) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sheets SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![timestamp(Utc::now()), sheet_id.to_string()],
            )
            .map_err(|e| BallotscanError::Database(format!("delete sheet: {e}")))?;
        if rows == 0 {
            return Err(BallotscanError::Database(format!("sheet {sheet_id} not found")));
        }
        debug!("sheet deleted");
        Ok(())
    }

    /// Mark a sheet's adjudication as finished. Only ever succeeds once.
    #[instrument(skip(self), fields(sheet_id = %sheet_id))]
    pub fn adjudicate_sheet(&self, sheet_id: SheetId) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE sheets SET finished_adjudication_at = ?1
                 WHERE id = ?2 AND requires_adjudication = 1
                   AND finished_adjudication_at IS NULL AND deleted_at IS NULL",
                params![timestamp(Utc::now()), sheet_id.to_string()],
            )
            .map_err(|e| BallotscanError::Database(format!("adjudicate sheet: {e}")))?;
        if rows == 0 {
            return Err(BallotscanError::Validation(format!(
                "sheet {sheet_id} is not awaiting adjudication"
            )));
        }
        info!("sheet adjudicated");
        Ok(())
    }

    /// Oldest live sheet still awaiting adjudication.
    pub fn next_adjudication_sheet(&self) -> Result<Option<Sheet>> {
        let sql = format!(
            "SELECT {SHEET_COLUMNS} FROM sheets s JOIN batches b ON s.batch_id = b.id
             WHERE {LIVE_SHEETS} AND s.requires_adjudication = 1
               AND s.finished_adjudication_at IS NULL
             ORDER BY s.created_at ASC LIMIT 1"
        );
        self.conn
            .query_row(&sql, [], row_to_sheet)
            .optional()
            .map_err(|e| BallotscanError::Database(format!("next adjudication sheet: {e}")))
    }

    pub fn adjudication_status(&self) -> Result<AdjudicationStatus> {
        let sql = format!(
            "SELECT
                COALESCE(SUM(CASE WHEN s.finished_adjudication_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN s.finished_adjudication_at IS NULL THEN 1 ELSE 0 END), 0)
             FROM sheets s JOIN batches b ON s.batch_id = b.id
             WHERE {LIVE_SHEETS} AND s.requires_adjudication = 1"
        );
        let (adjudicated, remaining): (i64, i64) = self
            .conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| BallotscanError::Database(format!("adjudication status: {e}")))?;
        Ok(AdjudicationStatus {
            adjudicated: adjudicated as u64,
            remaining: remaining as u64,
        })
    }

    /// Number of live sheets in live batches.
    pub fn ballots_counted(&self) -> Result<u64> {
        count_ballots(&self.conn)
    }

    /// Sheets that belong in a CVR export, oldest first.
    pub fn result_sheets(&self) -> Result<Vec<ResultSheet>> {
        let sql = format!(
            "SELECT {SHEET_COLUMNS}, b.label FROM sheets s JOIN batches b ON s.batch_id = b.id
             WHERE {LIVE_SHEETS}
               AND (s.requires_adjudication = 0 OR s.finished_adjudication_at IS NOT NULL)
             ORDER BY s.created_at ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| BallotscanError::Database(format!("prepare result_sheets: {e}")))?;
        let sheets = stmt
            .query_map([], |row| {
                Ok(ResultSheet {
                    sheet: row_to_sheet(row)?,
                    batch_label: row.get(12)?,
                })
            })
            .map_err(|e| BallotscanError::Database(format!("query result_sheets: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BallotscanError::Database(format!("collect rows: {e}")))?;
        Ok(sheets)
    }

    /// Whether unconfiguring now would lose un-backed-up results.
    ///
    /// Always true in test mode or with nothing counted. Otherwise the last
    /// full backup must be no older than the last CVR-affecting change.
    pub fn can_unconfigure(&self) -> Result<bool> {
        if self.is_test_mode()? || self.ballots_counted()? == 0 {
            return Ok(true);
        }
        let Some(backed_up_at) = self.scanner_backed_up_at()? else {
            return Ok(false);
        };

        let latest: Vec<Option<String>> = [
            "SELECT MAX(created_at) FROM sheets",
            "SELECT MAX(deleted_at) FROM sheets",
            "SELECT MAX(b.deleted_at) FROM batches b
             WHERE EXISTS (SELECT 1 FROM sheets s WHERE s.batch_id = b.id)",
        ]
        .iter()
        .map(|sql| self.conn.query_row(sql, [], |row| row.get(0)))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| BallotscanError::Database(format!("can unconfigure: {e}")))?;

        let mut last_change: Option<DateTime<Utc>> = None;
        for raw in latest.into_iter().flatten() {
            let at = parse_timestamp(&raw)?;
            last_change = Some(last_change.map_or(at, |prev| prev.max(at)));
        }
        Ok(last_change.is_none_or(|at| backed_up_at >= at))
    }

    /// Write a consistent snapshot of the database to `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn backup_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let target = path.as_ref().to_string_lossy().into_owned();
        self.conn
            .execute("VACUUM INTO ?1", params![target])
            .map_err(|e| BallotscanError::Database(format!("backup: {e}")))?;
        info!("database snapshot written");
        Ok(())
    }

    // -- Helpers --------------------------------------------------------------

    fn election_column<T: rusqlite::types::FromSql>(&self, column: &str) -> Result<Option<T>> {
        let sql = format!("SELECT {column} FROM election");
        let value: Option<Option<T>> = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()
            .map_err(|e| BallotscanError::Database(format!("read {column}: {e}")))?;
        Ok(value.flatten())
    }

    fn election_json_column<T: serde::de::DeserializeOwned>(&self, column: &str) -> Result<Option<T>> {
        self.election_column::<String>(column)?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    BallotscanError::Database(format!("stored {column} is corrupt: {e}"))
                })
            })
            .transpose()
    }

    fn update_election(
        &self,
        what: &str,
        column: &str,
        value: impl rusqlite::ToSql,
    ) -> Result<()> {
        require_election(&self.conn, what)?;
        let sql = format!("UPDATE election SET {column} = ?1");
        self.conn
            .execute(&sql, params![value])
            .map_err(|e| BallotscanError::Database(format!("set {column}: {e}")))?;
        debug!(column, "election setting updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statement helpers shared by plain and transactional callers
// ---------------------------------------------------------------------------

fn db_err(e: rusqlite::Error) -> BallotscanError {
    BallotscanError::Database(e.to_string())
}

fn require_election(conn: &Connection, what: &str) -> Result<()> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM election", [], |row| row.get(0))
        .map_err(db_err)?;
    if count == 0 {
        return Err(BallotscanError::Configuration(format!(
            "Cannot set {what} without an election."
        )));
    }
    Ok(())
}

fn clear_session(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM sheets; DELETE FROM batches; DELETE FROM templates; DELETE FROM election;",
    )
    .map_err(|e| BallotscanError::Database(format!("clear session: {e}")))
}

fn reset_ballots(conn: &Connection) -> Result<()> {
    conn.execute_batch("DELETE FROM sheets; DELETE FROM batches;")
        .map_err(|e| BallotscanError::Database(format!("reset ballots: {e}")))
}

fn ongoing_batch_id(conn: &Connection) -> Result<Option<BatchId>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM batches WHERE ended_at IS NULL AND deleted_at IS NULL
             ORDER BY batch_number DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| BallotscanError::Database(format!("ongoing batch: {e}")))?;
    id.map(|raw| parse_batch_id(&raw)).transpose()
}

fn insert_batch(conn: &Connection) -> Result<BatchId> {
    if let Some(open) = ongoing_batch_id(conn)? {
        return Err(BallotscanError::Validation(format!(
            "cannot start a batch while batch {open} is still open"
        )));
    }
    let number: i64 = conn
        .query_row("SELECT COUNT(*) + 1 FROM batches", [], |row| row.get(0))
        .map_err(db_err)?;
    let id = BatchId::new();
    let label = format!("Batch {number}");
    conn.execute(
        "INSERT INTO batches (id, batch_number, label, started_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), number, label, timestamp(Utc::now())],
    )
    .map_err(|e| BallotscanError::Database(format!("insert batch: {e}")))?;
    info!(batch_id = %id, %label, "batch started");
    Ok(id)
}

fn finish_batch(conn: &Connection, batch_id: BatchId, error: Option<&str>) -> Result<()> {
    let rows = conn
        .execute(
            "UPDATE batches SET ended_at = ?1, error = ?2 WHERE id = ?3 AND ended_at IS NULL",
            params![timestamp(Utc::now()), error, batch_id.to_string()],
        )
        .map_err(|e| BallotscanError::Database(format!("finish batch: {e}")))?;
    if rows == 0 {
        return Err(BallotscanError::Database(format!(
            "batch {batch_id} is not open"
        )));
    }
    info!(batch_id = %batch_id, "batch finished");
    Ok(())
}

fn count_ballots(conn: &Connection) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM sheets s JOIN batches b ON s.batch_id = b.id WHERE {LIVE_SHEETS}"
    );
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|e| BallotscanError::Database(format!("count ballots: {e}")))?;
    Ok(count as u64)
}

fn both_pages_clean_hmpb(pages: &SheetOf<SheetPage>) -> bool {
    pages.iter().all(|page| match &page.interpretation {
        PageInterpretation::InterpretedHmpbPage {
            adjudication_info, ..
        } => !adjudication_info.requires_adjudication,
        _ => false,
    })
}

/// Fixed-width RFC 3339 so lexical and chronological order agree.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BallotscanError::Database(format!("bad timestamp {raw}: {e}")))
}

fn parse_sheet_id(raw: &str) -> Result<SheetId> {
    uuid::Uuid::parse_str(raw)
        .map(SheetId)
        .map_err(|e| BallotscanError::Database(format!("bad sheet id {raw}: {e}")))
}

fn parse_batch_id(raw: &str) -> Result<BatchId> {
    uuid::Uuid::parse_str(raw)
        .map(BatchId)
        .map_err(|e| BallotscanError::Database(format!("bad batch id {raw}: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn column_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<uuid::Uuid> {
    let raw: String = row.get(idx)?;
    uuid::Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn column_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn column_required_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    column_time(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "timestamp".into(),
        Type::Null,
    ))
}

fn column_interpretation(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<PageInterpretation> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

/// Map a row selected with `SHEET_COLUMNS`.
fn row_to_sheet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sheet> {
    Ok(Sheet {
        id: SheetId(column_uuid(row, 0)?),
        batch_id: BatchId(column_uuid(row, 1)?),
        front: SheetPage {
            interpretation: column_interpretation(row, 2)?,
            original_filename: row.get(4)?,
            normalized_filename: row.get(6)?,
        },
        back: SheetPage {
            interpretation: column_interpretation(row, 3)?,
            original_filename: row.get(5)?,
            normalized_filename: row.get(7)?,
        },
        requires_adjudication: row.get::<_, i64>(8)? != 0,
        finished_adjudication_at: column_time(row, 9)?,
        created_at: column_required_time(row, 10)?,
        deleted_at: column_time(row, 11)?,
    })
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: BatchId(column_uuid(row, 0)?),
        label: row.get(1)?,
        started_at: column_required_time(row, 2)?,
        ended_at: column_time(row, 3)?,
        error: row.get(4)?,
        deleted_at: column_time(row, 5)?,
    })
}
