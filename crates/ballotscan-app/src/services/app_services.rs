// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer. Initialises the store, audit trail and precinct
// scanner, and provides the operations the RPC transport exposes.
//
// The ledger and audit log (rusqlite) are `Send` but not `Sync`, so they are
// wrapped in `Arc<Mutex<>>` and shared with the scanner actor. Every call
// holds the lock only for a few short SQLite statements.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use ballotscan_core::config::ScannerConfig;
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::status::ScannerStatus;
use ballotscan_core::types::{MarkThresholds, PollsState, PrecinctSelection};
use ballotscan_device::{MockScanner, ProcessConnector, ScannerConnector};
use ballotscan_interpret::{
    InterpretWorkerPool, Interpreter, InterpreterOptions, find_newest_package, read_ballot_package,
};
use ballotscan_machine::PrecinctScanner;
use ballotscan_store::cvr::export_cast_vote_records;
use ballotscan_store::{AuditEntry, AuditLog, Store};

/// Configuration snapshot returned by `getConfig`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub election_hash: Option<String>,
    pub election_title: Option<String>,
    pub precinct_selection: Option<PrecinctSelection>,
    pub mark_threshold_overrides: Option<MarkThresholds>,
    pub is_test_mode: bool,
    pub polls_state: PollsState,
    pub ballot_count_when_ballot_bag_last_replaced: u64,
    pub scanner_backed_up_at: Option<DateTime<Utc>>,
}

/// What a backup wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub path: PathBuf,
    pub cast_vote_records: usize,
    pub images: usize,
}

/// Shared application services. Cheap to clone.
#[derive(Clone)]
pub struct AppServices {
    store: Arc<Mutex<Store>>,
    audit_log: Arc<Mutex<AuditLog>>,
    scanner: PrecinctScanner,
    config: Arc<ScannerConfig>,
    data_dir: PathBuf,
}

impl AppServices {
    /// Open the databases under `data_dir` and start the scanner. Call once
    /// at startup, inside a tokio runtime.
    pub async fn init(data_dir: PathBuf, config: ScannerConfig) -> Result<Self> {
        info!(path = %data_dir.display(), "initialising scanner services");
        let store = Store::open(data_dir.join("ballotscan.db"))?;
        let audit_log = AuditLog::open(data_dir.join("audit.db"))?;

        let connector: Arc<dyn ScannerConnector> = match &config.driver_command {
            Some(command) => Arc::new(ProcessConnector::new(command.clone())),
            None => {
                warn!("no scanner driver configured, using simulated scanner");
                Arc::new(MockScanner::new())
            }
        };
        Self::start(store, audit_log, connector, config, data_dir).await
    }

    /// Wire already-open components together.
    pub async fn start(
        store: Store,
        audit_log: AuditLog,
        connector: Arc<dyn ScannerConnector>,
        config: ScannerConfig,
        data_dir: PathBuf,
    ) -> Result<Self> {
        let store = Arc::new(Mutex::new(store));
        let audit_log = Arc::new(Mutex::new(audit_log));
        let scanner = PrecinctScanner::spawn(
            connector,
            Arc::clone(&store),
            Some(Arc::clone(&audit_log)),
            config.delays.clone(),
        );
        let services = Self {
            store,
            audit_log,
            scanner,
            config: Arc::new(config),
            data_dir,
        };
        services.refresh_interpreter().await?;
        info!("scanner services initialised");
        Ok(services)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scanner.shutdown().await
    }

    fn store(&self) -> Result<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| BallotscanError::Database("store lock poisoned".into()))
    }

    // -- Election configuration ----------------------------------------------

    /// Load a ballot package: `path`, or the newest zip in the configured
    /// package directory.
    #[instrument(skip(self))]
    pub async fn configure_from_ballot_package(&self, path: Option<PathBuf>) -> Result<ConfigSnapshot> {
        let path = match path {
            Some(path) => path,
            None => {
                let dir = self.config.ballot_package_dir.as_ref().ok_or_else(|| {
                    BallotscanError::Configuration("no ballot package directory configured".into())
                })?;
                find_newest_package(dir)?.ok_or_else(|| {
                    BallotscanError::Package(format!("no ballot package found in {}", dir.display()))
                })?
            }
        };

        {
            let mut store = self.store()?;
            if store.has_election()? {
                return Err(BallotscanError::Configuration(
                    "an election is already configured".into(),
                ));
            }
            let package = read_ballot_package(&path)?;
            store.configure(&package.election_definition, &package.templates)?;
            self.audit(
                "configure",
                true,
                Some(&package.election_definition.election_hash),
            );
        }
        self.refresh_interpreter().await?;
        self.config_snapshot()
    }

    pub fn config_snapshot(&self) -> Result<ConfigSnapshot> {
        let store = self.store()?;
        let definition = store.election_definition()?;
        Ok(ConfigSnapshot {
            election_hash: definition.as_ref().map(|d| d.election_hash.clone()),
            election_title: definition.map(|d| d.election.title),
            precinct_selection: store.precinct_selection()?,
            mark_threshold_overrides: store.mark_threshold_overrides()?,
            is_test_mode: store.is_test_mode()?,
            polls_state: store.polls_state()?,
            ballot_count_when_ballot_bag_last_replaced: store.ballot_count_when_ballot_bag_last_replaced()?,
            scanner_backed_up_at: store.scanner_backed_up_at()?,
        })
    }

    /// Remove the election and every ballot. Refused while counted ballots
    /// have not been backed up, unless `ignore_backup_requirement`.
    #[instrument(skip(self))]
    pub async fn unconfigure_election(&self, ignore_backup_requirement: bool) -> Result<()> {
        {
            let mut store = self.store()?;
            if !ignore_backup_requirement && !store.can_unconfigure()? {
                self.audit("unconfigure", false, Some("backup required"));
                return Err(BallotscanError::Validation(
                    "ballots have not been backed up since the last change".into(),
                ));
            }
            store.unconfigure()?;
        }
        self.audit("unconfigure", true, None);
        self.scanner.set_interpreter(None).await
    }

    pub async fn set_precinct_selection(&self, selection: Option<PrecinctSelection>) -> Result<()> {
        self.store()?.set_precinct_selection(selection.as_ref())?;
        self.audit("set_precinct_selection", true, None);
        self.refresh_interpreter().await
    }

    pub async fn set_mark_threshold_overrides(&self, thresholds: Option<MarkThresholds>) -> Result<()> {
        self.store()?.set_mark_threshold_overrides(thresholds.as_ref())?;
        self.audit("set_mark_threshold_overrides", true, None);
        self.refresh_interpreter().await
    }

    /// Switching modes starts a clean session with the polls closed.
    pub async fn set_test_mode(&self, test_mode: bool) -> Result<()> {
        self.store()?.set_test_mode(test_mode)?;
        self.audit("set_test_mode", true, Some(if test_mode { "test" } else { "official" }));
        self.refresh_interpreter().await
    }

    pub fn set_polls_state(&self, polls_state: PollsState) -> Result<()> {
        self.store()?.set_polls_state(polls_state)?;
        self.audit("set_polls_state", true, Some(polls_state.as_str()));
        Ok(())
    }

    pub fn record_ballot_bag_replaced(&self) -> Result<()> {
        self.store()?.record_ballot_bag_replaced()?;
        self.audit("ballot_bag_replaced", true, None);
        Ok(())
    }

    /// Rebuild the interpreter from the stored configuration and hand it to
    /// the scanner.
    async fn refresh_interpreter(&self) -> Result<()> {
        let pool = self.build_interpreter()?;
        self.scanner.set_interpreter(pool).await
    }

    fn build_interpreter(&self) -> Result<Option<InterpretWorkerPool>> {
        let options = {
            let store = self.store()?;
            let Some(definition) = store.election_definition()? else {
                return Ok(None);
            };
            InterpreterOptions {
                adjudication_reasons: definition.election.precinct_scanner_adjudication_reasons.clone(),
                precinct_selection: store
                    .precinct_selection()?
                    .unwrap_or(PrecinctSelection::AllPrecincts),
                test_mode: store.is_test_mode()?,
                mark_threshold_overrides: store.mark_threshold_overrides()?,
                skip_election_hash_check: store.skip_election_hash_check()?,
                templates: store.templates()?,
                election_definition: definition,
            }
        };
        let output_dir = self.data_dir.join("normalized");
        std::fs::create_dir_all(&output_dir)?;
        let interpreter = Interpreter::new(options)?;
        Ok(Some(InterpretWorkerPool::new(
            interpreter,
            self.config.interpret_workers,
            output_dir,
        )?))
    }

    // -- Scanning -------------------------------------------------------------

    pub fn scanner_status(&self) -> Result<ScannerStatus> {
        let machine = self.scanner.status();
        let store = self.store()?;
        Ok(ScannerStatus {
            state: machine.state,
            ballots_counted: store.ballots_counted()?,
            can_unconfigure: store.can_unconfigure()?,
            error: machine.error,
            interpretation: machine.interpretation,
        })
    }

    /// Scan the sheet in the front tray. Needs an election and open polls.
    pub async fn scan_ballot(&self) -> Result<()> {
        {
            let store = self.store()?;
            if !store.has_election()? {
                return Err(BallotscanError::NoElection);
            }
            let polls_state = store.polls_state()?;
            if polls_state != PollsState::PollsOpen {
                return Err(BallotscanError::Validation(format!(
                    "cannot scan while polls are {polls_state}"
                )));
            }
        }
        self.scanner.scan().await
    }

    pub async fn accept_ballot(&self) -> Result<()> {
        self.scanner.accept().await
    }

    pub async fn return_ballot(&self) -> Result<()> {
        self.scanner.return_ballot().await
    }

    pub async fn calibrate(&self) -> Result<()> {
        self.scanner.calibrate().await
    }

    // -- Export and backup ----------------------------------------------------

    /// Write eligible cast vote records as NDJSON to `path`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn export_cast_vote_records(&self, path: &Path, include_images: bool) -> Result<usize> {
        let store = self.store()?;
        let definition = store.election_definition()?.ok_or(BallotscanError::NoElection)?;
        let out = BufWriter::new(File::create(path)?);
        let written = export_cast_vote_records(
            &store,
            &definition.election,
            &self.config.scanner_id,
            include_images,
            out,
        )?;
        store.set_cvrs_backed_up(Utc::now())?;
        Ok(written)
    }

    /// Snapshot the database, ballot images and cast vote records into a
    /// fresh timestamped directory under the backup root.
    #[instrument(skip(self))]
    pub fn backup(&self) -> Result<BackupSummary> {
        let root = self
            .config
            .backup_dir
            .as_ref()
            .ok_or_else(|| BallotscanError::Configuration("no backup directory configured".into()))?;
        let started = Utc::now();
        let dir = root.join(format!("ballotscan-backup-{}", started.format("%Y%m%dT%H%M%S%.3fZ")));
        let images_dir = dir.join("images");
        std::fs::create_dir_all(&images_dir)?;

        let store = self.store()?;
        let definition = store.election_definition()?.ok_or(BallotscanError::NoElection)?;
        store.backup_to(dir.join("ballotscan.db"))?;

        let mut copied = HashSet::new();
        for result in store.result_sheets()? {
            for page in [&result.sheet.front, &result.sheet.back] {
                for name in [&page.original_filename, &page.normalized_filename] {
                    if copied.contains(name) {
                        continue;
                    }
                    let source = Path::new(name);
                    let Some(file_name) = source.file_name() else {
                        continue;
                    };
                    match std::fs::copy(source, images_dir.join(file_name)) {
                        Ok(_) => {
                            copied.insert(name.clone());
                        }
                        Err(e) => warn!(file = %source.display(), error = %e, "ballot image not backed up"),
                    }
                }
            }
        }

        let out = BufWriter::new(File::create(dir.join("cast-vote-records.jsonl"))?);
        let cast_vote_records = export_cast_vote_records(
            &store,
            &definition.election,
            &self.config.scanner_id,
            false,
            out,
        )?;

        let finished = Utc::now();
        store.set_scanner_backed_up(finished)?;
        store.set_cvrs_backed_up(finished)?;
        drop(store);

        let summary = BackupSummary {
            path: dir,
            cast_vote_records,
            images: copied.len(),
        };
        info!(path = %summary.path.display(), cvrs = cast_vote_records, images = summary.images, "backup written");
        self.audit("backup", true, Some(&summary.path.display().to_string()));
        Ok(summary)
    }

    // -- Audit Trail ----------------------------------------------------------

    /// Record a service-level event against the current scanner state.
    pub fn audit(&self, event: &str, success: bool, detail: Option<&str>) {
        let state = self.scanner.status().state;
        match self.audit_log.lock() {
            Ok(log) => {
                if let Err(e) = log.record(event, state.as_str(), state.as_str(), success, detail) {
                    error!(error = %e, "failed to record audit entry");
                }
            }
            Err(_) => error!("audit log lock poisoned"),
        }
    }

    pub fn recent_audit_entries(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.audit_log
            .lock()
            .map_err(|_| BallotscanError::Database("audit log lock poisoned".into()))?
            .recent_entries(limit)
    }
}
