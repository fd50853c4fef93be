// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Actor that runs the scanner state machine.
//
// One task owns the `ScannerMachine`. Commands arrive over an mpsc channel;
// effects run as spawned tasks (blocking device calls under `spawn_blocking`)
// and post their completions back to the same channel. Status is published on
// a watch channel after every message.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use ballotscan_core::config::Delays;
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::status::ScannerState;
use ballotscan_device::{DeviceError, DeviceResult, ScannerClient, ScannerConnector};
use ballotscan_interpret::{InterpretResponse, InterpretWorkerPool};
use ballotscan_store::{AuditLog, Store};

use crate::fsm::{Command, CommandError, Effect, Event, MachineStatus, ScannerMachine};

const CHANNEL_CAPACITY: usize = 64;

enum Message {
    Command {
        command: Command,
        reply: oneshot::Sender<std::result::Result<(), CommandError>>,
    },
    Calibrate {
        reply: oneshot::Sender<Result<()>>,
    },
    SetInterpreter(Option<InterpretWorkerPool>),
    Connected {
        epoch: u64,
        result: DeviceResult<Arc<dyn ScannerClient>>,
    },
    Event(Event),
    Shutdown,
}

/// Handle on a running precinct scanner. Cloning shares the same actor; the
/// actor stops when the last handle is dropped.
#[derive(Clone)]
pub struct PrecinctScanner {
    tx: mpsc::Sender<Message>,
    status: watch::Receiver<MachineStatus>,
    calibrate_timeout: Duration,
}

impl PrecinctScanner {
    /// Start the actor on the current tokio runtime and begin connecting.
    ///
    /// Accepted and returned sheets are recorded in `store`; transitions and
    /// commands go to `audit` when given.
    pub fn spawn(
        connector: Arc<dyn ScannerConnector>,
        store: Arc<Mutex<Store>>,
        audit: Option<Arc<Mutex<AuditLog>>>,
        delays: Delays,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let machine = ScannerMachine::new(delays.clone());
        let (status_tx, status_rx) = watch::channel(machine.status());
        let actor = Actor {
            machine,
            connector,
            client: None,
            interpreter: None,
            store,
            audit,
            delays: delays.clone(),
            status: status_tx,
            pending_calibration: None,
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            status: status_rx,
            calibrate_timeout: delays.calibrate_command_timeout,
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineStatus> {
        self.status.clone()
    }

    pub async fn scan(&self) -> Result<()> {
        self.command(Command::Scan).await
    }

    pub async fn accept(&self) -> Result<()> {
        self.command(Command::Accept).await
    }

    pub async fn return_ballot(&self) -> Result<()> {
        self.command(Command::Return).await
    }

    /// Calibrate the sensors. Only allowed with no paper; waits for the
    /// device to finish.
    pub async fn calibrate(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Calibrate { reply }).await?;
        match tokio::time::timeout(self.calibrate_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BallotscanError::StateMachine(
                "calibration abandoned".into(),
            )),
            Err(_) => Err(BallotscanError::Device("calibration timed out".into())),
        }
    }

    /// Install (or remove) the interpreter used for scanned sheets. Takes
    /// effect from the next sheet.
    pub async fn set_interpreter(&self, interpreter: Option<InterpretWorkerPool>) -> Result<()> {
        self.send(Message::SetInterpreter(interpreter)).await
    }

    /// Stop the actor and close the device.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown).await
    }

    async fn command(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Command { command, reply }).await?;
        let result = rx
            .await
            .map_err(|_| BallotscanError::StateMachine("scanner stopped".into()))?;
        result.map_err(BallotscanError::from)
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| BallotscanError::StateMachine("scanner stopped".into()))
    }
}

struct Actor {
    machine: ScannerMachine,
    connector: Arc<dyn ScannerConnector>,
    client: Option<Arc<dyn ScannerClient>>,
    interpreter: Option<InterpretWorkerPool>,
    store: Arc<Mutex<Store>>,
    audit: Option<Arc<Mutex<AuditLog>>>,
    delays: Delays,
    status: watch::Sender<MachineStatus>,
    pending_calibration: Option<oneshot::Sender<Result<()>>>,
    /// Weak so effect tasks and timers never keep the actor alive.
    tx: mpsc::WeakSender<Message>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        info!("precinct scanner started");
        let from = self.machine.status().state;
        let effects = self.machine.start();
        self.transitioned("start", from);
        self.apply(effects);

        while let Some(message) = rx.recv().await {
            match message {
                Message::Command { command, reply } => {
                    let result = self.command(command);
                    let _ = reply.send(result);
                }
                Message::Calibrate { reply } => match self.command(Command::Calibrate) {
                    Ok(()) => self.pending_calibration = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                },
                Message::SetInterpreter(interpreter) => {
                    info!(configured = interpreter.is_some(), "interpreter updated");
                    self.interpreter = interpreter;
                }
                Message::Connected { epoch, result } => self.on_connected(epoch, result),
                Message::Event(event) => self.on_event(event),
                Message::Shutdown => break,
            }
            self.status.send_replace(self.machine.status());
        }

        if let Some(client) = self.client.take() {
            let _ = tokio::task::spawn_blocking(move || client.close()).await;
        }
        info!("precinct scanner stopped");
    }

    fn command(&mut self, command: Command) -> std::result::Result<(), CommandError> {
        let from = self.machine.status().state;
        let result = self.machine.command(command);
        let to = self.machine.status().state;
        let event = format!("command_{}", command.as_str());
        match &result {
            Ok(_) => info!(command = command.as_str(), %from, %to, "command accepted"),
            Err(e) => warn!(command = command.as_str(), %from, "{e}"),
        }
        self.audit(&event, from, to, result.is_ok(), None);
        let effects = result?;
        self.apply(effects);
        Ok(())
    }

    fn on_connected(&mut self, epoch: u64, result: DeviceResult<Arc<dyn ScannerClient>>) {
        let result = match result {
            Ok(client) if self.machine.is_current(epoch) => {
                self.client = Some(client);
                Ok(())
            }
            Ok(client) => {
                debug!(epoch, "closing stale connection");
                drop(tokio::task::spawn_blocking(move || client.close()));
                return;
            }
            Err(e) => Err(e),
        };
        self.on_event(Event::Connected { epoch, result });
    }

    fn on_event(&mut self, event: Event) {
        let kind = event.kind();
        debug!(event = kind, epoch = event.epoch(), "scanner event");
        let from = self.machine.status().state;
        let effects = self.machine.handle(event);
        self.transitioned(kind, from);
        self.apply(effects);
    }

    /// Audit a change in the reported state.
    fn transitioned(&self, trigger: &str, from: ScannerState) {
        let status = self.machine.status();
        if status.state == from {
            return;
        }
        let detail = status
            .interpretation
            .as_ref()
            .map(|i| i.type_name())
            .or(status.error.map(|e| e.as_str()));
        self.audit(trigger, from, status.state, true, detail);
    }

    fn audit(&self, event: &str, from: ScannerState, to: ScannerState, success: bool, detail: Option<&str>) {
        let Some(audit) = &self.audit else {
            return;
        };
        match audit.lock() {
            Ok(log) => {
                if let Err(e) = log.record(event, from.as_str(), to.as_str(), success, detail) {
                    error!(error = %e, "failed to record audit entry");
                }
            }
            Err(_) => error!("audit log lock poisoned"),
        }
    }

    // -- Effects --------------------------------------------------------------

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply_one(effect);
        }
    }

    fn apply_one(&mut self, effect: Effect) {
        match effect {
            Effect::Connect { epoch } => {
                let connector = Arc::clone(&self.connector);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || connector.connect())
                        .await
                        .unwrap_or_else(|e| Err(join_error(e)));
                    notify(&tx, Message::Connected { epoch, result }).await;
                });
            }
            Effect::Close { epoch } => {
                self.device_call(Ok(()), |c| c.close(), move |result| Event::Closed { epoch, result })
            }
            Effect::Kill { epoch } => {
                self.device_call(Ok(()), |c| c.kill(), move |result| Event::Killed { epoch, result })
            }
            Effect::PollPaperStatus { epoch, after } => self.poll(epoch, after),
            Effect::Scan { epoch } => self.device_call(
                Err(DeviceError::Disconnected),
                |c| c.scan(),
                move |result| Event::Scanned { epoch, result },
            ),
            Effect::Accept { epoch } => self.device_call(
                Err(DeviceError::Disconnected),
                |c| c.accept(),
                move |result| Event::Accepted { epoch, result },
            ),
            Effect::Reject { epoch, hold } => self.device_call(
                Err(DeviceError::Disconnected),
                move |c| c.reject(hold),
                move |result| Event::Rejected { epoch, result },
            ),
            Effect::Calibrate { epoch } => self.device_call(
                Err(DeviceError::Disconnected),
                |c| c.calibrate(),
                move |result| Event::Calibrated { epoch, result },
            ),
            Effect::Interpret { epoch, request } => {
                let interpreter = self.interpreter.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = match interpreter {
                        Some(pool) => pool.interpret(request).await.map_err(|e| e.to_string()),
                        None => Err("no interpreter configured".to_owned()),
                    };
                    notify(&tx, Message::Event(Event::Interpreted { epoch, result })).await;
                });
            }
            Effect::StartTimer { epoch, timer, after } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    notify(&tx, Message::Event(Event::TimerFired { epoch, timer })).await;
                });
            }
            Effect::RecordAccepted(response) => self.record_sheet(&response, true),
            Effect::RecordRejected(response) => self.record_sheet(&response, false),
            Effect::CalibrationFinished(result) => {
                if let Some(reply) = self.pending_calibration.take() {
                    let _ = reply.send(result.map_err(BallotscanError::Device));
                }
            }
        }
    }

    /// Run a blocking device call against the current client. `idle` is the
    /// result when there is no client.
    fn device_call<T, F, W>(&self, idle: DeviceResult<T>, call: F, wrap: W)
    where
        T: Send + 'static,
        F: FnOnce(&dyn ScannerClient) -> DeviceResult<T> + Send + 'static,
        W: FnOnce(DeviceResult<T>) -> Event + Send + 'static,
    {
        let client = self.client.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match client {
                Some(client) => tokio::task::spawn_blocking(move || call(&*client))
                    .await
                    .unwrap_or_else(|e| Err(join_error(e))),
                None => idle,
            };
            notify(&tx, Message::Event(wrap(result))).await;
        });
    }

    /// Poll after `after`; a driver that does not answer within the polling
    /// timeout is reported as timed out.
    fn poll(&self, epoch: u64, after: Duration) {
        let client = self.client.clone();
        let tx = self.tx.clone();
        let timeout = self.delays.paper_status_polling_timeout;
        tokio::spawn(async move {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
            }
            let event = match client {
                Some(client) => {
                    let call = tokio::task::spawn_blocking(move || client.paper_status());
                    match tokio::time::timeout(timeout, call).await {
                        Ok(joined) => Event::PaperStatus {
                            epoch,
                            result: joined.unwrap_or_else(|e| Err(join_error(e))),
                        },
                        Err(_) => Event::PaperStatusTimedOut { epoch },
                    }
                }
                None => Event::PaperStatus {
                    epoch,
                    result: Err(DeviceError::Disconnected),
                },
            };
            notify(&tx, Message::Event(event)).await;
        });
    }

    /// Persist an accepted sheet, or a returned/rejected one as deleted.
    fn record_sheet(&self, response: &InterpretResponse, accepted: bool) {
        let state = self.machine.status().state;
        let outcome = self.store_sheet(response, accepted);
        let event = if accepted { "record_accepted" } else { "record_rejected" };
        match outcome {
            Ok(()) => info!(
                sheet_id = %response.sheet_id,
                accepted,
                interpretation = response.interpretation.type_name(),
                "sheet recorded"
            ),
            Err(e) => {
                error!(sheet_id = %response.sheet_id, error = %e, "failed to record sheet");
                self.audit(event, state, state, false, Some(&e.to_string()));
            }
        }
    }

    fn store_sheet(&self, response: &InterpretResponse, accepted: bool) -> Result<()> {
        let store = self
            .store
            .lock()
            .map_err(|_| BallotscanError::Database("store lock poisoned".into()))?;
        let batch_id = store
            .ongoing_batch_id()?
            .ok_or_else(|| BallotscanError::Database("no ongoing batch, polls are not open".into()))?;
        let sheet_id = store.add_sheet(
            response.sheet_id,
            batch_id,
            &response.pages,
            response.requires_adjudication,
        )?;
        if !accepted {
            store.delete_sheet(sheet_id)?;
        }
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> DeviceError {
    DeviceError::Io(format!("device task failed: {e}"))
}

async fn notify(tx: &mpsc::WeakSender<Message>, message: Message) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use ballotscan_core::interpretation::SheetInterpretation;
    use ballotscan_core::status::ScannerErrorType;
    use ballotscan_core::types::{PollsState, SheetOf};
    use ballotscan_device::MockScanner;
    use ballotscan_interpret::Interpreter;
    use ballotscan_interpret::interpreter::test_support::{options, write_bmd_sheet, write_hmpb_sheet};
    use ballotscan_interpret::qr::fixtures::election;

    use super::*;

    struct Harness {
        dir: tempfile::TempDir,
        device: MockScanner,
        store: Arc<Mutex<Store>>,
        audit: Arc<Mutex<AuditLog>>,
        scanner: PrecinctScanner,
    }

    impl Harness {
        async fn start() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut store = Store::open_in_memory().expect("store");
            store
                .configure(&election(), &options(true).templates)
                .expect("configure");
            store.set_test_mode(true).expect("test mode");
            store.set_polls_state(PollsState::PollsOpen).expect("open polls");
            let store = Arc::new(Mutex::new(store));
            let audit = Arc::new(Mutex::new(AuditLog::open_in_memory().expect("audit")));

            let device = MockScanner::new();
            let scanner = PrecinctScanner::spawn(
                Arc::new(device.clone()),
                Arc::clone(&store),
                Some(Arc::clone(&audit)),
                Delays::for_tests(),
            );
            let interpreter = Interpreter::new(options(true)).expect("interpreter");
            let pool = InterpretWorkerPool::new(interpreter, 2, dir.path()).expect("pool");
            scanner.set_interpreter(Some(pool)).await.expect("set interpreter");

            let harness = Self {
                dir,
                device,
                store,
                audit,
                scanner,
            };
            harness.wait_for(ScannerState::NoPaper).await;
            harness
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        async fn wait_for(&self, state: ScannerState) -> MachineStatus {
            let mut rx = self.scanner.subscribe();
            let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {state}, at {}", self.scanner.status().state))
                .expect("scanner running");
            status.clone()
        }

        fn counted(&self) -> u64 {
            self.store.lock().expect("store").ballots_counted().expect("count")
        }

        async fn insert(&self, images: SheetOf<PathBuf>) {
            self.device.load_sheet(images);
            self.wait_for(ScannerState::ReadyToScan).await;
            self.scanner.scan().await.expect("scan");
        }
    }

    #[tokio::test]
    async fn machine_printed_ballot_is_counted_once() {
        let h = Harness::start().await;
        let alice: &[&str] = &["alice"];
        let images = write_bmd_sheet(h.path(), "bmd", &[("mayor", alice)], true);
        h.insert(images).await;

        let status = h.wait_for(ScannerState::ReadyToAccept).await;
        assert_eq!(status.interpretation, Some(SheetInterpretation::ValidSheet));
        assert_eq!(h.counted(), 0);

        h.scanner.accept().await.expect("accept");
        h.wait_for(ScannerState::Accepted).await;
        assert_eq!(h.counted(), 1);
        h.wait_for(ScannerState::NoPaper).await;
        assert_eq!(h.counted(), 1);
        assert_eq!(h.device.ballot_box().len(), 1);

        let entries = h.audit.lock().expect("audit").recent_entries(100).expect("entries");
        assert!(entries.iter().any(|e| e.event == "command_accept" && e.success));
        assert!(entries.iter().any(|e| e.to_state == "ready_to_accept"
            && e.detail.as_deref() == Some("ValidSheet")));
        for entry in &entries {
            let detail = entry.detail.as_deref().unwrap_or_default();
            assert!(!detail.contains("alice"), "vote leaked into audit: {detail}");
            assert!(!detail.contains("mayor"), "contest leaked into audit: {detail}");
        }
    }

    #[tokio::test]
    async fn blank_hand_marked_ballot_is_returned_uncounted() {
        let h = Harness::start().await;
        let images = write_hmpb_sheet(h.path(), "blank", &[], true);
        h.insert(images).await;

        let status = h.wait_for(ScannerState::NeedsReview).await;
        assert!(matches!(
            status.interpretation,
            Some(SheetInterpretation::NeedsReviewSheet { .. })
        ));
        h.scanner.return_ballot().await.expect("return");
        h.wait_for(ScannerState::Returned).await;
        assert_eq!(h.counted(), 0);
        assert!(h.device.ballot_box().is_empty());

        h.device.remove_front_sheet().expect("voter takes ballot");
        h.wait_for(ScannerState::NoPaper).await;
        assert_eq!(h.counted(), 0);
    }

    #[tokio::test]
    async fn commands_out_of_turn_are_rejected() {
        let h = Harness::start().await;
        let err = h.scanner.accept().await.expect_err("nothing to accept");
        assert_eq!(
            err.to_string(),
            "accept is not allowed while the scanner is no_paper"
        );
        assert!(h.scanner.scan().await.is_err());
        assert_eq!(h.scanner.status().state, ScannerState::NoPaper);

        let entries = h.audit.lock().expect("audit").recent_entries(10).expect("entries");
        assert!(entries.iter().any(|e| e.event == "command_accept" && !e.success));
    }

    #[tokio::test]
    async fn jam_clears_when_paper_is_removed() {
        let h = Harness::start().await;
        h.device.jam();
        h.wait_for(ScannerState::Jammed).await;
        h.device.clear_jam();
        h.wait_for(ScannerState::NoPaper).await;
    }

    #[tokio::test]
    async fn unplugged_scanner_reconnects() {
        let h = Harness::start().await;
        h.device.unplug();
        h.wait_for(ScannerState::Disconnected).await;
        h.device.plug_in();
        h.wait_for(ScannerState::NoPaper).await;
    }

    #[tokio::test]
    async fn hung_driver_is_killed_and_reconnected() {
        let h = Harness::start().await;
        let connects = h.device.counters().connects;
        h.device.freeze();

        let status = h.wait_for(ScannerState::RecoveringFromError).await;
        assert_eq!(status.error, Some(ScannerErrorType::PaperStatusTimedOut));
        h.wait_for(ScannerState::NoPaper).await;

        let counters = h.device.counters();
        assert!(counters.kills >= 1);
        assert!(counters.connects > connects);
    }

    #[tokio::test]
    async fn failed_kill_is_unrecoverable() {
        let h = Harness::start().await;
        h.device.set_kill_fails(true);
        h.device.freeze();
        let status = h.wait_for(ScannerState::UnrecoverableError).await;
        assert_eq!(status.error, Some(ScannerErrorType::DeviceError));
        assert!(h.scanner.calibrate().await.is_err());

        // Release the hung driver threads before the runtime shuts down.
        h.device.set_kill_fails(false);
        h.device.unfreeze();
    }

    #[tokio::test]
    async fn calibration_reports_device_outcome() {
        let h = Harness::start().await;
        h.scanner.calibrate().await.expect("calibrate");
        h.wait_for(ScannerState::NoPaper).await;

        h.device
            .fail_next_calibrate(DeviceError::Command("no calibration sheet".into()));
        let err = h.scanner.calibrate().await.expect_err("calibration fails");
        assert!(err.to_string().contains("no calibration sheet"));
        h.wait_for(ScannerState::NoPaper).await;
        assert_eq!(h.device.counters().calibrations, 2);
    }

    #[tokio::test]
    async fn scanning_without_interpreter_rejects_the_sheet() {
        let h = Harness::start().await;
        h.scanner.set_interpreter(None).await.expect("clear interpreter");
        let images = write_hmpb_sheet(h.path(), "orphan", &["alice"], true);
        h.insert(images).await;

        let status = h.wait_for(ScannerState::Rejected).await;
        assert_eq!(status.error, Some(ScannerErrorType::DeviceError));
        assert_eq!(h.counted(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_actor() {
        let h = Harness::start().await;
        let mut rx = h.scanner.subscribe();
        h.scanner.shutdown().await.expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.changed().await.is_ok() {}
        })
        .await
        .expect("actor stopped");
        assert!(h.scanner.scan().await.is_err());
    }
}
