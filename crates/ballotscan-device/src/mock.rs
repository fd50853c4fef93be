// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Deterministic in-memory scanner.
//
// Models the paper path as two slots (front and back) plus a jam flag. Tests
// drive the "physical" side through `MockScanner` (load a sheet, pull it out,
// jam the transport, unplug the cable, hang the driver) while the state
// machine drives the device side through `ScannerClient`.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, warn};

use ballotscan_core::types::SheetOf;

use crate::client::{DeviceError, DeviceResult, PaperStatus, ScannerClient, ScannerConnector};

/// Operation counters, for assertions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCounters {
    pub connects: u32,
    pub scans: u32,
    pub accepts: u32,
    pub rejects: u32,
    pub calibrations: u32,
    pub closes: u32,
    pub kills: u32,
}

#[derive(Debug, Default)]
struct MockState {
    front: Option<SheetOf<PathBuf>>,
    back: Option<SheetOf<PathBuf>>,
    jammed: bool,
    plugged_in: bool,
    /// The driver hangs: status polls and close block until killed.
    frozen: bool,
    /// Connection id of the live client; older clients see `Disconnected`.
    live_client: Option<u64>,
    next_client: u64,
    fail_connect: u32,
    fail_scan: Option<DeviceError>,
    fail_accept: Option<DeviceError>,
    fail_reject: Option<DeviceError>,
    fail_calibrate: Option<DeviceError>,
    fail_kill: bool,
    /// When false, accepted paper stays in the back (stuck sheet).
    accept_drops: bool,
    /// Paper that has been dropped into the ballot box.
    ballot_box: Vec<SheetOf<PathBuf>>,
    counters: MockCounters,
}

impl MockState {
    fn paper_status(&self) -> PaperStatus {
        if self.jammed {
            return PaperStatus::Jam;
        }
        match (&self.front, &self.back) {
            (None, None) => PaperStatus::NoPaper,
            (Some(_), None) => PaperStatus::ReadyToScan,
            (None, Some(_)) => PaperStatus::ReadyToEject,
            (Some(_), Some(_)) => PaperStatus::BothSidesHavePaper,
        }
    }
}

struct Shared {
    state: Mutex<MockState>,
    thaw: Condvar,
}

impl Shared {
    fn lock(&self) -> DeviceResult<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| DeviceError::Io("mock scanner lock poisoned".into()))
    }
}

/// Handle on the simulated hardware. Cloning shares the same device.
#[derive(Clone)]
pub struct MockScanner {
    shared: Arc<Shared>,
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScanner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    plugged_in: true,
                    accept_drops: true,
                    ..MockState::default()
                }),
                thaw: Condvar::new(),
            }),
        }
    }

    // Test controls ignore lock poisoning.
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    /// A voter places a sheet in the front tray.
    pub fn load_sheet(&self, images: SheetOf<PathBuf>) {
        self.with(|s| s.front = Some(images));
    }

    /// The voter takes back whatever is in the front tray.
    pub fn remove_front_sheet(&self) -> Option<SheetOf<PathBuf>> {
        self.with(|s| s.front.take())
    }

    /// Someone pulls the sheet out of the back of the transport.
    pub fn remove_back_sheet(&self) -> Option<SheetOf<PathBuf>> {
        self.with(|s| s.back.take())
    }

    pub fn jam(&self) {
        self.with(|s| s.jammed = true);
    }

    /// A poll worker opens the transport and clears the jam, removing all
    /// paper.
    pub fn clear_jam(&self) {
        self.with(|s| {
            s.jammed = false;
            s.front = None;
            s.back = None;
        });
    }

    pub fn unplug(&self) {
        self.with(|s| {
            s.plugged_in = false;
            s.live_client = None;
        });
        self.shared.thaw.notify_all();
    }

    pub fn plug_in(&self) {
        self.with(|s| s.plugged_in = true);
    }

    /// Make the driver hang on the next status poll or close.
    pub fn freeze(&self) {
        self.with(|s| s.frozen = true);
    }

    pub fn unfreeze(&self) {
        self.with(|s| s.frozen = false);
        self.shared.thaw.notify_all();
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.with(|s| s.fail_connect = count);
    }

    pub fn fail_next_scan(&self, err: DeviceError) {
        self.with(|s| s.fail_scan = Some(err));
    }

    pub fn fail_next_accept(&self, err: DeviceError) {
        self.with(|s| s.fail_accept = Some(err));
    }

    pub fn fail_next_reject(&self, err: DeviceError) {
        self.with(|s| s.fail_reject = Some(err));
    }

    pub fn fail_next_calibrate(&self, err: DeviceError) {
        self.with(|s| s.fail_calibrate = Some(err));
    }

    pub fn set_kill_fails(&self, fails: bool) {
        self.with(|s| s.fail_kill = fails);
    }

    /// When `drops` is false, accept leaves the sheet stuck in the back.
    pub fn set_accept_drops(&self, drops: bool) {
        self.with(|s| s.accept_drops = drops);
    }

    pub fn paper_status(&self) -> PaperStatus {
        self.with(|s| s.paper_status())
    }

    pub fn ballot_box(&self) -> Vec<SheetOf<PathBuf>> {
        self.with(|s| s.ballot_box.clone())
    }

    pub fn counters(&self) -> MockCounters {
        self.with(|s| s.counters)
    }
}

impl ScannerConnector for MockScanner {
    fn connect(&self) -> DeviceResult<Arc<dyn ScannerClient>> {
        let mut state = self.shared.lock()?;
        state.counters.connects += 1;
        if !state.plugged_in {
            return Err(DeviceError::Disconnected);
        }
        if state.fail_connect > 0 {
            state.fail_connect -= 1;
            return Err(DeviceError::Command("connect failed".into()));
        }
        let id = state.next_client;
        state.next_client += 1;
        state.live_client = Some(id);
        debug!(client = id, "mock scanner connected");
        Ok(Arc::new(MockClient {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

/// One connection to the mock scanner.
pub struct MockClient {
    shared: Arc<Shared>,
    id: u64,
}

impl MockClient {
    /// Lock the device state, failing if this connection has been dropped.
    fn live(&self) -> DeviceResult<MutexGuard<'_, MockState>> {
        let state = self.shared.lock()?;
        if state.live_client != Some(self.id) || !state.plugged_in {
            return Err(DeviceError::Disconnected);
        }
        Ok(state)
    }

    /// Block while the driver is frozen.
    fn live_thawed(&self) -> DeviceResult<MutexGuard<'_, MockState>> {
        let mut state = self.live()?;
        while state.frozen && state.live_client == Some(self.id) {
            state = self
                .shared
                .thaw
                .wait(state)
                .map_err(|_| DeviceError::Io("mock scanner lock poisoned".into()))?;
        }
        if state.live_client != Some(self.id) {
            return Err(DeviceError::Disconnected);
        }
        Ok(state)
    }
}

impl ScannerClient for MockClient {
    fn paper_status(&self) -> DeviceResult<PaperStatus> {
        Ok(self.live_thawed()?.paper_status())
    }

    fn scan(&self) -> DeviceResult<SheetOf<PathBuf>> {
        let mut state = self.live()?;
        state.counters.scans += 1;
        if let Some(err) = state.fail_scan.take() {
            return Err(err);
        }
        if state.jammed {
            return Err(DeviceError::Jammed);
        }
        if state.back.is_some() {
            return Err(DeviceError::Command("paper already in back".into()));
        }
        let Some(sheet) = state.front.take() else {
            return Err(DeviceError::NoPaper);
        };
        state.back = Some(sheet.clone());
        Ok(sheet)
    }

    fn accept(&self) -> DeviceResult<()> {
        let mut state = self.live()?;
        state.counters.accepts += 1;
        if let Some(err) = state.fail_accept.take() {
            return Err(err);
        }
        if !state.accept_drops {
            return Ok(());
        }
        match state.back.take() {
            Some(sheet) => {
                state.ballot_box.push(sheet);
                Ok(())
            }
            None => Err(DeviceError::Command("no paper to accept".into())),
        }
    }

    fn reject(&self, hold: bool) -> DeviceResult<()> {
        let mut state = self.live()?;
        state.counters.rejects += 1;
        if let Some(err) = state.fail_reject.take() {
            return Err(err);
        }
        let Some(sheet) = state.back.take() else {
            return Err(DeviceError::Command("no paper to reject".into()));
        };
        if state.front.is_some() {
            // Nowhere for the sheet to go.
            state.back = Some(sheet);
            state.jammed = true;
            return Err(DeviceError::Jammed);
        }
        if hold {
            state.front = Some(sheet);
        }
        Ok(())
    }

    fn calibrate(&self) -> DeviceResult<()> {
        let mut state = self.live()?;
        state.counters.calibrations += 1;
        match state.fail_calibrate.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close(&self) -> DeviceResult<()> {
        let mut state = self.live_thawed()?;
        state.counters.closes += 1;
        state.live_client = None;
        Ok(())
    }

    fn kill(&self) -> DeviceResult<()> {
        let mut state = self.shared.lock()?;
        state.counters.kills += 1;
        if state.fail_kill {
            warn!(client = self.id, "mock scanner kill failed");
            return Err(DeviceError::Command("kill failed".into()));
        }
        // A restarted driver is no longer hung.
        state.frozen = false;
        if state.live_client == Some(self.id) {
            state.live_client = None;
        }
        drop(state);
        self.shared.thaw.notify_all();
        Ok(())
    }
}
