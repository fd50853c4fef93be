// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Precinct scanner transition core.
//
// `ScannerMachine` owns no I/O. Commands and device completions go in, effect
// descriptors come out; the runtime carries the effects out and feeds their
// completions back. Every state entry bumps the epoch, and completions that
// carry an older epoch are dropped.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use ballotscan_core::config::{Delays, MAX_FAILED_SCAN_ATTEMPTS};
use ballotscan_core::error::BallotscanError;
use ballotscan_core::interpretation::SheetInterpretation;
use ballotscan_core::status::{ScannerErrorType, ScannerState};
use ballotscan_core::types::{SheetId, SheetOf};
use ballotscan_device::{DeviceError, DeviceResult, PaperStatus, RetryConfig, RetryDecision, should_retry};
use ballotscan_interpret::{InterpretRequest, InterpretResponse};

/// Operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Scan,
    Accept,
    Return,
    Calibrate,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Accept => "accept",
            Self::Return => "return",
            Self::Calibrate => "calibrate",
        }
    }
}

/// A command sent in a state that does not accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{} is not allowed while the scanner is {state}", .command.as_str())]
pub struct CommandError {
    pub command: Command,
    pub state: ScannerState,
}

impl From<CommandError> for BallotscanError {
    fn from(err: CommandError) -> Self {
        BallotscanError::CommandRejected {
            command: err.command.as_str().to_owned(),
            state: err.state.as_str().to_owned(),
        }
    }
}

/// Delayed self-notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Reconnect,
    ScanningTimeout,
    AcceptingTimeout,
    ReadyForNextBallot,
    ResetToNoPaper,
    WaitForHoldAfterReject,
    KillAfterDisconnect,
    CoolOff,
}

/// Completions fed back by the runtime, each tagged with the epoch of the
/// effect that produced it.
#[derive(Debug, Clone)]
pub enum Event {
    Connected { epoch: u64, result: DeviceResult<()> },
    PaperStatus { epoch: u64, result: DeviceResult<PaperStatus> },
    PaperStatusTimedOut { epoch: u64 },
    Scanned { epoch: u64, result: DeviceResult<SheetOf<PathBuf>> },
    Interpreted { epoch: u64, result: Result<InterpretResponse, String> },
    Accepted { epoch: u64, result: DeviceResult<()> },
    Rejected { epoch: u64, result: DeviceResult<()> },
    Calibrated { epoch: u64, result: DeviceResult<()> },
    Closed { epoch: u64, result: DeviceResult<()> },
    Killed { epoch: u64, result: DeviceResult<()> },
    TimerFired { epoch: u64, timer: Timer },
}

impl Event {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Connected { epoch, .. }
            | Self::PaperStatus { epoch, .. }
            | Self::PaperStatusTimedOut { epoch }
            | Self::Scanned { epoch, .. }
            | Self::Interpreted { epoch, .. }
            | Self::Accepted { epoch, .. }
            | Self::Rejected { epoch, .. }
            | Self::Calibrated { epoch, .. }
            | Self::Closed { epoch, .. }
            | Self::Killed { epoch, .. }
            | Self::TimerFired { epoch, .. } => *epoch,
        }
    }

    /// Event name without payload. Safe to log: never carries votes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::PaperStatus { result, .. } => match result {
                Ok(PaperStatus::NoPaper) => "paper_status_no_paper",
                Ok(PaperStatus::ReadyToScan) => "paper_status_ready_to_scan",
                Ok(PaperStatus::ReadyToEject) => "paper_status_ready_to_eject",
                Ok(PaperStatus::BothSidesHavePaper) => "paper_status_both_sides_have_paper",
                Ok(PaperStatus::Jam) => "paper_status_jam",
                Ok(PaperStatus::Unexpected(_)) => "paper_status_unexpected",
                Err(_) => "paper_status_error",
            },
            Self::PaperStatusTimedOut { .. } => "paper_status_timed_out",
            Self::Scanned { .. } => "scanned",
            Self::Interpreted { .. } => "interpreted",
            Self::Accepted { .. } => "accept_completed",
            Self::Rejected { .. } => "reject_completed",
            Self::Calibrated { .. } => "calibrate_completed",
            Self::Closed { .. } => "close_completed",
            Self::Killed { .. } => "kill_completed",
            Self::TimerFired { timer, .. } => match timer {
                Timer::Reconnect => "timer_reconnect",
                Timer::ScanningTimeout => "timer_scanning_timeout",
                Timer::AcceptingTimeout => "timer_accepting_timeout",
                Timer::ReadyForNextBallot => "timer_ready_for_next_ballot",
                Timer::ResetToNoPaper => "timer_reset_to_no_paper",
                Timer::WaitForHoldAfterReject => "timer_wait_for_hold_after_reject",
                Timer::KillAfterDisconnect => "timer_kill_after_disconnect",
                Timer::CoolOff => "timer_cool_off",
            },
        }
    }
}

/// Work for the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect { epoch: u64 },
    Close { epoch: u64 },
    Kill { epoch: u64 },
    PollPaperStatus { epoch: u64, after: Duration },
    Scan { epoch: u64 },
    Accept { epoch: u64 },
    Reject { epoch: u64, hold: bool },
    Calibrate { epoch: u64 },
    Interpret { epoch: u64, request: InterpretRequest },
    StartTimer { epoch: u64, timer: Timer, after: Duration },
    RecordAccepted(InterpretResponse),
    RecordRejected(InterpretResponse),
    /// Resolve a waiting `calibrate` caller.
    CalibrationFinished(Result<(), String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Starting,
    CheckingCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    Starting,
    CheckingCompleted,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Disconnecting,
    Killing,
    CoolingOff,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ejection {
    Return,
    Reject,
}

/// Internal phase. Finer than the reported `ScannerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Disconnected,
    Reconnecting,
    CheckingInitialPaperStatus,
    NoPaper,
    ReadyToScan,
    Scanning(ScanStep),
    Interpreting,
    ReadyToAccept,
    NeedsReview,
    Accepting { after_review: bool, step: Step },
    /// `ready_for_next` flips once the pause after an accept has elapsed.
    Accepted { ready_for_next: bool },
    Ejecting { ejection: Ejection, step: Step },
    Returned,
    Rejected,
    Calibrating(Step),
    Jammed,
    BothSidesHavePaper,
    Recovering(Recovery),
    Unrecoverable,
}

impl Phase {
    pub fn state(&self) -> ScannerState {
        match self {
            Self::Connecting | Self::CheckingInitialPaperStatus => ScannerState::Connecting,
            Self::Disconnected | Self::Reconnecting => ScannerState::Disconnected,
            Self::NoPaper => ScannerState::NoPaper,
            Self::ReadyToScan => ScannerState::ReadyToScan,
            Self::Scanning(_) | Self::Interpreting => ScannerState::Scanning,
            Self::ReadyToAccept => ScannerState::ReadyToAccept,
            Self::NeedsReview => ScannerState::NeedsReview,
            Self::Accepting { after_review: false, .. } => ScannerState::Accepting,
            Self::Accepting { after_review: true, .. } => ScannerState::AcceptingAfterReview,
            Self::Accepted { .. } => ScannerState::Accepted,
            Self::Ejecting { ejection: Ejection::Return, .. } => ScannerState::Returning,
            Self::Ejecting { ejection: Ejection::Reject, .. } => ScannerState::Rejecting,
            Self::Returned => ScannerState::Returned,
            Self::Rejected => ScannerState::Rejected,
            Self::Calibrating(_) => ScannerState::Calibrating,
            Self::Jammed => ScannerState::Jammed,
            Self::BothSidesHavePaper => ScannerState::BothSidesHavePaper,
            Self::Recovering(_) => ScannerState::RecoveringFromError,
            Self::Unrecoverable => ScannerState::UnrecoverableError,
        }
    }
}

/// What the machine reports. Counts come from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStatus {
    pub state: ScannerState,
    pub error: Option<ScannerErrorType>,
    pub interpretation: Option<SheetInterpretation>,
}

/// Paper sensor readings plus the poll errors that map onto them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paper {
    NoPaper,
    ReadyToScan,
    ReadyToEject,
    BothSides,
    Jam,
    Disconnected,
}

/// Outcome of a phase-specific paper status handler.
enum Reaction {
    Stay,
    Go(Vec<Effect>),
    Unhandled,
}

pub struct ScannerMachine {
    phase: Phase,
    epoch: u64,
    delays: Delays,
    retry: RetryConfig,
    scanned_sheet: Option<SheetOf<PathBuf>>,
    interpretation: Option<InterpretResponse>,
    error: Option<ScannerErrorType>,
    failed_scan_attempts: u32,
    reconnect_attempts: u32,
}

impl ScannerMachine {
    pub fn new(delays: Delays) -> Self {
        let retry = RetryConfig {
            max_retries: u32::MAX,
            base_delay: delays.reconnect,
            max_delay: delays.max_reconnect_backoff,
        };
        Self {
            phase: Phase::Connecting,
            epoch: 0,
            delays,
            retry,
            scanned_sheet: None,
            interpretation: None,
            error: None,
            failed_scan_attempts: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    pub fn status(&self) -> MachineStatus {
        let state = self.phase.state();
        MachineStatus {
            state,
            error: self.error.filter(|_| state.reports_error()),
            interpretation: self.interpretation.as_ref().map(|i| i.interpretation.clone()),
        }
    }

    /// Begin connecting. Call once.
    pub fn start(&mut self) -> Vec<Effect> {
        self.enter(Phase::Connecting)
    }

    pub fn command(&mut self, command: Command) -> Result<Vec<Effect>, CommandError> {
        let next = match (command, self.phase) {
            (Command::Scan, Phase::ReadyToScan) => {
                self.failed_scan_attempts = 0;
                Phase::Scanning(ScanStep::Starting)
            }
            (Command::Accept, Phase::ReadyToAccept) => Phase::Accepting {
                after_review: false,
                step: Step::Starting,
            },
            (Command::Accept, Phase::NeedsReview) => Phase::Accepting {
                after_review: true,
                step: Step::Starting,
            },
            (Command::Return, Phase::NeedsReview) => Phase::Ejecting {
                ejection: Ejection::Return,
                step: Step::Starting,
            },
            (Command::Calibrate, Phase::NoPaper) => Phase::Calibrating(Step::Starting),
            _ => {
                return Err(CommandError {
                    command,
                    state: self.phase.state(),
                });
            }
        };
        Ok(self.enter(next))
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if event.epoch() != self.epoch {
            debug!(event = event.kind(), epoch = event.epoch(), current = self.epoch, "stale event dropped");
            return Vec::new();
        }

        match event {
            Event::Connected { result, .. } => self.on_connected(result),
            Event::PaperStatus { result, .. } => self.on_paper_status(result),
            Event::PaperStatusTimedOut { .. } => {
                self.fail(ScannerErrorType::PaperStatusTimedOut, "paper status poll timed out")
            }
            Event::Scanned { result, .. } => self.on_scanned(result),
            Event::Interpreted { result, .. } => self.on_interpreted(result),
            Event::Accepted { result, .. } => self.on_accept_completed(result),
            Event::Rejected { result, .. } => self.on_reject_completed(result),
            Event::Calibrated { result, .. } => self.on_calibrated(result),
            Event::Closed { result, .. } => self.on_closed(result),
            Event::Killed { result, .. } => self.on_killed(result),
            Event::TimerFired { timer, .. } => self.on_timer(timer),
        }
    }

    // -- State entry ----------------------------------------------------------

    fn poll(&self, after: Duration) -> Effect {
        Effect::PollPaperStatus {
            epoch: self.epoch,
            after,
        }
    }

    fn timer(&self, timer: Timer, after: Duration) -> Effect {
        Effect::StartTimer {
            epoch: self.epoch,
            timer,
            after,
        }
    }

    fn clear_last_scan(&mut self) {
        self.scanned_sheet = None;
        self.interpretation = None;
    }

    fn enter(&mut self, phase: Phase) -> Vec<Effect> {
        let from = self.phase;
        self.phase = phase;
        self.epoch += 1;
        if from.state() != phase.state() {
            info!(from = %from.state(), to = %phase.state(), "scanner state changed");
        } else {
            debug!(?from, to = ?phase, "scanner phase changed");
        }

        let epoch = self.epoch;
        match phase {
            Phase::Connecting | Phase::Reconnecting | Phase::Recovering(Recovery::Reconnecting) => {
                vec![Effect::Connect { epoch }]
            }
            Phase::Disconnected => {
                self.clear_last_scan();
                let delay = match should_retry(&DeviceError::Disconnected, self.reconnect_attempts, &self.retry) {
                    RetryDecision::RetryAfter(delay) => delay,
                    _ => self.delays.reconnect,
                };
                vec![Effect::Close { epoch }, self.timer(Timer::Reconnect, delay)]
            }
            Phase::CheckingInitialPaperStatus => vec![self.poll(Duration::ZERO)],
            Phase::NoPaper | Phase::ReadyToScan => {
                self.error = None;
                self.clear_last_scan();
                vec![self.poll(Duration::ZERO)]
            }
            Phase::Scanning(ScanStep::Starting) => {
                self.error = None;
                self.clear_last_scan();
                vec![
                    Effect::Scan { epoch },
                    self.timer(Timer::ScanningTimeout, self.delays.scanning_timeout),
                ]
            }
            Phase::Scanning(_) => vec![self.poll(Duration::ZERO)],
            Phase::Interpreting => match self.scanned_sheet.clone() {
                Some(images) => vec![Effect::Interpret {
                    epoch,
                    request: InterpretRequest {
                        sheet_id: SheetId::new(),
                        images,
                    },
                }],
                None => self.fail(ScannerErrorType::UnexpectedEvent, "interpreting without a scanned sheet"),
            },
            Phase::ReadyToAccept | Phase::NeedsReview => vec![self.poll(Duration::ZERO)],
            Phase::Accepting { step: Step::Starting, .. } => vec![Effect::Accept { epoch }],
            Phase::Accepting { step: Step::CheckingCompleted, .. } => vec![
                self.poll(Duration::ZERO),
                self.timer(Timer::AcceptingTimeout, self.delays.accepting_timeout),
            ],
            Phase::Accepted { .. } => {
                let mut effects = Vec::new();
                if let Some(response) = &self.interpretation {
                    effects.push(Effect::RecordAccepted(response.clone()));
                }
                effects.push(self.timer(Timer::ReadyForNextBallot, self.delays.accepted_ready_for_next_ballot));
                effects.push(self.timer(Timer::ResetToNoPaper, self.delays.accepted_reset_to_no_paper));
                effects.push(self.poll(Duration::ZERO));
                effects
            }
            Phase::Ejecting { step: Step::Starting, .. } => {
                let mut effects = Vec::new();
                if let Some(response) = &self.interpretation {
                    effects.push(Effect::RecordRejected(response.clone()));
                }
                effects.push(Effect::Reject { epoch, hold: true });
                effects
            }
            Phase::Ejecting { step: Step::CheckingCompleted, .. } => vec![
                self.poll(Duration::ZERO),
                self.timer(Timer::WaitForHoldAfterReject, self.delays.wait_for_hold_after_reject),
            ],
            Phase::Returned | Phase::Rejected | Phase::Jammed => vec![self.poll(Duration::ZERO)],
            Phase::Calibrating(Step::Starting) => {
                self.error = None;
                vec![Effect::Calibrate { epoch }]
            }
            Phase::Calibrating(Step::CheckingCompleted) => vec![self.poll(Duration::ZERO)],
            Phase::BothSidesHavePaper => {
                self.error = None;
                vec![self.poll(Duration::ZERO)]
            }
            Phase::Recovering(Recovery::Disconnecting) => vec![
                Effect::Close { epoch },
                self.timer(Timer::KillAfterDisconnect, self.delays.kill_after_disconnect_timeout),
            ],
            Phase::Recovering(Recovery::Killing) => vec![Effect::Kill { epoch }],
            Phase::Recovering(Recovery::CoolingOff) => {
                vec![self.timer(Timer::CoolOff, self.delays.reconnect_on_unexpected_error)]
            }
            Phase::Unrecoverable => Vec::new(),
        }
    }

    fn enter_with_error(&mut self, phase: Phase, error: ScannerErrorType) -> Vec<Effect> {
        self.error = Some(error);
        self.enter(phase)
    }

    /// Unexpected failure: disconnect, cool off and reconnect.
    fn fail(&mut self, error: ScannerErrorType, detail: &str) -> Vec<Effect> {
        warn!(error = %error, detail, state = %self.phase.state(), "scanner error, recovering");
        self.enter_with_error(Phase::Recovering(Recovery::Disconnecting), error)
    }

    fn give_up(&mut self, detail: &str) -> Vec<Effect> {
        warn!(detail, state = %self.phase.state(), "unrecoverable scanner error");
        self.enter_with_error(Phase::Unrecoverable, ScannerErrorType::DeviceError)
    }

    /// Route a finished interpretation.
    fn route(&mut self) -> Vec<Effect> {
        let next = match self.interpretation.as_ref().map(|r| &r.interpretation) {
            Some(SheetInterpretation::ValidSheet) => Phase::ReadyToAccept,
            Some(SheetInterpretation::NeedsReviewSheet { .. }) => Phase::NeedsReview,
            Some(SheetInterpretation::InvalidSheet { .. }) => Phase::Ejecting {
                ejection: Ejection::Reject,
                step: Step::Starting,
            },
            None => return self.fail(ScannerErrorType::UnexpectedEvent, "routing without an interpretation"),
        };
        self.enter(next)
    }

    // -- Completions ----------------------------------------------------------

    fn on_connected(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        match (self.phase, result) {
            (Phase::Recovering(Recovery::Reconnecting), Ok(())) => {
                self.error = None;
                self.enter(Phase::CheckingInitialPaperStatus)
            }
            (Phase::Recovering(Recovery::Reconnecting), Err(e)) => self.give_up(&e.to_string()),
            (Phase::Connecting | Phase::Reconnecting, Ok(())) => {
                self.reconnect_attempts = 0;
                self.error = None;
                self.enter(Phase::CheckingInitialPaperStatus)
            }
            (Phase::Connecting | Phase::Reconnecting, Err(e)) => {
                match should_retry(&e, self.reconnect_attempts, &self.retry) {
                    RetryDecision::RetryAfter(_) => {
                        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                        self.enter(Phase::Disconnected)
                    }
                    RetryDecision::GiveUp(_) | RetryDecision::Exhausted => self.give_up(&e.to_string()),
                }
            }
            (phase, _) => self.unexpected(phase, "connected"),
        }
    }

    fn on_scanned(&mut self, result: DeviceResult<SheetOf<PathBuf>>) -> Vec<Effect> {
        if self.phase != Phase::Scanning(ScanStep::Starting) {
            return self.unexpected(self.phase, "scanned");
        }
        match result {
            Ok(images) => {
                self.scanned_sheet = Some(images);
                self.enter(Phase::Scanning(ScanStep::CheckingCompleted))
            }
            Err(e) if e.is_feeder_error() => {
                debug!(error = %e, attempts = self.failed_scan_attempts, "paper not fed, will retry");
                self.enter(Phase::Scanning(ScanStep::Retrying))
            }
            Err(e) if e.is_missing_page() => self.give_up(&e.to_string()),
            Err(e) => self.fail(ScannerErrorType::DeviceError, &e.to_string()),
        }
    }

    fn on_interpreted(&mut self, result: Result<InterpretResponse, String>) -> Vec<Effect> {
        if self.phase != Phase::Interpreting {
            return self.unexpected(self.phase, "interpreted");
        }
        match result {
            Ok(response) => {
                info!(interpretation = response.interpretation.type_name(), "sheet interpreted");
                self.interpretation = Some(response);
                self.route()
            }
            Err(message) => {
                warn!(error = %message, "interpretation failed, rejecting sheet");
                self.enter_with_error(
                    Phase::Ejecting {
                        ejection: Ejection::Reject,
                        step: Step::Starting,
                    },
                    ScannerErrorType::DeviceError,
                )
            }
        }
    }

    fn on_accept_completed(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        let Phase::Accepting {
            after_review,
            step: Step::Starting,
        } = self.phase
        else {
            return self.unexpected(self.phase, "accept_completed");
        };
        // The transport can report an error and still drop the sheet; the
        // paper status decides.
        if let Err(e) = result {
            warn!(error = %e, "accept reported an error");
        }
        self.enter(Phase::Accepting {
            after_review,
            step: Step::CheckingCompleted,
        })
    }

    fn on_reject_completed(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        let Phase::Ejecting {
            ejection,
            step: Step::Starting,
        } = self.phase
        else {
            return self.unexpected(self.phase, "reject_completed");
        };
        match result {
            Ok(()) => self.enter(Phase::Ejecting {
                ejection,
                step: Step::CheckingCompleted,
            }),
            Err(e) => {
                warn!(error = %e, "reject failed");
                self.enter(Phase::Jammed)
            }
        }
    }

    fn on_calibrated(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        if self.phase != Phase::Calibrating(Step::Starting) {
            return self.unexpected(self.phase, "calibrate_completed");
        }
        let outcome = result.map_err(|e| e.to_string());
        let mut effects = vec![Effect::CalibrationFinished(outcome)];
        effects.extend(self.enter(Phase::Calibrating(Step::CheckingCompleted)));
        effects
    }

    fn on_closed(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        match (self.phase, result) {
            // Reconnect is already scheduled.
            (Phase::Disconnected, _) => Vec::new(),
            (Phase::Recovering(Recovery::Disconnecting), Ok(())) => {
                self.enter(Phase::Recovering(Recovery::CoolingOff))
            }
            (Phase::Recovering(Recovery::Disconnecting), Err(e)) => {
                debug!(error = %e, "close failed, killing");
                self.enter(Phase::Recovering(Recovery::Killing))
            }
            (phase, _) => self.unexpected(phase, "close_completed"),
        }
    }

    fn on_killed(&mut self, result: DeviceResult<()>) -> Vec<Effect> {
        if self.phase != Phase::Recovering(Recovery::Killing) {
            return self.unexpected(self.phase, "kill_completed");
        }
        match result {
            Ok(()) => self.enter(Phase::Recovering(Recovery::CoolingOff)),
            Err(e) => self.give_up(&e.to_string()),
        }
    }

    fn on_timer(&mut self, timer: Timer) -> Vec<Effect> {
        match (timer, self.phase) {
            (Timer::Reconnect, Phase::Disconnected) => self.enter(Phase::Reconnecting),
            (Timer::ScanningTimeout, Phase::Scanning(ScanStep::Starting)) => {
                self.fail(ScannerErrorType::ScanningTimedOut, "scan did not complete")
            }
            (
                Timer::AcceptingTimeout,
                Phase::Accepting {
                    step: Step::CheckingCompleted,
                    ..
                },
            ) => self.enter_with_error(
                Phase::Ejecting {
                    ejection: Ejection::Reject,
                    step: Step::Starting,
                },
                ScannerErrorType::PaperInBackAfterAccept,
            ),
            (Timer::ReadyForNextBallot, Phase::Accepted { .. }) => {
                // Internal transition: keeps the epoch so the reset timer and
                // the poll loop stay live.
                self.phase = Phase::Accepted { ready_for_next: true };
                Vec::new()
            }
            (Timer::ResetToNoPaper, Phase::Accepted { .. }) => self.enter(Phase::NoPaper),
            (
                Timer::WaitForHoldAfterReject,
                Phase::Ejecting {
                    step: Step::CheckingCompleted,
                    ..
                },
            ) => self.enter(Phase::NoPaper),
            (Timer::KillAfterDisconnect, Phase::Recovering(Recovery::Disconnecting)) => {
                self.enter(Phase::Recovering(Recovery::Killing))
            }
            (Timer::CoolOff, Phase::Recovering(Recovery::CoolingOff)) => {
                self.enter(Phase::Recovering(Recovery::Reconnecting))
            }
            (timer, phase) => {
                debug!(?timer, ?phase, "timer not relevant in this phase");
                Vec::new()
            }
        }
    }

    fn unexpected(&mut self, phase: Phase, kind: &str) -> Vec<Effect> {
        debug!(?phase, event = kind, "unexpected completion");
        self.fail(ScannerErrorType::UnexpectedEvent, kind)
    }

    // -- Paper status ---------------------------------------------------------

    fn on_paper_status(&mut self, result: DeviceResult<PaperStatus>) -> Vec<Effect> {
        let paper = match result {
            Ok(PaperStatus::NoPaper) => Paper::NoPaper,
            Ok(PaperStatus::ReadyToScan) => Paper::ReadyToScan,
            Ok(PaperStatus::ReadyToEject) => Paper::ReadyToEject,
            Ok(PaperStatus::BothSidesHavePaper) => Paper::BothSides,
            Ok(PaperStatus::Jam) => Paper::Jam,
            Ok(PaperStatus::Unexpected(code)) => {
                return self.fail(ScannerErrorType::UnexpectedPaperStatus, &code);
            }
            Err(DeviceError::Disconnected | DeviceError::Io(_)) => Paper::Disconnected,
            Err(DeviceError::Jammed) => Paper::Jam,
            Err(e) => return self.fail(ScannerErrorType::DeviceError, &e.to_string()),
        };

        match self.react(paper) {
            Reaction::Stay => vec![self.poll(self.delays.paper_status_polling_interval)],
            Reaction::Go(effects) => effects,
            Reaction::Unhandled => match paper {
                Paper::Disconnected => self.enter(Phase::Disconnected),
                Paper::BothSides => self.enter(Phase::BothSidesHavePaper),
                Paper::Jam => self.enter(Phase::Jammed),
                _ => {
                    let detail = format!("{paper:?} in {:?}", self.phase);
                    self.fail(ScannerErrorType::UnexpectedEvent, &detail)
                }
            },
        }
    }

    fn react(&mut self, paper: Paper) -> Reaction {
        use Reaction::{Go, Stay, Unhandled};

        match (self.phase, paper) {
            (Phase::CheckingInitialPaperStatus, Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),
            (Phase::CheckingInitialPaperStatus, Paper::ReadyToScan) => Go(self.enter_with_error(
                Phase::Rejected,
                ScannerErrorType::PaperInFrontAfterReconnect,
            )),
            (Phase::CheckingInitialPaperStatus, Paper::ReadyToEject) => Go(self.enter_with_error(
                Phase::Ejecting {
                    ejection: Ejection::Reject,
                    step: Step::Starting,
                },
                ScannerErrorType::PaperInBackAfterReconnect,
            )),

            (Phase::NoPaper, Paper::NoPaper) => Stay,
            (Phase::NoPaper, Paper::ReadyToScan) => Go(self.enter(Phase::ReadyToScan)),
            (Phase::ReadyToScan, Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),
            (Phase::ReadyToScan, Paper::ReadyToScan) => Stay,

            // The transport sometimes pushes the sheet back out without a
            // scan error, so check the sheet actually reached the back.
            (Phase::Scanning(ScanStep::CheckingCompleted), Paper::ReadyToEject) => {
                Go(self.enter(Phase::Interpreting))
            }
            (Phase::Scanning(ScanStep::CheckingCompleted), Paper::NoPaper | Paper::ReadyToScan) => {
                Go(self.enter(Phase::Scanning(ScanStep::Retrying)))
            }
            (Phase::Scanning(ScanStep::Retrying), Paper::ReadyToScan) => {
                if self.failed_scan_attempts < MAX_FAILED_SCAN_ATTEMPTS - 1 {
                    self.failed_scan_attempts += 1;
                    Go(self.enter(Phase::Scanning(ScanStep::Starting)))
                } else {
                    Go(self.enter_with_error(Phase::Rejected, ScannerErrorType::ScanningFailed))
                }
            }
            (Phase::Scanning(ScanStep::Retrying), Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),
            (Phase::Scanning(ScanStep::Retrying), Paper::ReadyToEject) => Go(self.enter(Phase::Ejecting {
                ejection: Ejection::Reject,
                step: Step::Starting,
            })),

            (Phase::ReadyToAccept | Phase::NeedsReview, Paper::ReadyToEject) => Stay,

            (
                Phase::Accepting {
                    step: Step::CheckingCompleted,
                    ..
                },
                Paper::NoPaper | Paper::ReadyToScan,
            ) => Go(self.enter(Phase::Accepted { ready_for_next: false })),
            (
                Phase::Accepting {
                    step: Step::CheckingCompleted,
                    ..
                },
                Paper::ReadyToEject,
            ) => Stay,

            (Phase::Accepted { .. }, Paper::NoPaper) => Stay,
            (Phase::Accepted { ready_for_next: false }, Paper::ReadyToScan) => Stay,
            (Phase::Accepted { ready_for_next: true }, Paper::ReadyToScan) => {
                Go(self.enter(Phase::ReadyToScan))
            }

            // The transport reports no paper for a moment before it grabs the
            // sheet to hold it.
            (
                Phase::Ejecting {
                    step: Step::CheckingCompleted,
                    ..
                },
                Paper::NoPaper,
            ) => Stay,
            (
                Phase::Ejecting {
                    ejection,
                    step: Step::CheckingCompleted,
                },
                Paper::ReadyToScan,
            ) => Go(self.enter(match ejection {
                Ejection::Return => Phase::Returned,
                Ejection::Reject => Phase::Rejected,
            })),
            (
                Phase::Ejecting {
                    step: Step::CheckingCompleted,
                    ..
                },
                Paper::ReadyToEject,
            ) => Go(self.enter(Phase::Jammed)),

            (Phase::Returned | Phase::Rejected, Paper::ReadyToScan) => Stay,
            (Phase::Returned | Phase::Rejected, Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),

            (Phase::Calibrating(Step::CheckingCompleted), Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),
            (Phase::Calibrating(Step::CheckingCompleted), Paper::ReadyToScan) => {
                Go(self.enter(Phase::ReadyToScan))
            }

            (Phase::Jammed, Paper::NoPaper) => Go(self.enter(Phase::NoPaper)),
            (Phase::Jammed, Paper::Jam | Paper::ReadyToScan | Paper::ReadyToEject) => Stay,

            // A blip of no paper is normal while the front sheet is pulled out.
            (Phase::BothSidesHavePaper, Paper::BothSides | Paper::NoPaper) => Stay,
            (Phase::BothSidesHavePaper, Paper::ReadyToEject) => Go(self.resume_after_both_sides()),

            _ => Unhandled,
        }
    }

    /// Only the original sheet remains in the back: pick its disposition back
    /// up.
    fn resume_after_both_sides(&mut self) -> Vec<Effect> {
        if self.interpretation.is_some() {
            self.route()
        } else if self.scanned_sheet.is_some() {
            self.enter(Phase::Interpreting)
        } else {
            self.enter_with_error(
                Phase::Ejecting {
                    ejection: Ejection::Reject,
                    step: Step::Starting,
                },
                ScannerErrorType::BothSidesHavePaper,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use ballotscan_core::interpretation::{InvalidSheetReason, PageInterpretation};
    use ballotscan_core::types::SheetPage;

    use super::*;

    fn machine() -> ScannerMachine {
        ScannerMachine::new(Delays::for_tests())
    }

    fn images() -> SheetOf<PathBuf> {
        SheetOf::new(PathBuf::from("front.png"), PathBuf::from("back.png"))
    }

    fn response(interpretation: SheetInterpretation) -> InterpretResponse {
        let page = |name: &str| SheetPage {
            interpretation: PageInterpretation::BlankPage,
            original_filename: format!("{name}.png"),
            normalized_filename: format!("{name}.png"),
        };
        InterpretResponse {
            sheet_id: SheetId::new(),
            interpretation,
            pages: SheetOf::new(page("front"), page("back")),
            requires_adjudication: false,
        }
    }

    fn paper(m: &mut ScannerMachine, status: PaperStatus) -> Vec<Effect> {
        let epoch = m.epoch();
        m.handle(Event::PaperStatus {
            epoch,
            result: Ok(status),
        })
    }

    fn fire(m: &mut ScannerMachine, timer: Timer) -> Vec<Effect> {
        let epoch = m.epoch();
        m.handle(Event::TimerFired { epoch, timer })
    }

    fn state(m: &ScannerMachine) -> ScannerState {
        m.status().state
    }

    /// Connected machine with no paper.
    fn idle() -> ScannerMachine {
        let mut m = machine();
        let effects = m.start();
        assert_eq!(effects, vec![Effect::Connect { epoch: 1 }]);
        m.handle(Event::Connected {
            epoch: 1,
            result: Ok(()),
        });
        assert_eq!(state(&m), ScannerState::Connecting);
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
        m
    }

    /// Machine holding a scanned sheet, waiting for interpretation.
    fn interpreting() -> (ScannerMachine, InterpretRequest) {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        let effects = m.command(Command::Scan).expect("scan accepted");
        assert!(matches!(effects[0], Effect::Scan { .. }));
        let epoch = m.epoch();
        m.handle(Event::Scanned {
            epoch,
            result: Ok(images()),
        });
        let effects = paper(&mut m, PaperStatus::ReadyToEject);
        let Some(Effect::Interpret { request, .. }) = effects.into_iter().next() else {
            panic!("expected interpret effect");
        };
        assert_eq!(request.images, images());
        (m, request)
    }

    fn interpreted(m: &mut ScannerMachine, interpretation: SheetInterpretation) -> Vec<Effect> {
        let epoch = m.epoch();
        m.handle(Event::Interpreted {
            epoch,
            result: Ok(response(interpretation)),
        })
    }

    #[test]
    fn no_paper_status_keeps_polling() {
        let mut m = idle();
        let effects = paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(
            effects,
            vec![Effect::PollPaperStatus {
                epoch: m.epoch(),
                after: Delays::for_tests().paper_status_polling_interval,
            }]
        );
        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::ReadyToScan);
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn commands_in_wrong_state_are_rejected() {
        let mut m = idle();
        let err = m.command(Command::Scan).expect_err("no paper");
        assert_eq!(
            err,
            CommandError {
                command: Command::Scan,
                state: ScannerState::NoPaper,
            }
        );
        let err: BallotscanError = m.command(Command::Accept).expect_err("nothing to accept").into();
        assert_eq!(err.to_string(), "accept is not allowed while the scanner is no_paper");
        assert!(m.command(Command::Return).is_err());
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn stale_events_are_ignored() {
        let mut m = idle();
        let stale = m.epoch() - 1;
        let effects = m.handle(Event::PaperStatus {
            epoch: stale,
            result: Ok(PaperStatus::ReadyToScan),
        });
        assert!(effects.is_empty());
        assert_eq!(state(&m), ScannerState::NoPaper);

        let effects = m.handle(Event::TimerFired {
            epoch: stale,
            timer: Timer::ScanningTimeout,
        });
        assert!(effects.is_empty());
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn valid_sheet_is_accepted_and_recorded() {
        let (mut m, _) = interpreting();
        assert_eq!(state(&m), ScannerState::Scanning);
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        assert_eq!(state(&m), ScannerState::ReadyToAccept);

        let effects = m.command(Command::Accept).expect("accept");
        assert_eq!(effects, vec![Effect::Accept { epoch: m.epoch() }]);
        let epoch = m.epoch();
        m.handle(Event::Accepted {
            epoch,
            result: Ok(()),
        });
        assert_eq!(state(&m), ScannerState::Accepting);

        let effects = paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::Accepted);
        assert!(matches!(effects[0], Effect::RecordAccepted(ref r) if r.interpretation == SheetInterpretation::ValidSheet));
        assert_eq!(m.status().interpretation, Some(SheetInterpretation::ValidSheet));
    }

    #[test]
    fn accepted_ignores_new_paper_until_pause_elapses() {
        let (mut m, _) = interpreting();
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        m.command(Command::Accept).expect("accept");
        let epoch = m.epoch();
        m.handle(Event::Accepted {
            epoch,
            result: Err(DeviceError::Command("spurious".into())),
        });
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::Accepted);

        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::Accepted);

        let epoch = m.epoch();
        fire(&mut m, Timer::ReadyForNextBallot);
        assert_eq!(m.epoch(), epoch);
        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::ReadyToScan);
        assert_eq!(m.status().interpretation, None);
    }

    #[test]
    fn accepted_resets_to_no_paper() {
        let (mut m, _) = interpreting();
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        m.command(Command::Accept).expect("accept");
        let epoch = m.epoch();
        m.handle(Event::Accepted {
            epoch,
            result: Ok(()),
        });
        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::Accepted);
        fire(&mut m, Timer::ResetToNoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn stuck_sheet_after_accept_is_rejected() {
        let (mut m, _) = interpreting();
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        m.command(Command::Accept).expect("accept");
        let epoch = m.epoch();
        m.handle(Event::Accepted {
            epoch,
            result: Ok(()),
        });
        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::Accepting);

        let effects = fire(&mut m, Timer::AcceptingTimeout);
        assert_eq!(state(&m), ScannerState::Rejecting);
        assert_eq!(m.status().error, Some(ScannerErrorType::PaperInBackAfterAccept));
        assert!(matches!(effects[0], Effect::RecordRejected(_)));
        assert!(matches!(effects[1], Effect::Reject { hold: true, .. }));
    }

    #[test]
    fn needs_review_then_return() {
        let (mut m, _) = interpreting();
        interpreted(
            &mut m,
            SheetInterpretation::NeedsReviewSheet { reasons: Vec::new() },
        );
        assert_eq!(state(&m), ScannerState::NeedsReview);
        assert!(m.command(Command::Calibrate).is_err());

        let effects = m.command(Command::Return).expect("return");
        assert_eq!(state(&m), ScannerState::Returning);
        assert!(matches!(effects[0], Effect::RecordRejected(_)));

        let epoch = m.epoch();
        m.handle(Event::Rejected {
            epoch,
            result: Ok(()),
        });
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::Returning);
        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::Returned);
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn needs_review_then_accept_after_review() {
        let (mut m, _) = interpreting();
        interpreted(
            &mut m,
            SheetInterpretation::NeedsReviewSheet { reasons: Vec::new() },
        );
        m.command(Command::Accept).expect("accept");
        assert_eq!(state(&m), ScannerState::AcceptingAfterReview);
    }

    #[test]
    fn invalid_sheet_is_rejected_and_pulled_out() {
        let (mut m, _) = interpreting();
        let effects = interpreted(
            &mut m,
            SheetInterpretation::InvalidSheet {
                reason: InvalidSheetReason::InvalidPrecinct,
            },
        );
        assert_eq!(state(&m), ScannerState::Rejecting);
        assert!(matches!(effects[1], Effect::Reject { .. }));
        let epoch = m.epoch();
        m.handle(Event::Rejected {
            epoch,
            result: Ok(()),
        });
        // Voter grabbed it before the transport held it.
        fire(&mut m, Timer::WaitForHoldAfterReject);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn reject_failure_means_jam() {
        let (mut m, _) = interpreting();
        interpreted(
            &mut m,
            SheetInterpretation::InvalidSheet {
                reason: InvalidSheetReason::Unreadable,
            },
        );
        let epoch = m.epoch();
        m.handle(Event::Rejected {
            epoch,
            result: Err(DeviceError::Jammed),
        });
        assert_eq!(state(&m), ScannerState::Jammed);
        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::Jammed);
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn feeder_errors_retry_up_to_the_bound() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        m.command(Command::Scan).expect("scan");

        let mut scans = 1;
        loop {
            let epoch = m.epoch();
            m.handle(Event::Scanned {
                epoch,
                result: Err(DeviceError::PaperFeed),
            });
            let effects = paper(&mut m, PaperStatus::ReadyToScan);
            if state(&m) != ScannerState::Scanning {
                break;
            }
            assert!(matches!(effects[0], Effect::Scan { .. }));
            scans += 1;
        }
        assert_eq!(scans, MAX_FAILED_SCAN_ATTEMPTS);
        assert_eq!(state(&m), ScannerState::Rejected);
        assert_eq!(m.status().error, Some(ScannerErrorType::ScanningFailed));
    }

    #[test]
    fn auto_rejected_sheet_is_rescanned() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        m.command(Command::Scan).expect("scan");
        let epoch = m.epoch();
        m.handle(Event::Scanned {
            epoch,
            result: Ok(images()),
        });
        // Paper came back out the front without a scan error.
        paper(&mut m, PaperStatus::ReadyToScan);
        let effects = paper(&mut m, PaperStatus::ReadyToScan);
        assert!(matches!(effects[0], Effect::Scan { .. }));
    }

    #[test]
    fn missing_page_is_unrecoverable() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        m.command(Command::Scan).expect("scan");
        let epoch = m.epoch();
        let effects = m.handle(Event::Scanned {
            epoch,
            result: Err(DeviceError::InvalidResponse("expected two files, got 1".into())),
        });
        assert!(effects.is_empty());
        assert_eq!(state(&m), ScannerState::UnrecoverableError);
        assert_eq!(m.status().error, Some(ScannerErrorType::DeviceError));
        assert!(m.command(Command::Scan).is_err());
    }

    #[test]
    fn scanning_timeout_recovers() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        m.command(Command::Scan).expect("scan");
        let effects = fire(&mut m, Timer::ScanningTimeout);
        assert_eq!(state(&m), ScannerState::RecoveringFromError);
        assert_eq!(m.status().error, Some(ScannerErrorType::ScanningTimedOut));
        assert!(matches!(effects[0], Effect::Close { .. }));
    }

    #[test]
    fn second_sheet_interrupts_then_resumes() {
        let (mut m, _) = interpreting();
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        paper(&mut m, PaperStatus::BothSidesHavePaper);
        assert_eq!(state(&m), ScannerState::BothSidesHavePaper);
        assert!(m.command(Command::Accept).is_err());
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::BothSidesHavePaper);

        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::ReadyToAccept);
        assert_eq!(m.status().interpretation, Some(SheetInterpretation::ValidSheet));
    }

    #[test]
    fn second_sheet_during_scan_reinterprets() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToScan);
        m.command(Command::Scan).expect("scan");
        let epoch = m.epoch();
        m.handle(Event::Scanned {
            epoch,
            result: Ok(images()),
        });
        paper(&mut m, PaperStatus::BothSidesHavePaper);
        let effects = paper(&mut m, PaperStatus::ReadyToEject);
        assert!(matches!(effects[0], Effect::Interpret { .. }));
    }

    #[test]
    fn second_sheet_with_nothing_scanned_is_rejected() {
        let mut m = idle();
        paper(&mut m, PaperStatus::BothSidesHavePaper);
        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::Rejecting);
        assert_eq!(m.status().error, Some(ScannerErrorType::BothSidesHavePaper));
    }

    #[test]
    fn jam_from_any_polling_state() {
        let mut m = idle();
        paper(&mut m, PaperStatus::Jam);
        assert_eq!(state(&m), ScannerState::Jammed);
        assert_eq!(m.status().error, None);
    }

    #[test]
    fn unexpected_status_recovers() {
        let mut m = idle();
        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::RecoveringFromError);
        assert_eq!(m.status().error, Some(ScannerErrorType::UnexpectedEvent));

        let mut m = idle();
        paper(&mut m, PaperStatus::Unexpected("calibrating".into()));
        assert_eq!(m.status().error, Some(ScannerErrorType::UnexpectedPaperStatus));
    }

    #[test]
    fn disconnect_then_reconnect_with_paper_in_front() {
        let (mut m, _) = interpreting();
        interpreted(&mut m, SheetInterpretation::ValidSheet);
        let epoch = m.epoch();
        let effects = m.handle(Event::PaperStatus {
            epoch,
            result: Err(DeviceError::Disconnected),
        });
        assert_eq!(state(&m), ScannerState::Disconnected);
        assert_eq!(m.status().interpretation, None);
        assert!(matches!(effects[0], Effect::Close { .. }));
        assert!(matches!(
            effects[1],
            Effect::StartTimer {
                timer: Timer::Reconnect,
                ..
            }
        ));

        let effects = fire(&mut m, Timer::Reconnect);
        assert!(matches!(effects[0], Effect::Connect { .. }));
        let epoch = m.epoch();
        m.handle(Event::Connected {
            epoch,
            result: Ok(()),
        });
        paper(&mut m, PaperStatus::ReadyToScan);
        assert_eq!(state(&m), ScannerState::Rejected);
        assert_eq!(m.status().error, Some(ScannerErrorType::PaperInFrontAfterReconnect));
    }

    #[test]
    fn reconnect_with_paper_in_back_rejects_it() {
        let mut m = machine();
        m.start();
        m.handle(Event::Connected {
            epoch: 1,
            result: Ok(()),
        });
        let effects = paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(state(&m), ScannerState::Rejecting);
        assert_eq!(m.status().error, Some(ScannerErrorType::PaperInBackAfterReconnect));
        // Nothing was interpreted, so nothing is recorded.
        assert!(matches!(effects[0], Effect::Reject { hold: true, .. }));
    }

    #[test]
    fn connect_failures_back_off_then_give_up_on_permanent_errors() {
        let mut m = machine();
        m.start();
        m.handle(Event::Connected {
            epoch: 1,
            result: Err(DeviceError::Disconnected),
        });
        assert_eq!(state(&m), ScannerState::Disconnected);

        fire(&mut m, Timer::Reconnect);
        let epoch = m.epoch();
        m.handle(Event::Connected {
            epoch,
            result: Err(DeviceError::Command("driver not found".into())),
        });
        assert_eq!(state(&m), ScannerState::UnrecoverableError);
    }

    #[test]
    fn frozen_poll_escalates_through_kill() {
        let mut m = idle();
        let epoch = m.epoch();
        m.handle(Event::PaperStatusTimedOut { epoch });
        assert_eq!(state(&m), ScannerState::RecoveringFromError);
        assert_eq!(m.status().error, Some(ScannerErrorType::PaperStatusTimedOut));

        let effects = fire(&mut m, Timer::KillAfterDisconnect);
        assert!(matches!(effects[0], Effect::Kill { .. }));
        let epoch = m.epoch();
        let effects = m.handle(Event::Killed {
            epoch,
            result: Ok(()),
        });
        assert!(matches!(
            effects[0],
            Effect::StartTimer {
                timer: Timer::CoolOff,
                ..
            }
        ));
        let effects = fire(&mut m, Timer::CoolOff);
        assert!(matches!(effects[0], Effect::Connect { .. }));
        let epoch = m.epoch();
        m.handle(Event::Connected {
            epoch,
            result: Ok(()),
        });
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
        assert_eq!(m.status().error, None);
    }

    #[test]
    fn failed_kill_is_unrecoverable() {
        let mut m = idle();
        let epoch = m.epoch();
        m.handle(Event::PaperStatusTimedOut { epoch });
        let epoch = m.epoch();
        m.handle(Event::Closed {
            epoch,
            result: Err(DeviceError::Io("hung".into())),
        });
        let epoch = m.epoch();
        m.handle(Event::Killed {
            epoch,
            result: Err(DeviceError::Command("kill failed".into())),
        });
        assert_eq!(state(&m), ScannerState::UnrecoverableError);
    }

    #[test]
    fn calibration_reports_its_outcome() {
        let mut m = idle();
        let effects = m.command(Command::Calibrate).expect("calibrate");
        assert_eq!(effects, vec![Effect::Calibrate { epoch: m.epoch() }]);
        let epoch = m.epoch();
        let effects = m.handle(Event::Calibrated {
            epoch,
            result: Err(DeviceError::Command("no calibration sheet".into())),
        });
        assert_eq!(
            effects[0],
            Effect::CalibrationFinished(Err("scanner command failed: no calibration sheet".into()))
        );
        assert_eq!(state(&m), ScannerState::Calibrating);
        paper(&mut m, PaperStatus::NoPaper);
        assert_eq!(state(&m), ScannerState::NoPaper);
    }

    #[test]
    fn error_only_reported_in_error_states() {
        let mut m = idle();
        paper(&mut m, PaperStatus::BothSidesHavePaper);
        paper(&mut m, PaperStatus::ReadyToEject);
        assert_eq!(m.status().error, Some(ScannerErrorType::BothSidesHavePaper));
        let epoch = m.epoch();
        m.handle(Event::Rejected {
            epoch,
            result: Err(DeviceError::Jammed),
        });
        assert_eq!(state(&m), ScannerState::Jammed);
        assert_eq!(m.status().error, None);
    }

    #[test]
    fn event_kinds_carry_no_payload() {
        let event = Event::Interpreted {
            epoch: 3,
            result: Ok(response(SheetInterpretation::ValidSheet)),
        };
        assert_eq!(event.kind(), "interpreted");
        let event = Event::PaperStatus {
            epoch: 3,
            result: Ok(PaperStatus::Unexpected("x-secret".into())),
        };
        assert_eq!(event.kind(), "paper_status_unexpected");
    }
}
