// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the ballot ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BallotscanError;
use crate::interpretation::PageInterpretation;

/// Unique identifier for a scanned sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetId(pub Uuid);

impl SheetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SheetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SheetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a batch of sheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pair of values, one per side of a physical sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetOf<T> {
    pub front: T,
    pub back: T,
}

impl<T> SheetOf<T> {
    pub fn new(front: T, back: T) -> Self {
        Self { front, back }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> SheetOf<U> {
        SheetOf {
            front: f(self.front),
            back: f(self.back),
        }
    }

    pub fn as_ref(&self) -> SheetOf<&T> {
        SheetOf {
            front: &self.front,
            back: &self.back,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        [&self.front, &self.back].into_iter()
    }
}

/// Polls lifecycle. Drives batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollsState {
    PollsClosedInitial,
    PollsOpen,
    PollsPaused,
    PollsClosedFinal,
}

impl PollsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PollsClosedInitial => "polls_closed_initial",
            Self::PollsOpen => "polls_open",
            Self::PollsPaused => "polls_paused",
            Self::PollsClosedFinal => "polls_closed_final",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "polls_closed_initial" => Some(Self::PollsClosedInitial),
            "polls_open" => Some(Self::PollsOpen),
            "polls_paused" => Some(Self::PollsPaused),
            "polls_closed_final" => Some(Self::PollsClosedFinal),
            _ => None,
        }
    }
}

impl std::fmt::Display for PollsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which precinct(s) this scanner accepts ballots for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PrecinctSelection {
    AllPrecincts,
    SinglePrecinct { precinct_id: String },
}

impl PrecinctSelection {
    /// Whether a ballot printed for `precinct_id` is accepted here.
    pub fn allows(&self, precinct_id: &str) -> bool {
        match self {
            Self::AllPrecincts => true,
            Self::SinglePrecinct { precinct_id: selected } => selected == precinct_id,
        }
    }
}

/// Fill-score cutoffs for contest option targets.
///
/// `definite >= marginal` always holds; construction and deserialization both
/// enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMarkThresholds")]
pub struct MarkThresholds {
    pub marginal: f32,
    pub definite: f32,
}

#[derive(Deserialize)]
struct RawMarkThresholds {
    marginal: f32,
    definite: f32,
}

impl TryFrom<RawMarkThresholds> for MarkThresholds {
    type Error = BallotscanError;

    fn try_from(raw: RawMarkThresholds) -> Result<Self, Self::Error> {
        Self::new(raw.marginal, raw.definite)
    }
}

impl MarkThresholds {
    /// Thresholds used when an election does not define its own.
    pub const DEFAULT: MarkThresholds = MarkThresholds {
        marginal: 0.17,
        definite: 0.25,
    };

    pub fn new(marginal: f32, definite: f32) -> Result<Self, BallotscanError> {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if !in_range(marginal) || !in_range(definite) {
            return Err(BallotscanError::Validation(format!(
                "mark thresholds must lie in [0, 1], got marginal={marginal} definite={definite}"
            )));
        }
        if definite < marginal {
            return Err(BallotscanError::Validation(format!(
                "definite threshold {definite} is below marginal threshold {marginal}"
            )));
        }
        Ok(Self { marginal, definite })
    }
}

/// A rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Translate by a signed offset, clamping at the origin.
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: (self.x as i64 + dx as i64).max(0) as u32,
            y: (self.y as i64 + dy as i64).max(0) as u32,
            ..*self
        }
    }
}

/// A batch of sheets scanned between two polls/ballot-bag boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Summary row returned by batch status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: BatchId,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub count: u64,
}

/// One interpreted page plus the image files it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetPage {
    pub interpretation: PageInterpretation,
    pub original_filename: String,
    pub normalized_filename: String,
}

/// A sheet as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: SheetId,
    pub batch_id: BatchId,
    pub front: SheetPage,
    pub back: SheetPage,
    pub requires_adjudication: bool,
    pub finished_adjudication_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Classification of an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Will likely succeed on retry (device busy, feeder briefly empty).
    Transient,
    /// Requires operator intervention (jam, paper placement).
    UserAction,
    /// Will never succeed without a restart or a fix.
    Permanent,
}
