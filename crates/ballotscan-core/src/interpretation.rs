// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page and sheet interpretation results.
//
// Interpretations are immutable once produced. Anything that leaves the
// process for audit purposes must go through `type_name()` so that vote
// content is never logged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Rect;

/// Votes keyed by contest id, each a list of selected option ids.
pub type VotesDict = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotType {
    Standard,
    Absentee,
    Provisional,
}

/// Identifying data printed on every ballot page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotMetadata {
    /// Election hash prefix as printed on the ballot.
    pub election_hash: String,
    pub precinct_id: String,
    pub ballot_style_id: String,
    pub ballot_type: BallotType,
    pub is_test_mode: bool,
    /// Present on hand-marked pages only.
    pub page_number: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    Marked,
    Marginal,
    Unmarked,
}

/// A scored contest option target on a hand-marked page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotMark {
    pub contest_id: String,
    pub option_id: String,
    /// Target location after alignment.
    pub bounds: Rect,
    /// Fill ratio in `[0, 1]`.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkInfo {
    pub marks: Vec<BallotMark>,
    pub ballot_width: u32,
    pub ballot_height: u32,
}

/// Kinds of adjudication reasons an election can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjudicationReason {
    UninterpretableBallot,
    MarginalMark,
    Overvote,
    Undervote,
    WriteIn,
    UnmarkedWriteIn,
    BlankBallot,
}

/// One concrete reason found on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AdjudicationReasonInfo {
    UninterpretableBallot,
    MarginalMark {
        contest_id: String,
        option_id: String,
    },
    Overvote {
        contest_id: String,
        option_ids: Vec<String>,
        expected: u32,
    },
    Undervote {
        contest_id: String,
        option_ids: Vec<String>,
        expected: u32,
    },
    WriteIn {
        contest_id: String,
        option_id: String,
    },
    /// Write-in area has ink but its target is unmarked.
    UnmarkedWriteIn {
        contest_id: String,
        option_id: String,
    },
    BlankBallot,
}

impl AdjudicationReasonInfo {
    pub fn kind(&self) -> AdjudicationReason {
        match self {
            Self::UninterpretableBallot => AdjudicationReason::UninterpretableBallot,
            Self::MarginalMark { .. } => AdjudicationReason::MarginalMark,
            Self::Overvote { .. } => AdjudicationReason::Overvote,
            Self::Undervote { .. } => AdjudicationReason::Undervote,
            Self::WriteIn { .. } => AdjudicationReason::WriteIn,
            Self::UnmarkedWriteIn { .. } => AdjudicationReason::UnmarkedWriteIn,
            Self::BlankBallot => AdjudicationReason::BlankBallot,
        }
    }
}

/// Adjudication findings for one hand-marked page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationInfo {
    pub requires_adjudication: bool,
    pub enabled_reasons: Vec<AdjudicationReason>,
    pub enabled_reason_infos: Vec<AdjudicationReasonInfo>,
    pub ignored_reason_infos: Vec<AdjudicationReasonInfo>,
}

impl AdjudicationInfo {
    /// Split `reasons` by whether the election enables their kind.
    pub fn from_reasons(
        reasons: Vec<AdjudicationReasonInfo>,
        enabled: &[AdjudicationReason],
    ) -> Self {
        let (enabled_reason_infos, ignored_reason_infos): (Vec<_>, Vec<_>) = reasons
            .into_iter()
            .partition(|info| enabled.contains(&info.kind()));
        Self {
            requires_adjudication: !enabled_reason_infos.is_empty(),
            enabled_reasons: enabled.to_vec(),
            enabled_reason_infos,
            ignored_reason_infos,
        }
    }

    pub fn has_enabled(&self, kind: AdjudicationReason) -> bool {
        self.enabled_reason_infos.iter().any(|info| info.kind() == kind)
    }
}

/// Result of interpreting one page image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageInterpretation {
    InterpretedBmdPage {
        ballot_id: String,
        metadata: BallotMetadata,
        votes: VotesDict,
    },
    InterpretedHmpbPage {
        metadata: BallotMetadata,
        mark_info: MarkInfo,
        votes: VotesDict,
        adjudication_info: AdjudicationInfo,
    },
    UninterpretedHmpbPage {
        metadata: BallotMetadata,
    },
    InvalidElectionHashPage {
        expected_election_hash: String,
        actual_election_hash: String,
    },
    InvalidTestModePage {
        metadata: BallotMetadata,
    },
    InvalidPrecinctPage {
        metadata: BallotMetadata,
    },
    BlankPage,
    UnreadablePage {
        reason: Option<String>,
    },
}

impl PageInterpretation {
    /// Variant name, safe to log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::InterpretedBmdPage { .. } => "InterpretedBmdPage",
            Self::InterpretedHmpbPage { .. } => "InterpretedHmpbPage",
            Self::UninterpretedHmpbPage { .. } => "UninterpretedHmpbPage",
            Self::InvalidElectionHashPage { .. } => "InvalidElectionHashPage",
            Self::InvalidTestModePage { .. } => "InvalidTestModePage",
            Self::InvalidPrecinctPage { .. } => "InvalidPrecinctPage",
            Self::BlankPage => "BlankPage",
            Self::UnreadablePage { .. } => "UnreadablePage",
        }
    }

    pub fn is_hmpb(&self) -> bool {
        matches!(self, Self::InterpretedHmpbPage { .. })
    }

    pub fn is_bmd(&self) -> bool {
        matches!(self, Self::InterpretedBmdPage { .. })
    }

    pub fn metadata(&self) -> Option<&BallotMetadata> {
        match self {
            Self::InterpretedBmdPage { metadata, .. }
            | Self::InterpretedHmpbPage { metadata, .. }
            | Self::UninterpretedHmpbPage { metadata }
            | Self::InvalidTestModePage { metadata }
            | Self::InvalidPrecinctPage { metadata } => Some(metadata),
            _ => None,
        }
    }

    pub fn votes(&self) -> Option<&VotesDict> {
        match self {
            Self::InterpretedBmdPage { votes, .. } | Self::InterpretedHmpbPage { votes, .. } => {
                Some(votes)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidSheetReason {
    InvalidTestMode,
    InvalidElectionHash,
    InvalidPrecinct,
    Unreadable,
    Unknown,
}

/// Verdict for a whole sheet, used to route it through the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SheetInterpretation {
    ValidSheet,
    InvalidSheet { reason: InvalidSheetReason },
    NeedsReviewSheet { reasons: Vec<AdjudicationReasonInfo> },
}

impl SheetInterpretation {
    /// Variant name, safe to log.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ValidSheet => "ValidSheet",
            Self::InvalidSheet { .. } => "InvalidSheet",
            Self::NeedsReviewSheet { .. } => "NeedsReviewSheet",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_interpretation_uses_type_tag() {
        let json = serde_json::to_value(PageInterpretation::BlankPage).expect("serialize");
        assert_eq!(json["type"], "BlankPage");

        let unreadable: PageInterpretation =
            serde_json::from_str(r#"{"type":"UnreadablePage","reason":"no QR"}"#).expect("parse");
        assert_eq!(unreadable.type_name(), "UnreadablePage");
    }

    #[test]
    fn adjudication_info_partitions_by_enabled_kind() {
        let info = AdjudicationInfo::from_reasons(
            vec![
                AdjudicationReasonInfo::Undervote {
                    contest_id: "mayor".into(),
                    option_ids: vec![],
                    expected: 1,
                },
                AdjudicationReasonInfo::Overvote {
                    contest_id: "council".into(),
                    option_ids: vec!["a".into(), "b".into()],
                    expected: 1,
                },
            ],
            &[AdjudicationReason::Overvote],
        );

        assert!(info.requires_adjudication);
        assert_eq!(info.enabled_reason_infos.len(), 1);
        assert_eq!(info.ignored_reason_infos.len(), 1);
        assert!(info.has_enabled(AdjudicationReason::Overvote));
        assert!(!info.has_enabled(AdjudicationReason::Undervote));
    }

    #[test]
    fn only_ignored_reasons_do_not_require_adjudication() {
        let info = AdjudicationInfo::from_reasons(
            vec![AdjudicationReasonInfo::BlankBallot],
            &[AdjudicationReason::Overvote],
        );
        assert!(!info.requires_adjudication);
    }

    #[test]
    fn sheet_interpretation_serializes_reason() {
        let sheet = SheetInterpretation::InvalidSheet {
            reason: InvalidSheetReason::InvalidPrecinct,
        };
        let json = serde_json::to_value(&sheet).expect("serialize");
        assert_eq!(json["type"], "InvalidSheet");
        assert_eq!(json["reason"], "invalid_precinct");
    }
}
