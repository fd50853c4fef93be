// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sheet-level verdict from a pair of page interpretations.

use ballotscan_core::interpretation::{
    AdjudicationReason, AdjudicationReasonInfo, InvalidSheetReason, PageInterpretation,
    SheetInterpretation,
};
use ballotscan_core::types::SheetOf;

fn enabled_reasons(page: &PageInterpretation) -> &[AdjudicationReasonInfo] {
    match page {
        PageInterpretation::InterpretedHmpbPage {
            adjudication_info, ..
        } => &adjudication_info.enabled_reason_infos,
        _ => &[],
    }
}

fn invalid(reason: InvalidSheetReason) -> SheetInterpretation {
    SheetInterpretation::InvalidSheet { reason }
}

/// Decide how the state machine routes a scanned sheet.
pub fn classify_sheet(pages: SheetOf<&PageInterpretation>) -> SheetInterpretation {
    use PageInterpretation as P;

    let (front, back) = (pages.front, pages.back);
    match (front, back) {
        (P::InterpretedBmdPage { .. }, P::BlankPage) | (P::BlankPage, P::InterpretedBmdPage { .. }) => {
            return SheetInterpretation::ValidSheet;
        }
        _ => {}
    }

    for page in [front, back] {
        match page {
            P::InvalidTestModePage { .. } => return invalid(InvalidSheetReason::InvalidTestMode),
            P::InvalidElectionHashPage { .. } => {
                return invalid(InvalidSheetReason::InvalidElectionHash);
            }
            P::InvalidPrecinctPage { .. } => return invalid(InvalidSheetReason::InvalidPrecinct),
            _ => {}
        }
    }

    if front.is_hmpb() && back.is_hmpb() {
        let is_blank = |info: &AdjudicationReasonInfo| info.kind() == AdjudicationReason::BlankBallot;
        let front_blank = enabled_reasons(front).iter().any(is_blank);
        let back_blank = enabled_reasons(back).iter().any(is_blank);

        let mut reasons: Vec<AdjudicationReasonInfo> = enabled_reasons(front)
            .iter()
            .chain(enabled_reasons(back))
            .filter(|info| !is_blank(info))
            .cloned()
            .collect();
        if front_blank && back_blank {
            reasons.push(AdjudicationReasonInfo::BlankBallot);
        }

        return if reasons.is_empty() {
            SheetInterpretation::ValidSheet
        } else {
            SheetInterpretation::NeedsReviewSheet { reasons }
        };
    }

    let unreadable = |page: &PageInterpretation| {
        matches!(page, P::UnreadablePage { .. } | P::UninterpretedHmpbPage { .. })
    };
    if unreadable(front) || unreadable(back) {
        return invalid(InvalidSheetReason::Unreadable);
    }

    invalid(InvalidSheetReason::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballotscan_core::interpretation::{
        AdjudicationInfo, BallotMetadata, BallotType, MarkInfo, VotesDict,
    };

    const ENABLED: &[AdjudicationReason] =
        &[AdjudicationReason::Overvote, AdjudicationReason::BlankBallot];

    fn metadata() -> BallotMetadata {
        BallotMetadata {
            election_hash: "0123456789abcdef0123".into(),
            precinct_id: "precinct-1".into(),
            ballot_style_id: "1".into(),
            ballot_type: BallotType::Standard,
            is_test_mode: true,
            page_number: Some(1),
        }
    }

    fn hmpb(reasons: Vec<AdjudicationReasonInfo>) -> PageInterpretation {
        PageInterpretation::InterpretedHmpbPage {
            metadata: metadata(),
            mark_info: MarkInfo {
                marks: vec![],
                ballot_width: 10,
                ballot_height: 10,
            },
            votes: VotesDict::new(),
            adjudication_info: AdjudicationInfo::from_reasons(reasons, ENABLED),
        }
    }

    fn overvote() -> AdjudicationReasonInfo {
        AdjudicationReasonInfo::Overvote {
            contest_id: "mayor".into(),
            option_ids: vec!["alice".into(), "bob".into()],
            expected: 1,
        }
    }

    fn bmd() -> PageInterpretation {
        PageInterpretation::InterpretedBmdPage {
            ballot_id: "id".into(),
            metadata: metadata(),
            votes: VotesDict::new(),
        }
    }

    fn classify(front: PageInterpretation, back: PageInterpretation) -> SheetInterpretation {
        classify_sheet(SheetOf::new(&front, &back))
    }

    #[test]
    fn bmd_with_blank_back_is_valid_either_way_round() {
        assert_eq!(classify(bmd(), PageInterpretation::BlankPage), SheetInterpretation::ValidSheet);
        assert_eq!(classify(PageInterpretation::BlankPage, bmd()), SheetInterpretation::ValidSheet);
    }

    #[test]
    fn invalid_pages_name_their_reason() {
        assert_eq!(
            classify(PageInterpretation::InvalidTestModePage { metadata: metadata() }, bmd()),
            invalid(InvalidSheetReason::InvalidTestMode)
        );
        assert_eq!(
            classify(
                PageInterpretation::BlankPage,
                PageInterpretation::InvalidElectionHashPage {
                    expected_election_hash: "a".into(),
                    actual_election_hash: "b".into(),
                }
            ),
            invalid(InvalidSheetReason::InvalidElectionHash)
        );
        assert_eq!(
            classify(hmpb(vec![]), PageInterpretation::InvalidPrecinctPage { metadata: metadata() }),
            invalid(InvalidSheetReason::InvalidPrecinct)
        );
    }

    #[test]
    fn clean_hmpb_pair_is_valid() {
        assert_eq!(classify(hmpb(vec![]), hmpb(vec![])), SheetInterpretation::ValidSheet);
    }

    #[test]
    fn hmpb_reasons_need_review() {
        let verdict = classify(hmpb(vec![overvote()]), hmpb(vec![AdjudicationReasonInfo::BlankBallot]));
        assert_eq!(
            verdict,
            SheetInterpretation::NeedsReviewSheet {
                reasons: vec![overvote()]
            }
        );
    }

    #[test]
    fn blank_ballot_needs_both_sides() {
        let one_side = classify(hmpb(vec![AdjudicationReasonInfo::BlankBallot]), hmpb(vec![]));
        assert_eq!(one_side, SheetInterpretation::ValidSheet);

        let both = classify(
            hmpb(vec![AdjudicationReasonInfo::BlankBallot]),
            hmpb(vec![AdjudicationReasonInfo::BlankBallot]),
        );
        assert_eq!(
            both,
            SheetInterpretation::NeedsReviewSheet {
                reasons: vec![AdjudicationReasonInfo::BlankBallot]
            }
        );
    }

    #[test]
    fn unreadable_and_leftovers() {
        assert_eq!(
            classify(PageInterpretation::UnreadablePage { reason: None }, hmpb(vec![])),
            invalid(InvalidSheetReason::Unreadable)
        );
        assert_eq!(
            classify(
                PageInterpretation::UninterpretedHmpbPage { metadata: metadata() },
                PageInterpretation::BlankPage
            ),
            invalid(InvalidSheetReason::Unreadable)
        );
        assert_eq!(
            classify(PageInterpretation::BlankPage, PageInterpretation::BlankPage),
            invalid(InvalidSheetReason::Unknown)
        );
        assert_eq!(classify(bmd(), bmd()), invalid(InvalidSheetReason::Unknown));
    }
}
