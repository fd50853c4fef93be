// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Whether a scanned sheet must go to a human for review.

use ballotscan_core::interpretation::{AdjudicationReason, PageInterpretation};
use ballotscan_core::types::SheetOf;

/// Page problems that send the whole sheet to review on their own.
fn requires_review_unless_blank(page: &PageInterpretation) -> bool {
    match page {
        PageInterpretation::UninterpretedHmpbPage { .. }
        | PageInterpretation::UnreadablePage { .. }
        | PageInterpretation::InvalidTestModePage { .. }
        | PageInterpretation::InvalidElectionHashPage { .. }
        | PageInterpretation::InvalidPrecinctPage { .. } => true,
        PageInterpretation::InterpretedHmpbPage {
            adjudication_info, ..
        } => {
            adjudication_info.requires_adjudication
                && !adjudication_info.has_enabled(AdjudicationReason::BlankBallot)
        }
        _ => false,
    }
}

/// A page that counts as blank for the both-sides rule.
///
/// An HMPB page with no targets at all is blank even when the election does
/// not enable `BlankBallot`.
fn is_blank(page: &PageInterpretation) -> bool {
    match page {
        PageInterpretation::BlankPage => true,
        PageInterpretation::InterpretedHmpbPage {
            mark_info,
            adjudication_info,
            ..
        } => {
            mark_info.marks.is_empty()
                || (adjudication_info.requires_adjudication
                    && adjudication_info.has_enabled(AdjudicationReason::BlankBallot))
        }
        _ => false,
    }
}

/// Decide whether a front/back pair needs adjudication.
///
/// Non-blank problems on either page are enough. Blankness only counts when
/// both pages are blank.
pub fn sheet_requires_adjudication(pages: SheetOf<&PageInterpretation>) -> bool {
    let (front, back) = (pages.front, pages.back);
    if front.is_bmd() || back.is_bmd() {
        return false;
    }

    if requires_review_unless_blank(front) || requires_review_unless_blank(back) {
        return true;
    }

    if front.is_hmpb() != back.is_hmpb() {
        return true;
    }

    is_blank(front) && is_blank(back)
}
