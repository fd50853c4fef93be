// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Hand-marked ballot page layouts: where each contest option's target sits on
// a template page.

use serde::{Deserialize, Serialize};

use crate::types::Rect;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLayout {
    pub option_id: String,
    /// Target box in template pixel coordinates.
    pub bounds: Rect,
    /// Handwriting area next to a write-in target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_in_area: Option<Rect>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestLayout {
    pub contest_id: String,
    pub options: Vec<OptionLayout>,
}

/// One template page of a ballot style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotPageLayout {
    pub ballot_style_id: String,
    pub precinct_id: String,
    pub page_number: u8,
    pub is_test_mode: bool,
    pub width: u32,
    pub height: u32,
    pub contests: Vec<ContestLayout>,
}

impl BallotPageLayout {
    /// Whether this template matches a decoded page.
    pub fn matches(&self, ballot_style_id: &str, precinct_id: &str, page_number: u8) -> bool {
        self.ballot_style_id == ballot_style_id
            && self.precinct_id == precinct_id
            && self.page_number == page_number
    }
}
