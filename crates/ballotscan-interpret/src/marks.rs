// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Mark scoring, vote extraction and per-page adjudication reasons for
// hand-marked pages.

use ballotscan_core::election::{Contest, Election, YesNo};
use ballotscan_core::error::Result;
use ballotscan_core::interpretation::{AdjudicationReasonInfo, BallotMark, MarkStatus, VotesDict};
use ballotscan_core::layout::BallotPageLayout;
use ballotscan_core::types::{MarkThresholds, Rect};
use ballotscan_image::{PixelBuffer, diff, fill_ratio};

use crate::align::AlignedPage;

/// Diff luminosity below which a pixel counts as ink added to the template.
pub const ADDED_INK_THRESHOLD: u8 = 192;

/// Fraction of a write-in area that must carry new ink to count as writing.
pub const WRITE_IN_AREA_MIN_FILL: f32 = 0.05;

/// Fraction of `template_bounds` covered by ink the scan added.
fn added_ink(template: &PixelBuffer, aligned: &AlignedPage, template_bounds: Rect) -> Result<f32> {
    let page_bounds = aligned.map_bounds(template_bounds);
    let delta = diff(template, &aligned.image, template_bounds, page_bounds)?;
    Ok(fill_ratio(&delta, delta.bounds(), ADDED_INK_THRESHOLD)?.clamp(0.0, 1.0))
}

/// Score every option target on the page, in layout order.
pub fn score_marks(
    template: &PixelBuffer,
    aligned: &AlignedPage,
    layout: &BallotPageLayout,
) -> Result<Vec<BallotMark>> {
    let mut marks = Vec::new();
    for contest in &layout.contests {
        for option in &contest.options {
            marks.push(BallotMark {
                contest_id: contest.contest_id.clone(),
                option_id: option.option_id.clone(),
                bounds: aligned.map_bounds(option.bounds),
                score: added_ink(template, aligned, option.bounds)?,
            });
        }
    }
    Ok(marks)
}

/// Write-in options whose handwriting area carries ink.
pub fn written_in_options(
    template: &PixelBuffer,
    aligned: &AlignedPage,
    layout: &BallotPageLayout,
) -> Result<Vec<(String, String)>> {
    let mut written = Vec::new();
    for contest in &layout.contests {
        for option in &contest.options {
            let Some(area) = option.write_in_area else {
                continue;
            };
            if added_ink(template, aligned, area)? >= WRITE_IN_AREA_MIN_FILL {
                written.push((contest.contest_id.clone(), option.option_id.clone()));
            }
        }
    }
    Ok(written)
}

pub fn mark_status(score: f32, thresholds: &MarkThresholds) -> MarkStatus {
    if score >= thresholds.definite {
        MarkStatus::Marked
    } else if score >= thresholds.marginal {
        MarkStatus::Marginal
    } else {
        MarkStatus::Unmarked
    }
}

/// Status of `option_id` in `contest_id`.
///
/// Either/neither sub-contests have no targets of their own: a `"yes"` or
/// `"no"` on a sub-contest resolves to the shared physical target recorded
/// under the parent measure.
pub fn option_mark_status(
    election: &Election,
    thresholds: &MarkThresholds,
    marks: &[BallotMark],
    contest_id: &str,
    option_id: &str,
) -> MarkStatus {
    let direct = marks
        .iter()
        .find(|m| m.contest_id == contest_id && m.option_id == option_id);
    if let Some(mark) = direct {
        return mark_status(mark.score, thresholds);
    }

    let choice = match option_id {
        "yes" => YesNo::Yes,
        "no" => YesNo::No,
        _ => return MarkStatus::Unmarked,
    };
    election
        .contests
        .iter()
        .filter_map(|c| match c {
            Contest::EitherNeither(en) => Some(en),
            _ => None,
        })
        .find_map(|en| {
            let physical = en.physical_option(contest_id, choice)?;
            marks
                .iter()
                .find(|m| m.contest_id == en.id && m.option_id == physical.id)
        })
        .map_or(MarkStatus::Unmarked, |mark| mark_status(mark.score, thresholds))
}

/// One vote-recording unit: a contest, or one side of an either/neither
/// measure. Yields (recorded contest id, selectable option ids, seats).
fn vote_units(contest: &Contest) -> Vec<(String, Vec<String>, u32)> {
    match contest {
        Contest::Candidate(c) => vec![(c.id.clone(), contest.target_option_ids(), c.seats)],
        Contest::YesNo(c) => vec![(c.id.clone(), contest.target_option_ids(), 1)],
        Contest::EitherNeither(en) => {
            let yes_no = vec![YesNo::Yes.as_str().to_owned(), YesNo::No.as_str().to_owned()];
            vec![
                (en.either_neither_contest_id.clone(), yes_no.clone(), 1),
                (en.pick_one_contest_id.clone(), yes_no, 1),
            ]
        }
    }
}

/// Contests on this page, in layout order, resolved against the election.
fn page_contests<'a>(election: &'a Election, layout: &BallotPageLayout) -> Vec<&'a Contest> {
    layout
        .contests
        .iter()
        .filter_map(|c| election.contest(&c.contest_id))
        .collect()
}

/// Votes on a page: every contest on the page gets an entry, possibly empty.
pub fn page_votes(
    election: &Election,
    thresholds: &MarkThresholds,
    layout: &BallotPageLayout,
    marks: &[BallotMark],
) -> VotesDict {
    let mut votes = VotesDict::new();
    for contest in page_contests(election, layout) {
        for (contest_id, options, _) in vote_units(contest) {
            let selected = options
                .into_iter()
                .filter(|option| {
                    option_mark_status(election, thresholds, marks, &contest_id, option)
                        == MarkStatus::Marked
                })
                .collect();
            votes.insert(contest_id, selected);
        }
    }
    votes
}

/// Every adjudication reason found on a page, before election policy
/// splits them into enabled and ignored.
pub fn page_adjudication_reasons(
    election: &Election,
    thresholds: &MarkThresholds,
    layout: &BallotPageLayout,
    marks: &[BallotMark],
    written_in: &[(String, String)],
) -> Vec<AdjudicationReasonInfo> {
    let mut reasons = Vec::new();
    let mut any_marked = false;

    for contest in page_contests(election, layout) {
        for (contest_id, options, seats) in vote_units(contest) {
            let mut marked = Vec::new();
            for option in &options {
                match option_mark_status(election, thresholds, marks, &contest_id, option) {
                    MarkStatus::Marked => marked.push(option.clone()),
                    MarkStatus::Marginal => reasons.push(AdjudicationReasonInfo::MarginalMark {
                        contest_id: contest_id.clone(),
                        option_id: option.clone(),
                    }),
                    MarkStatus::Unmarked => {}
                }
            }
            any_marked |= !marked.is_empty();

            let count = marked.len() as u32;
            if count > seats {
                reasons.push(AdjudicationReasonInfo::Overvote {
                    contest_id: contest_id.clone(),
                    option_ids: marked.clone(),
                    expected: seats,
                });
            } else if count < seats {
                reasons.push(AdjudicationReasonInfo::Undervote {
                    contest_id: contest_id.clone(),
                    option_ids: marked.clone(),
                    expected: seats,
                });
            }

            for option_id in marked.iter().filter(|id| id.starts_with("write-in-")) {
                reasons.push(AdjudicationReasonInfo::WriteIn {
                    contest_id: contest_id.clone(),
                    option_id: option_id.clone(),
                });
            }
            for (written_contest, option_id) in written_in {
                if *written_contest == contest_id && !marked.contains(option_id) {
                    reasons.push(AdjudicationReasonInfo::UnmarkedWriteIn {
                        contest_id: contest_id.clone(),
                        option_id: option_id.clone(),
                    });
                }
            }
        }
    }

    if !any_marked {
        reasons.push(AdjudicationReasonInfo::BlankBallot);
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr::fixtures::election;
    use ballotscan_core::layout::{ContestLayout, OptionLayout};

    const THRESHOLDS: MarkThresholds = MarkThresholds {
        marginal: 0.17,
        definite: 0.25,
    };

    fn mark(contest_id: &str, option_id: &str, score: f32) -> BallotMark {
        BallotMark {
            contest_id: contest_id.into(),
            option_id: option_id.into(),
            bounds: Rect::new(0, 0, 1, 1),
            score,
        }
    }

    fn layout(contests: Vec<(&str, Vec<&str>)>) -> BallotPageLayout {
        BallotPageLayout {
            ballot_style_id: "1".into(),
            precinct_id: "precinct-1".into(),
            page_number: 1,
            is_test_mode: true,
            width: 100,
            height: 100,
            contests: contests
                .into_iter()
                .map(|(id, options)| ContestLayout {
                    contest_id: id.to_string(),
                    options: options
                        .into_iter()
                        .map(|o| OptionLayout {
                            option_id: o.to_string(),
                            bounds: Rect::new(0, 0, 1, 1),
                            write_in_area: None,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn status_follows_thresholds() {
        assert_eq!(mark_status(0.25, &THRESHOLDS), MarkStatus::Marked);
        assert_eq!(mark_status(0.2, &THRESHOLDS), MarkStatus::Marginal);
        assert_eq!(mark_status(0.17, &THRESHOLDS), MarkStatus::Marginal);
        assert_eq!(mark_status(0.1, &THRESHOLDS), MarkStatus::Unmarked);
    }

    #[test]
    fn either_neither_sub_contests_resolve_to_shared_targets() {
        let def = election();
        let marks = vec![
            mark("measure-3", "either", 0.1),
            mark("measure-3", "neither", 0.9),
            mark("measure-3", "3a", 0.2),
            mark("measure-3", "3b", 0.0),
        ];
        let status = |contest: &str, option: &str| {
            option_mark_status(&def.election, &THRESHOLDS, &marks, contest, option)
        };

        assert_eq!(status("measure-3-either-neither", "yes"), MarkStatus::Unmarked);
        assert_eq!(status("measure-3-either-neither", "no"), MarkStatus::Marked);
        assert_eq!(status("measure-3-pick-one", "yes"), MarkStatus::Marginal);
        assert_eq!(status("measure-3-pick-one", "no"), MarkStatus::Unmarked);
        assert_eq!(status("measure-3", "neither"), MarkStatus::Marked);
        assert_eq!(status("prop-1", "yes"), MarkStatus::Unmarked);
    }

    #[test]
    fn votes_cover_every_contest_on_the_page() {
        let def = election();
        let page = layout(vec![
            ("mayor", vec!["alice", "bob", "write-in-0"]),
            ("measure-3", vec!["either", "neither", "3a", "3b"]),
        ]);
        let marks = vec![
            mark("mayor", "bob", 0.8),
            mark("measure-3", "either", 0.5),
            mark("measure-3", "3b", 0.6),
        ];
        let votes = page_votes(&def.election, &THRESHOLDS, &page, &marks);

        assert_eq!(votes["mayor"], vec!["bob".to_string()]);
        assert_eq!(votes["measure-3-either-neither"], vec!["yes".to_string()]);
        assert_eq!(votes["measure-3-pick-one"], vec!["no".to_string()]);
        assert!(!votes.contains_key("prop-1"));
        assert!(!votes.contains_key("measure-3"));
    }

    #[test]
    fn reasons_cover_overvote_marginal_and_write_in() {
        let def = election();
        let page = layout(vec![
            ("mayor", vec!["alice", "bob", "write-in-0"]),
            ("prop-1", vec!["yes", "no"]),
        ]);
        let marks = vec![
            mark("mayor", "alice", 0.9),
            mark("mayor", "write-in-0", 0.9),
            mark("prop-1", "yes", 0.2),
        ];
        let reasons = page_adjudication_reasons(&def.election, &THRESHOLDS, &page, &marks, &[]);

        assert!(reasons.contains(&AdjudicationReasonInfo::Overvote {
            contest_id: "mayor".into(),
            option_ids: vec!["alice".into(), "write-in-0".into()],
            expected: 1,
        }));
        assert!(reasons.contains(&AdjudicationReasonInfo::WriteIn {
            contest_id: "mayor".into(),
            option_id: "write-in-0".into(),
        }));
        assert!(reasons.contains(&AdjudicationReasonInfo::MarginalMark {
            contest_id: "prop-1".into(),
            option_id: "yes".into(),
        }));
        assert!(reasons.contains(&AdjudicationReasonInfo::Undervote {
            contest_id: "prop-1".into(),
            option_ids: vec![],
            expected: 1,
        }));
        assert!(!reasons.contains(&AdjudicationReasonInfo::BlankBallot));
    }

    #[test]
    fn unmarked_page_is_blank_and_reports_unmarked_write_in() {
        let def = election();
        let page = layout(vec![("mayor", vec!["alice", "bob", "write-in-0"])]);
        let written = vec![("mayor".to_string(), "write-in-0".to_string())];
        let reasons = page_adjudication_reasons(&def.election, &THRESHOLDS, &page, &[], &written);

        assert!(reasons.contains(&AdjudicationReasonInfo::BlankBallot));
        assert!(reasons.contains(&AdjudicationReasonInfo::UnmarkedWriteIn {
            contest_id: "mayor".into(),
            option_id: "write-in-0".into(),
        }));
    }

    #[test]
    fn scoring_measures_added_ink_only() {
        let mut template = PixelBuffer::filled(60, 60, 1, 255).expect("template");
        // printed outline of the target at (10,10)-(20,20)
        for i in 10..20 {
            for (x, y) in [(i, 10), (i, 19), (10, i), (19, i)] {
                template.set_luminosity(x, y, 0);
            }
        }
        let mut scan = template.clone();
        for y in 11..19 {
            for x in 11..19 {
                scan.set_luminosity(x, y, 20);
            }
        }
        let aligned = AlignedPage {
            image: scan,
            offset: (0, 0),
            rotated: false,
        };
        let mut page = layout(vec![("prop-1", vec!["yes", "no"])]);
        page.contests[0].options[0].bounds = Rect::new(10, 10, 10, 10);
        page.contests[0].options[1].bounds = Rect::new(40, 40, 10, 10);

        let marks = score_marks(&template, &aligned, &page).expect("score");
        assert!((marks[0].score - 0.64).abs() < 1e-6, "interior 8x8 of 10x10");
        assert_eq!(marks[1].score, 0.0);
    }
}
