// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page interpreter: turns one scanned page plus its QR payload into a
// `PageInterpretation`, and a scanned sheet into a routed sheet verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use ballotscan_core::election::ElectionDefinition;
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::interpretation::{
    AdjudicationInfo, AdjudicationReason, MarkInfo, PageInterpretation,
};
use ballotscan_core::layout::BallotPageLayout;
use ballotscan_core::types::{MarkThresholds, PrecinctSelection, SheetId, SheetOf, SheetPage};
use ballotscan_image::{PixelBuffer, decode_grayscale, ink_blob_count, load_grayscale, write_png};

use crate::adjudication::sheet_requires_adjudication;
use crate::align::align_to_template;
use crate::marks::{page_adjudication_reasons, page_votes, score_marks, written_in_options};
use crate::pool::InterpretResponse;
use crate::qr::{
    QrCodeDetector, SidecarQrDetector, decode_bmd_ballot, decode_election_hash,
    decode_hmpb_metadata, is_bmd_payload,
};
use crate::sheet::classify_sheet;

/// Luminosity below which a pixel is ink for blank-page detection.
const BLANK_INK_THRESHOLD: u8 = 128;
/// Smallest connected ink area that counts as content rather than dust.
const BLANK_MIN_BLOB_AREA: u32 = 16;

/// Everything an interpreter needs, fixed for the life of one election load.
#[derive(Debug, Clone)]
pub struct InterpreterOptions {
    pub election_definition: ElectionDefinition,
    pub precinct_selection: PrecinctSelection,
    pub test_mode: bool,
    pub mark_threshold_overrides: Option<MarkThresholds>,
    pub skip_election_hash_check: bool,
    pub adjudication_reasons: Vec<AdjudicationReason>,
    /// Page layouts with their PNG template images.
    pub templates: Vec<(BallotPageLayout, Vec<u8>)>,
}

struct Template {
    layout: BallotPageLayout,
    image: PixelBuffer,
}

/// Result of interpreting one page image.
#[derive(Debug, Clone)]
pub struct InterpretFileResult {
    pub interpretation: PageInterpretation,
    /// Template-aligned page, for hand-marked pages only.
    pub normalized_image: Option<PixelBuffer>,
}

impl From<PageInterpretation> for InterpretFileResult {
    fn from(interpretation: PageInterpretation) -> Self {
        Self {
            interpretation,
            normalized_image: None,
        }
    }
}

pub struct Interpreter {
    election_definition: ElectionDefinition,
    precinct_selection: PrecinctSelection,
    test_mode: bool,
    mark_thresholds: MarkThresholds,
    skip_election_hash_check: bool,
    adjudication_reasons: Vec<AdjudicationReason>,
    templates: Vec<Template>,
    detector: Arc<dyn QrCodeDetector>,
}

impl Interpreter {
    /// Build an interpreter that reads QR payloads from sidecar files.
    pub fn new(options: InterpreterOptions) -> Result<Self> {
        Self::with_detector(options, Arc::new(SidecarQrDetector))
    }

    pub fn with_detector(
        options: InterpreterOptions,
        detector: Arc<dyn QrCodeDetector>,
    ) -> Result<Self> {
        let mark_thresholds = options
            .mark_threshold_overrides
            .or(options.election_definition.election.mark_thresholds)
            .ok_or_else(|| BallotscanError::Configuration("missing mark thresholds".into()))?;

        let mut templates = Vec::new();
        for (layout, png) in options.templates {
            if layout.is_test_mode != options.test_mode {
                debug!(
                    ballot_style_id = %layout.ballot_style_id,
                    page_number = layout.page_number,
                    template_test_mode = layout.is_test_mode,
                    "template test mode differs from scanner, skipping"
                );
                continue;
            }
            let image = decode_grayscale(&png)?;
            if (image.width(), image.height()) != (layout.width, layout.height) {
                return Err(BallotscanError::Configuration(format!(
                    "template for ballot style {} page {} is {}x{}, layout expects {}x{}",
                    layout.ballot_style_id,
                    layout.page_number,
                    image.width(),
                    image.height(),
                    layout.width,
                    layout.height
                )));
            }
            templates.push(Template { layout, image });
        }
        info!(
            templates = templates.len(),
            test_mode = options.test_mode,
            "interpreter ready"
        );

        Ok(Self {
            election_definition: options.election_definition,
            precinct_selection: options.precinct_selection,
            test_mode: options.test_mode,
            mark_thresholds,
            skip_election_hash_check: options.skip_election_hash_check,
            adjudication_reasons: options.adjudication_reasons,
            templates,
            detector,
        })
    }

    pub fn mark_thresholds(&self) -> MarkThresholds {
        self.mark_thresholds
    }

    /// Interpret one page. `qr` is the raw payload found on the page, if any.
    pub fn interpret_file(&self, image: &PixelBuffer, qr: Option<&[u8]>) -> Result<InterpretFileResult> {
        if ink_blob_count(image, BLANK_INK_THRESHOLD, BLANK_MIN_BLOB_AREA)? == 0 {
            return Ok(PageInterpretation::BlankPage.into());
        }

        let Some(qr) = qr else {
            return Ok(PageInterpretation::UnreadablePage {
                reason: Some("No QR code found".into()),
            }
            .into());
        };

        if !self.skip_election_hash_check {
            let expected = self.election_definition.election_hash_prefix().to_owned();
            let actual = decode_election_hash(qr).unwrap_or_else(|| "not found".into());
            debug!(%actual, %expected, "comparing election hash");
            if actual != expected {
                return Ok(PageInterpretation::InvalidElectionHashPage {
                    expected_election_hash: expected,
                    actual_election_hash: actual,
                }
                .into());
            }
        }

        if is_bmd_payload(qr) {
            return Ok(self.interpret_bmd(qr).into());
        }

        match self.interpret_hmpb(image, qr) {
            Ok(result) => {
                let allowed = result
                    .interpretation
                    .metadata()
                    .is_some_and(|m| self.precinct_selection.allows(&m.precinct_id));
                if allowed {
                    return Ok(result);
                }
                if let Some(metadata) = result.interpretation.metadata() {
                    return Ok(PageInterpretation::InvalidPrecinctPage {
                        metadata: metadata.clone(),
                    }
                    .into());
                }
            }
            Err(e) => debug!(error = %e, "hand-marked interpretation failed"),
        }

        let interpretation = match decode_hmpb_metadata(&self.election_definition.election, qr) {
            Ok(metadata) if metadata.is_test_mode != self.test_mode => {
                debug!(
                    ballot_test_mode = metadata.is_test_mode,
                    scanner_test_mode = self.test_mode,
                    "hand-marked ballot test mode mismatch"
                );
                PageInterpretation::InvalidTestModePage { metadata }
            }
            Ok(metadata) => PageInterpretation::UninterpretedHmpbPage { metadata },
            Err(e) => PageInterpretation::UnreadablePage {
                reason: Some(e.to_string()),
            },
        };
        Ok(interpretation.into())
    }

    fn interpret_bmd(&self, qr: &[u8]) -> PageInterpretation {
        let ballot = match decode_bmd_ballot(&self.election_definition.election, qr) {
            Ok(ballot) => ballot,
            Err(e) => {
                return PageInterpretation::UnreadablePage {
                    reason: Some(e.to_string()),
                };
            }
        };
        if ballot.metadata.is_test_mode != self.test_mode {
            return PageInterpretation::InvalidTestModePage {
                metadata: ballot.metadata,
            };
        }
        if !self.precinct_selection.allows(&ballot.metadata.precinct_id) {
            return PageInterpretation::InvalidPrecinctPage {
                metadata: ballot.metadata,
            };
        }
        PageInterpretation::InterpretedBmdPage {
            ballot_id: ballot.ballot_id,
            metadata: ballot.metadata,
            votes: ballot.votes,
        }
    }

    fn interpret_hmpb(&self, image: &PixelBuffer, qr: &[u8]) -> Result<InterpretFileResult> {
        let election = &self.election_definition.election;
        let metadata = decode_hmpb_metadata(election, qr)?;
        let page_number = metadata.page_number.unwrap_or(1);
        let template = self
            .templates
            .iter()
            .find(|t| {
                t.layout.is_test_mode == metadata.is_test_mode
                    && t.layout.matches(&metadata.ballot_style_id, &metadata.precinct_id, page_number)
            })
            .ok_or_else(|| {
                BallotscanError::Interpretation(format!(
                    "no template for ballot style {} precinct {} page {page_number}",
                    metadata.ballot_style_id, metadata.precinct_id
                ))
            })?;

        let aligned = align_to_template(image, &template.image)?;
        let marks = score_marks(&template.image, &aligned, &template.layout)?;
        let written_in = written_in_options(&template.image, &aligned, &template.layout)?;
        let votes = page_votes(election, &self.mark_thresholds, &template.layout, &marks);
        let reasons = page_adjudication_reasons(
            election,
            &self.mark_thresholds,
            &template.layout,
            &marks,
            &written_in,
        );
        let adjudication_info = AdjudicationInfo::from_reasons(reasons, &self.adjudication_reasons);
        for info in &adjudication_info.enabled_reason_infos {
            debug!(reason = ?info.kind(), "adjudication required");
        }

        Ok(InterpretFileResult {
            interpretation: PageInterpretation::InterpretedHmpbPage {
                metadata,
                mark_info: MarkInfo {
                    marks,
                    ballot_width: aligned.image.width(),
                    ballot_height: aligned.image.height(),
                },
                votes,
                adjudication_info,
            },
            normalized_image: Some(aligned.image),
        })
    }

    /// Interpret both sides of a scanned sheet, writing normalized images of
    /// hand-marked pages into `output_dir`.
    #[instrument(skip_all, fields(sheet_id = %sheet_id))]
    pub fn interpret_sheet(
        &self,
        sheet_id: SheetId,
        images: &SheetOf<PathBuf>,
        output_dir: &Path,
    ) -> Result<InterpretResponse> {
        let front = self.interpret_page(sheet_id, "front", &images.front, output_dir)?;
        let back = self.interpret_page(sheet_id, "back", &images.back, output_dir)?;
        let pages = SheetOf::new(front, back);

        let interpretations = SheetOf::new(&pages.front.interpretation, &pages.back.interpretation);
        let interpretation = classify_sheet(interpretations.clone());
        let requires_adjudication = sheet_requires_adjudication(interpretations);
        info!(
            front = pages.front.interpretation.type_name(),
            back = pages.back.interpretation.type_name(),
            verdict = interpretation.type_name(),
            requires_adjudication,
            "sheet interpreted"
        );

        Ok(InterpretResponse {
            sheet_id,
            interpretation,
            pages,
            requires_adjudication,
        })
    }

    fn interpret_page(
        &self,
        sheet_id: SheetId,
        side: &str,
        path: &Path,
        output_dir: &Path,
    ) -> Result<SheetPage> {
        let image = load_grayscale(path)?;
        let qr = self.detector.detect(path, &image)?;
        let result = self.interpret_file(&image, qr.as_deref())?;

        let original_filename = path.display().to_string();
        let normalized_filename = match result.normalized_image {
            Some(normalized) => {
                let out = output_dir.join(format!("{sheet_id}-{side}-normalized.png"));
                write_png(&normalized, &out)?;
                out.display().to_string()
            }
            None => original_filename.clone(),
        };

        Ok(SheetPage {
            interpretation: result.interpretation,
            original_filename,
            normalized_filename,
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use ballotscan_core::interpretation::{BallotMetadata, BallotType};
    use ballotscan_core::layout::{ContestLayout, OptionLayout};
    use ballotscan_core::types::Rect;
    use ballotscan_image::encode_png;

    use crate::qr::fixtures::election;
    use crate::qr::{BmdBallot, encode_bmd_ballot, encode_hmpb_metadata, sidecar_path};

    pub const WIDTH: u32 = 200;
    pub const HEIGHT: u32 = 260;

    fn target(option_id: &str, y: u32) -> OptionLayout {
        OptionLayout {
            option_id: option_id.into(),
            bounds: Rect::new(20, y, 16, 16),
            write_in_area: None,
        }
    }

    /// Page 1 carries mayor and prop-1, page 2 carries measure-3.
    pub fn layout(page_number: u8, is_test_mode: bool) -> BallotPageLayout {
        let contests = if page_number == 1 {
            let mut write_in = target("write-in-0", 110);
            write_in.write_in_area = Some(Rect::new(50, 110, 120, 16));
            vec![
                ContestLayout {
                    contest_id: "mayor".into(),
                    options: vec![target("alice", 50), target("bob", 80), write_in],
                },
                ContestLayout {
                    contest_id: "prop-1".into(),
                    options: vec![target("yes", 170), target("no", 200)],
                },
            ]
        } else {
            vec![ContestLayout {
                contest_id: "measure-3".into(),
                options: vec![
                    target("either", 50),
                    target("neither", 80),
                    target("3a", 140),
                    target("3b", 170),
                ],
            }]
        };
        BallotPageLayout {
            ballot_style_id: "1".into(),
            precinct_id: "precinct-1".into(),
            page_number,
            is_test_mode,
            width: WIDTH,
            height: HEIGHT,
            contests,
        }
    }

    /// White page with a header bar and an outlined box per target.
    pub fn template_image(layout: &BallotPageLayout) -> PixelBuffer {
        let mut img = PixelBuffer::filled(WIDTH, HEIGHT, 1, 255).expect("template");
        for y in 8..16 {
            for x in 10..190 {
                img.set_luminosity(x, y, 0);
            }
        }
        for option in layout.contests.iter().flat_map(|c| &c.options) {
            let b = option.bounds;
            for i in 0..b.width {
                img.set_luminosity(b.x + i, b.y, 0);
                img.set_luminosity(b.x + i, b.y + b.height - 1, 0);
            }
            for i in 0..b.height {
                img.set_luminosity(b.x, b.y + i, 0);
                img.set_luminosity(b.x + b.width - 1, b.y + i, 0);
            }
        }
        img
    }

    pub fn template(page_number: u8, is_test_mode: bool) -> (BallotPageLayout, Vec<u8>) {
        let layout = layout(page_number, is_test_mode);
        let png = encode_png(&template_image(&layout)).expect("encode template");
        (layout, png)
    }

    /// Template image with the named targets filled in.
    pub fn marked_page(layout: &BallotPageLayout, fill: &[&str]) -> PixelBuffer {
        let mut img = template_image(layout);
        for option in layout.contests.iter().flat_map(|c| &c.options) {
            if fill.contains(&option.option_id.as_str()) {
                let b = option.bounds;
                for y in b.y + 1..b.y + b.height - 1 {
                    for x in b.x + 1..b.x + b.width - 1 {
                        img.set_luminosity(x, y, 10);
                    }
                }
            }
        }
        img
    }

    pub fn options(test_mode: bool) -> InterpreterOptions {
        let def = election();
        InterpreterOptions {
            adjudication_reasons: def.election.precinct_scanner_adjudication_reasons.clone(),
            election_definition: def,
            precinct_selection: PrecinctSelection::AllPrecincts,
            test_mode,
            mark_threshold_overrides: None,
            skip_election_hash_check: false,
            templates: vec![
                template(1, true),
                template(2, true),
                template(1, false),
                template(2, false),
            ],
        }
    }

    pub fn hmpb_metadata(page_number: u8, is_test_mode: bool) -> BallotMetadata {
        BallotMetadata {
            election_hash: election().election_hash_prefix().to_owned(),
            precinct_id: "precinct-1".into(),
            ballot_style_id: "1".into(),
            ballot_type: BallotType::Standard,
            is_test_mode,
            page_number: Some(page_number),
        }
    }

    pub fn hmpb_qr(page_number: u8, is_test_mode: bool) -> Vec<u8> {
        encode_hmpb_metadata(&election().election, &hmpb_metadata(page_number, is_test_mode))
            .expect("encode metadata")
    }

    /// Write both pages of a hand-marked sheet (plus QR sidecars) into `dir`.
    pub fn write_hmpb_sheet(dir: &Path, name: &str, fill: &[&str], is_test_mode: bool) -> SheetOf<PathBuf> {
        let write = |side: &str, page_number: u8| {
            let path = dir.join(format!("{name}-{side}.png"));
            write_png(&marked_page(&layout(page_number, is_test_mode), fill), &path).expect("write page");
            std::fs::write(sidecar_path(&path), hmpb_qr(page_number, is_test_mode)).expect("write qr");
            path
        };
        SheetOf::new(write("front", 1), write("back", 2))
    }

    /// Write a machine-printed sheet into `dir`: the front carries the vote
    /// QR code, the back is blank.
    pub fn write_bmd_sheet(dir: &Path, name: &str, votes: &[(&str, &[&str])], is_test_mode: bool) -> SheetOf<PathBuf> {
        let def = election();
        let ballot = BmdBallot {
            ballot_id: format!("{name}-id"),
            metadata: BallotMetadata {
                page_number: None,
                ..hmpb_metadata(1, is_test_mode)
            },
            votes: votes
                .iter()
                .map(|(contest, options)| {
                    ((*contest).to_owned(), options.iter().map(|o| (*o).to_owned()).collect())
                })
                .collect(),
        };

        let mut printed = PixelBuffer::filled(WIDTH, HEIGHT, 1, 255).expect("page");
        for y in 20..100 {
            for x in 20..100 {
                if (x / 4 + y / 4) % 2 == 0 {
                    printed.set_luminosity(x, y, 0);
                }
            }
        }
        let front = dir.join(format!("{name}-front.png"));
        write_png(&printed, &front).expect("write front");
        std::fs::write(sidecar_path(&front), encode_bmd_ballot(&def.election, &ballot).expect("encode"))
            .expect("write qr");

        let back = dir.join(format!("{name}-back.png"));
        write_png(&PixelBuffer::filled(WIDTH, HEIGHT, 1, 255).expect("page"), &back).expect("write back");
        SheetOf::new(front, back)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use ballotscan_core::interpretation::{
        AdjudicationReasonInfo, BallotMetadata, BallotType, InvalidSheetReason,
        SheetInterpretation, VotesDict,
    };
    use ballotscan_image::write_png;

    use crate::qr::fixtures::election;
    use crate::qr::{BmdBallot, encode_bmd_ballot, sidecar_path};

    fn bmd_qr(is_test_mode: bool, precinct_id: &str) -> Vec<u8> {
        let def = election();
        let ballot = BmdBallot {
            ballot_id: "ballot-7".into(),
            metadata: BallotMetadata {
                election_hash: def.election_hash_prefix().to_owned(),
                precinct_id: precinct_id.into(),
                ballot_style_id: "1".into(),
                ballot_type: BallotType::Standard,
                is_test_mode,
                page_number: None,
            },
            votes: VotesDict::from([
                ("mayor".to_string(), vec!["alice".to_string()]),
                ("prop-1".to_string(), vec!["no".to_string()]),
            ]),
        };
        encode_bmd_ballot(&def.election, &ballot).expect("encode bmd")
    }

    /// Any non-blank page; BMD interpretation never looks at pixels.
    fn printed_page() -> PixelBuffer {
        template_image(&layout(1, true))
    }

    fn interpreter() -> Interpreter {
        Interpreter::new(options(true)).expect("interpreter")
    }

    #[test]
    fn missing_thresholds_is_a_configuration_error() {
        let mut opts = options(true);
        opts.election_definition.election.mark_thresholds = None;
        let err = Interpreter::new(opts).err().expect("should fail");
        assert!(err.to_string().contains("missing mark thresholds"));

        let mut opts = options(true);
        opts.election_definition.election.mark_thresholds = None;
        opts.mark_threshold_overrides = Some(MarkThresholds::DEFAULT);
        assert!(Interpreter::new(opts).is_ok());
    }

    #[test]
    fn template_size_must_match_layout() {
        let mut opts = options(true);
        opts.templates[0].0.width = 100;
        assert!(Interpreter::new(opts).is_err());
    }

    #[test]
    fn white_page_is_blank_even_with_qr() {
        let white = PixelBuffer::filled(WIDTH, HEIGHT, 1, 255).expect("page");
        let result = interpreter()
            .interpret_file(&white, Some(bmd_qr(true, "precinct-1").as_slice()))
            .expect("interpret");
        assert_eq!(result.interpretation, PageInterpretation::BlankPage);
    }

    #[test]
    fn page_without_qr_is_unreadable() {
        let result = interpreter().interpret_file(&printed_page(), None).expect("interpret");
        assert_eq!(
            result.interpretation,
            PageInterpretation::UnreadablePage {
                reason: Some("No QR code found".into())
            }
        );
    }

    #[test]
    fn foreign_election_hash_is_rejected() {
        let mut qr = bmd_qr(true, "precinct-1");
        qr[3] ^= 0xFF;
        let result = interpreter().interpret_file(&printed_page(), Some(qr.as_slice())).expect("interpret");
        match result.interpretation {
            PageInterpretation::InvalidElectionHashPage {
                expected_election_hash,
                actual_election_hash,
            } => {
                assert_eq!(expected_election_hash, election().election_hash_prefix());
                assert_ne!(actual_election_hash, expected_election_hash);
            }
            other => panic!("unexpected {}", other.type_name()),
        }

        let result = interpreter()
            .interpret_file(&printed_page(), Some(b"hello".as_slice()))
            .expect("interpret");
        assert!(matches!(
            result.interpretation,
            PageInterpretation::InvalidElectionHashPage { ref actual_election_hash, .. }
                if actual_election_hash == "not found"
        ));
    }

    #[test]
    fn bmd_ballot_is_checked_for_mode_then_precinct() {
        let interp = interpreter();
        let ok = interp
            .interpret_file(&printed_page(), Some(bmd_qr(true, "precinct-2").as_slice()))
            .expect("interpret");
        match ok.interpretation {
            PageInterpretation::InterpretedBmdPage { ballot_id, votes, .. } => {
                assert_eq!(ballot_id, "ballot-7");
                assert_eq!(votes["mayor"], vec!["alice".to_string()]);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(ok.normalized_image.is_none());

        let live = interp
            .interpret_file(&printed_page(), Some(bmd_qr(false, "precinct-2").as_slice()))
            .expect("interpret");
        assert_eq!(live.interpretation.type_name(), "InvalidTestModePage");

        let mut opts = options(true);
        opts.precinct_selection = PrecinctSelection::SinglePrecinct {
            precinct_id: "precinct-1".into(),
        };
        let single = Interpreter::new(opts).expect("interpreter");
        let wrong = single
            .interpret_file(&printed_page(), Some(bmd_qr(true, "precinct-2").as_slice()))
            .expect("interpret");
        assert_eq!(wrong.interpretation.type_name(), "InvalidPrecinctPage");
        let wrong_and_live = single
            .interpret_file(&printed_page(), Some(bmd_qr(false, "precinct-2").as_slice()))
            .expect("interpret");
        assert_eq!(wrong_and_live.interpretation.type_name(), "InvalidTestModePage");
    }

    #[test]
    fn hand_marked_page_yields_votes_and_normalized_image() {
        let page = marked_page(&layout(1, true), &["bob", "yes"]);
        let result = interpreter()
            .interpret_file(&page, Some(hmpb_qr(1, true).as_slice()))
            .expect("interpret");

        match &result.interpretation {
            PageInterpretation::InterpretedHmpbPage {
                metadata,
                mark_info,
                votes,
                adjudication_info,
            } => {
                assert_eq!(metadata.page_number, Some(1));
                assert_eq!(mark_info.marks.len(), 5);
                assert_eq!(votes["mayor"], vec!["bob".to_string()]);
                assert_eq!(votes["prop-1"], vec!["yes".to_string()]);
                assert!(!adjudication_info.requires_adjudication);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        let normalized = result.normalized_image.expect("normalized");
        assert_eq!((normalized.width(), normalized.height()), (WIDTH, HEIGHT));
    }

    #[test]
    fn overvote_is_an_enabled_reason() {
        let page = marked_page(&layout(1, true), &["alice", "bob", "no"]);
        let result = interpreter()
            .interpret_file(&page, Some(hmpb_qr(1, true).as_slice()))
            .expect("interpret");
        let PageInterpretation::InterpretedHmpbPage { adjudication_info, .. } = result.interpretation
        else {
            panic!("expected hand-marked page");
        };
        assert!(adjudication_info.requires_adjudication);
        assert!(adjudication_info.enabled_reason_infos.contains(&AdjudicationReasonInfo::Overvote {
            contest_id: "mayor".into(),
            option_ids: vec!["alice".into(), "bob".into()],
            expected: 1,
        }));
    }

    #[test]
    fn live_ballot_in_test_mode_is_invalid_test_mode() {
        let page = marked_page(&layout(1, false), &["alice"]);
        let result = interpreter()
            .interpret_file(&page, Some(hmpb_qr(1, false).as_slice()))
            .expect("interpret");
        assert_eq!(result.interpretation.type_name(), "InvalidTestModePage");
    }

    #[test]
    fn page_without_template_is_uninterpreted() {
        let mut opts = options(true);
        opts.templates.retain(|(layout, _)| layout.page_number == 2);
        let interp = Interpreter::new(opts).expect("interpreter");
        let page = marked_page(&layout(1, true), &["alice"]);
        let result = interp.interpret_file(&page, Some(hmpb_qr(1, true).as_slice())).expect("interpret");
        assert_eq!(result.interpretation.type_name(), "UninterpretedHmpbPage");
    }

    #[test]
    fn hand_marked_page_outside_precinct_selection() {
        let mut opts = options(true);
        opts.precinct_selection = PrecinctSelection::SinglePrecinct {
            precinct_id: "precinct-2".into(),
        };
        let interp = Interpreter::new(opts).expect("interpreter");
        let page = marked_page(&layout(1, true), &["alice"]);
        let result = interp.interpret_file(&page, Some(hmpb_qr(1, true).as_slice())).expect("interpret");
        assert_eq!(result.interpretation.type_name(), "InvalidPrecinctPage");
    }

    #[test]
    fn garbage_payload_is_unreadable_when_hash_check_skipped() {
        let mut opts = options(true);
        opts.skip_election_hash_check = true;
        let interp = Interpreter::new(opts).expect("interpreter");
        let result = interp
            .interpret_file(&printed_page(), Some(b"not a ballot".as_slice()))
            .expect("interpret");
        assert!(matches!(
            result.interpretation,
            PageInterpretation::UnreadablePage { reason: Some(_) }
        ));
    }

    #[test]
    fn sheet_interpretation_writes_normalized_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = |name: &str, image: &PixelBuffer, qr: &[u8]| {
            let path = dir.path().join(name);
            write_png(image, &path).expect("write page");
            std::fs::write(sidecar_path(&path), qr).expect("write qr");
            path
        };
        let front = write("front.png", &marked_page(&layout(1, true), &["alice", "no"]), &hmpb_qr(1, true));
        let back = write("back.png", &marked_page(&layout(2, true), &["neither", "3a"]), &hmpb_qr(2, true));

        let sheet_id = SheetId::new();
        let response = interpreter()
            .interpret_sheet(sheet_id, &SheetOf::new(front.clone(), back), dir.path())
            .expect("interpret sheet");

        assert_eq!(response.sheet_id, sheet_id);
        assert_eq!(response.interpretation, SheetInterpretation::ValidSheet);
        assert!(!response.requires_adjudication);
        assert_eq!(response.pages.front.original_filename, front.display().to_string());
        assert!(response.pages.front.normalized_filename.ends_with("-front-normalized.png"));
        assert!(Path::new(&response.pages.back.normalized_filename).exists());

        let back_votes = response.pages.back.interpretation.votes().expect("votes");
        assert_eq!(back_votes["measure-3-either-neither"], vec!["no".to_string()]);
        assert_eq!(back_votes["measure-3-pick-one"], vec!["yes".to_string()]);
    }

    #[test]
    fn unreadable_sheet_keeps_original_filenames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.png");
        write_png(&printed_page(), &path).expect("write page");

        let response = interpreter()
            .interpret_sheet(SheetId::new(), &SheetOf::new(path.clone(), path.clone()), dir.path())
            .expect("interpret sheet");
        assert_eq!(
            response.interpretation,
            SheetInterpretation::InvalidSheet {
                reason: InvalidSheetReason::Unreadable
            }
        );
        assert!(response.requires_adjudication);
        assert_eq!(response.pages.front.normalized_filename, path.display().to_string());
    }
}
