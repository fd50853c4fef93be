// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cast vote record export: one NDJSON object per exportable sheet.

use std::io::Write;

use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use ballotscan_core::election::{Contest, Election};
use ballotscan_core::error::Result;
use ballotscan_core::interpretation::{BallotMetadata, PageInterpretation, VotesDict};

use crate::store::{ResultSheet, Store};

/// Keys under which a ballot style's votes are recorded. Either/neither
/// measures record under their two sub-contests.
fn vote_keys(election: &Election, ballot_style_id: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for contest in election.contests_for_style(ballot_style_id)? {
        match contest {
            Contest::EitherNeither(en) => {
                keys.push(en.either_neither_contest_id.clone());
                keys.push(en.pick_one_contest_id.clone());
            }
            other => keys.push(other.id().to_owned()),
        }
    }
    Ok(keys)
}

fn insert_metadata(record: &mut Map<String, Value>, metadata: &BallotMetadata) {
    record.insert("_ballotStyleId".into(), json!(metadata.ballot_style_id));
    record.insert("_ballotType".into(), json!(metadata.ballot_type));
    record.insert("_precinctId".into(), json!(metadata.precinct_id));
    record.insert("_testBallot".into(), json!(metadata.is_test_mode));
}

fn insert_votes(record: &mut Map<String, Value>, votes: &VotesDict) {
    for (contest_id, option_ids) in votes {
        record.insert(contest_id.clone(), json!(option_ids));
    }
}

/// Build the CVR for one sheet, or `None` if the sheet carries no votes.
///
/// `images` holds the normalized front/back image bytes to embed.
pub fn build_cast_vote_record(
    result: &ResultSheet,
    election: &Election,
    scanner_id: &str,
    images: Option<[Vec<u8>; 2]>,
) -> Result<Option<Map<String, Value>>> {
    let sheet = &result.sheet;
    let mut record = Map::new();
    record.insert("_batchId".into(), json!(sheet.batch_id.to_string()));
    record.insert("_batchLabel".into(), json!(result.batch_label));
    record.insert("_scannerId".into(), json!(scanner_id));

    match (&sheet.front.interpretation, &sheet.back.interpretation) {
        (
            PageInterpretation::InterpretedBmdPage {
                ballot_id,
                metadata,
                votes,
            },
            _,
        )
        | (
            _,
            PageInterpretation::InterpretedBmdPage {
                ballot_id,
                metadata,
                votes,
            },
        ) => {
            record.insert("_ballotId".into(), json!(ballot_id));
            insert_metadata(&mut record, metadata);
            for key in vote_keys(election, &metadata.ballot_style_id)? {
                record.insert(key, json!([]));
            }
            insert_votes(&mut record, votes);
        }
        (
            PageInterpretation::InterpretedHmpbPage {
                metadata: front_meta,
                votes: front_votes,
                ..
            },
            PageInterpretation::InterpretedHmpbPage {
                metadata: back_meta,
                votes: back_votes,
                ..
            },
        ) => {
            insert_metadata(&mut record, front_meta);
            let pages: Vec<Option<u8>> = vec![front_meta.page_number, back_meta.page_number];
            record.insert("_pageNumbers".into(), json!(pages));
            insert_votes(&mut record, front_votes);
            insert_votes(&mut record, back_votes);

            if let Some([front, back]) = images {
                record.insert(
                    "_ballotImages".into(),
                    json!([
                        { "normalized": hex::encode(front) },
                        { "normalized": hex::encode(back) },
                    ]),
                );
            }
        }
        (front, back) => {
            warn!(
                sheet_id = %sheet.id,
                front = front.type_name(),
                back = back.type_name(),
                "sheet has no exportable votes"
            );
            return Ok(None);
        }
    }

    Ok(Some(record))
}

/// Write every exportable sheet as NDJSON. Returns the number of records.
#[instrument(skip_all, fields(scanner_id, include_images))]
pub fn export_cast_vote_records(
    store: &Store,
    election: &Election,
    scanner_id: &str,
    include_images: bool,
    mut out: impl Write,
) -> Result<usize> {
    let mut written = 0;
    for result in store.result_sheets()? {
        let images = if include_images && result.sheet.front.interpretation.is_hmpb() {
            Some([
                std::fs::read(&result.sheet.front.normalized_filename)?,
                std::fs::read(&result.sheet.back.normalized_filename)?,
            ])
        } else {
            None
        };

        if let Some(record) = build_cast_vote_record(&result, election, scanner_id, images)? {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
            written += 1;
        }
    }
    out.flush()?;
    info!(written, "cast vote records exported");
    Ok(written)
}
