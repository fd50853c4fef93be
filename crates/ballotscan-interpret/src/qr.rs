// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ballot QR payloads.
//
// Two big-endian binary encodings share a layout prefix:
//
//   BMD:  "VX\x02" | hash[10] | precinct u16 | style u16 | flags u8
//         | id_len u8 | id bytes | per-contest votes in ballot style order
//   HMPB: "VP\x01" | hash[10] | precinct u16 | style u16 | page u8 | flags u8
//
// `flags` bit 0 is test mode, bits 1-2 the ballot type. Candidate votes are a
// count followed by candidate indices, with 0xFF introducing a
// length-prefixed write-in name. Yes/no votes are one byte: bit 0 yes, bit 1
// no. Either/neither measures carry two such bytes, either/neither first.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use ballotscan_core::election::{Contest, Election, YesNo};
use ballotscan_core::error::{BallotscanError, Result};
use ballotscan_core::interpretation::{BallotMetadata, BallotType, VotesDict};
use ballotscan_image::PixelBuffer;

pub const BMD_PRELUDE: &[u8; 3] = b"VX\x02";
pub const HMPB_PRELUDE: &[u8; 3] = b"VP\x01";

/// Bytes of election hash carried in a payload (20 hex characters).
pub const HASH_PREFIX_BYTES: usize = 10;

const WRITE_IN_MARKER: u8 = 0xFF;
const WRITE_IN_PREFIX: &str = "write-in-";
const FLAG_TEST_MODE: u8 = 0b001;
const YES_BIT: u8 = 0b01;
const NO_BIT: u8 = 0b10;

#[derive(Debug, Error, PartialEq)]
pub enum QrCodecError {
    #[error("unrecognized QR payload")]
    UnrecognizedPrelude,

    #[error("payload truncated: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("election hash prefix must be 10 bytes of hex, got {0:?}")]
    InvalidHash(String),

    #[error("precinct index {0} out of range")]
    UnknownPrecinctIndex(u16),

    #[error("ballot style index {0} out of range")]
    UnknownBallotStyleIndex(u16),

    #[error("unknown precinct {0}")]
    UnknownPrecinct(String),

    #[error("unknown ballot style {0}")]
    UnknownBallotStyle(String),

    #[error("unknown ballot type code {0}")]
    UnknownBallotType(u8),

    #[error("contest {contest_id} has no candidate {candidate_id}")]
    UnknownCandidate {
        contest_id: String,
        candidate_id: String,
    },

    #[error("contest {contest_id} cannot record {option}")]
    InvalidChoice { contest_id: String, option: String },

    #[error("text field is not valid UTF-8 or exceeds 255 bytes")]
    InvalidText,

    #[error("election is inconsistent: {0}")]
    Election(String),
}

impl From<QrCodecError> for BallotscanError {
    fn from(err: QrCodecError) -> Self {
        BallotscanError::Interpretation(err.to_string())
    }
}

/// A machine-printed ballot decoded from its QR payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BmdBallot {
    pub ballot_id: String,
    pub metadata: BallotMetadata,
    pub votes: VotesDict,
}

// ---------------------------------------------------------------------------
// Byte cursor
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], QrCodecError> {
        let remaining = self.data.len() - self.pos;
        if n > remaining {
            return Err(QrCodecError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, QrCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, QrCodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn text(&mut self) -> std::result::Result<String, QrCodecError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| QrCodecError::InvalidText)
    }

    fn finish(&self) -> std::result::Result<(), QrCodecError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            n => Err(QrCodecError::TrailingBytes(n)),
        }
    }
}

fn push_text(out: &mut Vec<u8>, text: &str) -> std::result::Result<(), QrCodecError> {
    let len = u8::try_from(text.len()).map_err(|_| QrCodecError::InvalidText)?;
    out.push(len);
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared prefix
// ---------------------------------------------------------------------------

/// Election hash prefix carried by either payload kind, as hex.
pub fn decode_election_hash(data: &[u8]) -> Option<String> {
    let prelude = data.get(..3)?;
    if prelude != BMD_PRELUDE && prelude != HMPB_PRELUDE {
        return None;
    }
    data.get(3..3 + HASH_PREFIX_BYTES).map(hex::encode)
}

pub fn is_bmd_payload(data: &[u8]) -> bool {
    data.starts_with(BMD_PRELUDE)
}

fn ballot_type_code(ballot_type: BallotType) -> u8 {
    match ballot_type {
        BallotType::Standard => 0,
        BallotType::Absentee => 1,
        BallotType::Provisional => 2,
    }
}

fn encode_flags(metadata: &BallotMetadata) -> u8 {
    let test = if metadata.is_test_mode { FLAG_TEST_MODE } else { 0 };
    test | (ballot_type_code(metadata.ballot_type) << 1)
}

fn decode_flags(flags: u8) -> std::result::Result<(bool, BallotType), QrCodecError> {
    let ballot_type = match (flags >> 1) & 0b11 {
        0 => BallotType::Standard,
        1 => BallotType::Absentee,
        2 => BallotType::Provisional,
        other => return Err(QrCodecError::UnknownBallotType(other)),
    };
    Ok((flags & FLAG_TEST_MODE != 0, ballot_type))
}

fn encode_prefix(
    out: &mut Vec<u8>,
    election: &Election,
    metadata: &BallotMetadata,
) -> std::result::Result<(), QrCodecError> {
    let hash = hex::decode(&metadata.election_hash)
        .ok()
        .filter(|bytes| bytes.len() == HASH_PREFIX_BYTES)
        .ok_or_else(|| QrCodecError::InvalidHash(metadata.election_hash.clone()))?;
    out.extend_from_slice(&hash);

    let precinct = election
        .precincts
        .iter()
        .position(|p| p.id == metadata.precinct_id)
        .ok_or_else(|| QrCodecError::UnknownPrecinct(metadata.precinct_id.clone()))?;
    let style = election
        .ballot_styles
        .iter()
        .position(|s| s.id == metadata.ballot_style_id)
        .ok_or_else(|| QrCodecError::UnknownBallotStyle(metadata.ballot_style_id.clone()))?;
    out.extend_from_slice(&(precinct as u16).to_be_bytes());
    out.extend_from_slice(&(style as u16).to_be_bytes());
    Ok(())
}

/// Reads hash, precinct and style. Returns (hash, precinct id, style id).
fn decode_prefix(
    reader: &mut Reader<'_>,
    election: &Election,
) -> std::result::Result<(String, String, String), QrCodecError> {
    let hash = hex::encode(reader.take(HASH_PREFIX_BYTES)?);
    let precinct_index = reader.u16()?;
    let style_index = reader.u16()?;
    let precinct = election
        .precincts
        .get(precinct_index as usize)
        .ok_or(QrCodecError::UnknownPrecinctIndex(precinct_index))?;
    let style = election
        .ballot_styles
        .get(style_index as usize)
        .ok_or(QrCodecError::UnknownBallotStyleIndex(style_index))?;
    Ok((hash, precinct.id.clone(), style.id.clone()))
}

// ---------------------------------------------------------------------------
// HMPB metadata
// ---------------------------------------------------------------------------

pub fn encode_hmpb_metadata(
    election: &Election,
    metadata: &BallotMetadata,
) -> std::result::Result<Vec<u8>, QrCodecError> {
    let mut out = HMPB_PRELUDE.to_vec();
    encode_prefix(&mut out, election, metadata)?;
    out.push(metadata.page_number.unwrap_or(1));
    out.push(encode_flags(metadata));
    Ok(out)
}

pub fn decode_hmpb_metadata(
    election: &Election,
    data: &[u8],
) -> std::result::Result<BallotMetadata, QrCodecError> {
    let mut reader = Reader::new(data);
    if reader.take(3)? != HMPB_PRELUDE {
        return Err(QrCodecError::UnrecognizedPrelude);
    }
    let (election_hash, precinct_id, ballot_style_id) = decode_prefix(&mut reader, election)?;
    let page_number = reader.u8()?;
    let (is_test_mode, ballot_type) = decode_flags(reader.u8()?)?;
    reader.finish()?;

    Ok(BallotMetadata {
        election_hash,
        precinct_id,
        ballot_style_id,
        ballot_type,
        is_test_mode,
        page_number: Some(page_number),
    })
}

// ---------------------------------------------------------------------------
// BMD ballots
// ---------------------------------------------------------------------------

fn yes_no_bits(contest_id: &str, choices: &[String]) -> std::result::Result<u8, QrCodecError> {
    choices.iter().try_fold(0u8, |bits, choice| match choice.as_str() {
        "yes" => Ok(bits | YES_BIT),
        "no" => Ok(bits | NO_BIT),
        other => Err(QrCodecError::InvalidChoice {
            contest_id: contest_id.to_owned(),
            option: other.to_owned(),
        }),
    })
}

fn yes_no_choices(bits: u8) -> Vec<String> {
    let mut choices = Vec::new();
    if bits & YES_BIT != 0 {
        choices.push(YesNo::Yes.as_str().to_owned());
    }
    if bits & NO_BIT != 0 {
        choices.push(YesNo::No.as_str().to_owned());
    }
    choices
}

pub fn encode_bmd_ballot(
    election: &Election,
    ballot: &BmdBallot,
) -> std::result::Result<Vec<u8>, QrCodecError> {
    let mut out = BMD_PRELUDE.to_vec();
    encode_prefix(&mut out, election, &ballot.metadata)?;
    out.push(encode_flags(&ballot.metadata));
    push_text(&mut out, &ballot.ballot_id)?;

    let contests = election
        .contests_for_style(&ballot.metadata.ballot_style_id)
        .map_err(|e| QrCodecError::Election(e.to_string()))?;
    let empty = Vec::new();
    let votes_for = |id: &str| ballot.votes.get(id).unwrap_or(&empty);

    for contest in contests {
        match contest {
            Contest::Candidate(c) => {
                let selected = votes_for(&c.id);
                let count = u8::try_from(selected.len()).map_err(|_| QrCodecError::InvalidChoice {
                    contest_id: c.id.clone(),
                    option: format!("{} selections", selected.len()),
                })?;
                out.push(count);
                for candidate_id in selected {
                    match c.candidates.iter().position(|cand| &cand.id == candidate_id) {
                        Some(index) if index < WRITE_IN_MARKER as usize => out.push(index as u8),
                        _ => match candidate_id.strip_prefix(WRITE_IN_PREFIX) {
                            Some(name) if c.allow_write_ins => {
                                out.push(WRITE_IN_MARKER);
                                push_text(&mut out, name)?;
                            }
                            _ => {
                                return Err(QrCodecError::UnknownCandidate {
                                    contest_id: c.id.clone(),
                                    candidate_id: candidate_id.clone(),
                                });
                            }
                        },
                    }
                }
            }
            Contest::YesNo(c) => out.push(yes_no_bits(&c.id, votes_for(&c.id))?),
            Contest::EitherNeither(c) => {
                out.push(yes_no_bits(
                    &c.either_neither_contest_id,
                    votes_for(&c.either_neither_contest_id),
                )?);
                out.push(yes_no_bits(
                    &c.pick_one_contest_id,
                    votes_for(&c.pick_one_contest_id),
                )?);
            }
        }
    }
    Ok(out)
}

pub fn decode_bmd_ballot(
    election: &Election,
    data: &[u8],
) -> std::result::Result<BmdBallot, QrCodecError> {
    let mut reader = Reader::new(data);
    if reader.take(3)? != BMD_PRELUDE {
        return Err(QrCodecError::UnrecognizedPrelude);
    }
    let (election_hash, precinct_id, ballot_style_id) = decode_prefix(&mut reader, election)?;
    let (is_test_mode, ballot_type) = decode_flags(reader.u8()?)?;
    let ballot_id = reader.text()?;

    let contests = election
        .contests_for_style(&ballot_style_id)
        .map_err(|e| QrCodecError::Election(e.to_string()))?;
    let mut votes = VotesDict::new();
    let mut record = |contest_id: &str, choices: Vec<String>| {
        if !choices.is_empty() {
            votes.insert(contest_id.to_owned(), choices);
        }
    };

    for contest in contests {
        match contest {
            Contest::Candidate(c) => {
                let count = reader.u8()?;
                let mut selected = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let index = reader.u8()?;
                    if index == WRITE_IN_MARKER {
                        selected.push(format!("{WRITE_IN_PREFIX}{}", reader.text()?));
                        continue;
                    }
                    let candidate = c.candidates.get(index as usize).ok_or_else(|| {
                        QrCodecError::UnknownCandidate {
                            contest_id: c.id.clone(),
                            candidate_id: format!("#{index}"),
                        }
                    })?;
                    selected.push(candidate.id.clone());
                }
                record(&c.id, selected);
            }
            Contest::YesNo(c) => record(&c.id, yes_no_choices(reader.u8()?)),
            Contest::EitherNeither(c) => {
                record(&c.either_neither_contest_id, yes_no_choices(reader.u8()?));
                record(&c.pick_one_contest_id, yes_no_choices(reader.u8()?));
            }
        }
    }
    reader.finish()?;

    Ok(BmdBallot {
        ballot_id,
        metadata: BallotMetadata {
            election_hash,
            precinct_id,
            ballot_style_id,
            ballot_type,
            is_test_mode,
            page_number: None,
        },
        votes,
    })
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Finds and decodes the QR code on a page image.
pub trait QrCodeDetector: Send + Sync {
    /// Raw payload bytes, or `None` when the page carries no readable code.
    fn detect(&self, image_path: &Path, image: &PixelBuffer) -> Result<Option<Vec<u8>>>;
}

/// Reads payloads the scanner firmware has already decoded into a
/// `<image>.qr` file next to each page image.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarQrDetector;

/// Location of the payload file for `image_path`.
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    let mut path = image_path.as_os_str().to_owned();
    path.push(".qr");
    PathBuf::from(path)
}

impl QrCodeDetector for SidecarQrDetector {
    fn detect(&self, image_path: &Path, _image: &PixelBuffer) -> Result<Option<Vec<u8>>> {
        let path = sidecar_path(image_path);
        match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => {
                debug!(path = %path.display(), len = bytes.len(), "QR payload read");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fixtures {
    use ballotscan_core::election::ElectionDefinition;

    pub const ELECTION_JSON: &str = r#"{
        "title": "County General",
        "precincts": [
            {"id": "precinct-1", "name": "North"},
            {"id": "precinct-2", "name": "South"}
        ],
        "ballot_styles": [
            {"id": "1", "precincts": ["precinct-1", "precinct-2"], "contests": ["mayor", "prop-1", "measure-3"]}
        ],
        "contests": [
            {"type": "candidate", "id": "mayor", "title": "Mayor", "seats": 1,
             "candidates": [{"id": "alice", "name": "Alice"}, {"id": "bob", "name": "Bob"}],
             "allow_write_ins": true},
            {"type": "yesno", "id": "prop-1", "title": "Proposition 1"},
            {"type": "ms-either-neither", "id": "measure-3", "title": "Measure 3",
             "either_neither_contest_id": "measure-3-either-neither",
             "pick_one_contest_id": "measure-3-pick-one",
             "either_option": {"id": "either", "label": "Either"},
             "neither_option": {"id": "neither", "label": "Neither"},
             "first_option": {"id": "3a", "label": "Initiative 3A"},
             "second_option": {"id": "3b", "label": "Alternative 3B"}}
        ],
        "mark_thresholds": {"marginal": 0.17, "definite": 0.25},
        "precinct_scanner_adjudication_reasons": ["Overvote", "BlankBallot"]
    }"#;

    pub fn election() -> ElectionDefinition {
        ElectionDefinition::from_json(ELECTION_JSON).expect("fixture election")
    }
}
