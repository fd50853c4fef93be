// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Election definition: precincts, ballot styles and contests. Read-only input
// owned by configuration; the interpreter only ever borrows it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BallotscanError, Result};
use crate::interpretation::AdjudicationReason;
use crate::types::MarkThresholds;

/// Number of hex characters of the election hash embedded in ballot QR codes.
pub const ELECTION_HASH_PREFIX_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precinct {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotStyle {
    pub id: String,
    /// Precincts this style may be issued in.
    pub precincts: Vec<String>,
    /// Contest ids in ballot order.
    pub contests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateContest {
    pub id: String,
    pub title: String,
    pub seats: u32,
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub allow_write_ins: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YesNoContest {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestOption {
    pub id: String,
    pub label: String,
}

/// A paired measure: an "either/neither" question and a "pick one" question
/// printed together, sharing one block of four mark targets.
///
/// Votes are never recorded against `id`; they land on the two sub-contests
/// as `"yes"`/`"no"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EitherNeitherContest {
    pub id: String,
    pub title: String,
    pub either_neither_contest_id: String,
    pub pick_one_contest_id: String,
    pub either_option: ContestOption,
    pub neither_option: ContestOption,
    pub first_option: ContestOption,
    pub second_option: ContestOption,
}

/// Yes/no choice as recorded in votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YesNo {
    Yes,
    No,
}

impl YesNo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl EitherNeitherContest {
    /// The four physical targets in printed order, each with the sub-contest
    /// and choice it records.
    pub fn targets(&self) -> [(&ContestOption, &str, YesNo); 4] {
        [
            (&self.either_option, self.either_neither_contest_id.as_str(), YesNo::Yes),
            (&self.neither_option, self.either_neither_contest_id.as_str(), YesNo::No),
            (&self.first_option, self.pick_one_contest_id.as_str(), YesNo::Yes),
            (&self.second_option, self.pick_one_contest_id.as_str(), YesNo::No),
        ]
    }

    /// Sub-contest and choice recorded by marking the physical option
    /// `option_id`.
    pub fn sub_contest_choice(&self, option_id: &str) -> Option<(&str, YesNo)> {
        self.targets()
            .into_iter()
            .find(|(option, _, _)| option.id == option_id)
            .map(|(_, contest_id, choice)| (contest_id, choice))
    }

    /// Physical option that records `choice` for `sub_contest_id`.
    pub fn physical_option(&self, sub_contest_id: &str, choice: YesNo) -> Option<&ContestOption> {
        self.targets()
            .into_iter()
            .find(|(_, contest_id, c)| *contest_id == sub_contest_id && *c == choice)
            .map(|(option, _, _)| option)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Contest {
    #[serde(rename = "candidate")]
    Candidate(CandidateContest),
    #[serde(rename = "yesno")]
    YesNo(YesNoContest),
    #[serde(rename = "ms-either-neither")]
    EitherNeither(EitherNeitherContest),
}

impl Contest {
    pub fn id(&self) -> &str {
        match self {
            Self::Candidate(c) => &c.id,
            Self::YesNo(c) => &c.id,
            Self::EitherNeither(c) => &c.id,
        }
    }

    /// Ids of the printed mark targets, in ballot order.
    pub fn target_option_ids(&self) -> Vec<String> {
        match self {
            Self::Candidate(c) => {
                let mut ids: Vec<String> = c.candidates.iter().map(|cand| cand.id.clone()).collect();
                if c.allow_write_ins {
                    ids.extend((0..c.seats).map(|i| format!("write-in-{i}")));
                }
                ids
            }
            Self::YesNo(_) => vec![YesNo::Yes.as_str().into(), YesNo::No.as_str().into()],
            Self::EitherNeither(c) => c.targets().iter().map(|(o, _, _)| o.id.clone()).collect(),
        }
    }
}

/// The parsed election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Election {
    pub title: String,
    pub precincts: Vec<Precinct>,
    pub ballot_styles: Vec<BallotStyle>,
    pub contests: Vec<Contest>,
    #[serde(default)]
    pub mark_thresholds: Option<MarkThresholds>,
    /// Reasons that send a hand-marked sheet to the operator for review.
    #[serde(default)]
    pub precinct_scanner_adjudication_reasons: Vec<AdjudicationReason>,
}

impl Election {
    pub fn precinct(&self, id: &str) -> Option<&Precinct> {
        self.precincts.iter().find(|p| p.id == id)
    }

    pub fn ballot_style(&self, id: &str) -> Option<&BallotStyle> {
        self.ballot_styles.iter().find(|s| s.id == id)
    }

    pub fn contest(&self, id: &str) -> Option<&Contest> {
        self.contests.iter().find(|c| c.id() == id)
    }

    /// Contests printed on a ballot style, in ballot order.
    pub fn contests_for_style(&self, style_id: &str) -> Result<Vec<&Contest>> {
        let style = self.ballot_style(style_id).ok_or_else(|| {
            BallotscanError::Validation(format!("unknown ballot style {style_id}"))
        })?;
        style
            .contests
            .iter()
            .map(|id| {
                self.contest(id).ok_or_else(|| {
                    BallotscanError::Validation(format!(
                        "ballot style {style_id} references unknown contest {id}"
                    ))
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.precincts.is_empty() {
            return Err(BallotscanError::Validation("election has no precincts".into()));
        }
        for style in &self.ballot_styles {
            for precinct_id in &style.precincts {
                if self.precinct(precinct_id).is_none() {
                    return Err(BallotscanError::Validation(format!(
                        "ballot style {} references unknown precinct {precinct_id}",
                        style.id
                    )));
                }
            }
            self.contests_for_style(&style.id)?;
        }
        Ok(())
    }
}

/// An election plus the exact bytes it was loaded from and their hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionDefinition {
    pub election: Election,
    pub election_data: String,
    pub election_hash: String,
}

impl ElectionDefinition {
    /// Parse and validate an election definition. The hash covers the raw
    /// bytes, not the re-serialized form.
    pub fn from_json(election_data: &str) -> Result<Self> {
        let election: Election = serde_json::from_str(election_data)?;
        election.validate()?;
        Ok(Self {
            election,
            election_data: election_data.to_owned(),
            election_hash: hash_election_data(election_data),
        })
    }

    /// Hash prefix embedded in ballot QR codes.
    pub fn election_hash_prefix(&self) -> &str {
        self.election_hash
            .get(..ELECTION_HASH_PREFIX_LEN)
            .unwrap_or(&self.election_hash)
    }
}

/// SHA-256 hex digest of election data.
pub fn hash_election_data(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}


#[cfg(test)]
mod tests {
    use super::fixtures::ELECTION_JSON;
    use super::*;

    #[test]
    fn parses_and_hashes_raw_bytes() {
        let def = ElectionDefinition::from_json(ELECTION_JSON).expect("parse");
        assert_eq!(def.election_hash.len(), 64);
        assert_eq!(def.election_hash, hash_election_data(ELECTION_JSON));
        assert_eq!(def.election_hash_prefix().len(), ELECTION_HASH_PREFIX_LEN);
        assert_eq!(def.election.contests.len(), 3);
    }

    #[test]
    fn either_neither_mapping_is_exact() {
        let def = ElectionDefinition::from_json(ELECTION_JSON).expect("parse");
        let Some(Contest::EitherNeither(en)) = def.election.contest("measure-3") else {
            panic!("expected either/neither contest");
        };

        assert_eq!(
            en.sub_contest_choice("either"),
            Some(("measure-3-either-neither", YesNo::Yes))
        );
        assert_eq!(
            en.sub_contest_choice("neither"),
            Some(("measure-3-either-neither", YesNo::No))
        );
        assert_eq!(en.sub_contest_choice("3a"), Some(("measure-3-pick-one", YesNo::Yes)));
        assert_eq!(en.sub_contest_choice("3b"), Some(("measure-3-pick-one", YesNo::No)));
        assert_eq!(en.sub_contest_choice("yes"), None);

        assert_eq!(
            en.physical_option("measure-3-pick-one", YesNo::No).map(|o| o.id.as_str()),
            Some("3b")
        );
        assert!(en.physical_option("measure-3", YesNo::Yes).is_none());
    }

    #[test]
    fn write_in_targets_follow_seats() {
        let def = ElectionDefinition::from_json(ELECTION_JSON).expect("parse");
        let mayor = def.election.contest("mayor").expect("mayor");
        assert_eq!(mayor.target_option_ids(), vec!["alice", "bob", "write-in-0"]);
    }

    #[test]
    fn unknown_contest_reference_is_rejected() {
        let broken = ELECTION_JSON.replace(r#""measure-3"]"#, r#""measure-9"]"#);
        assert!(ElectionDefinition::from_json(&broken).is_err());
    }
}
