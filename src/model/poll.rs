use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

use mongodb::bson::{to_bson, Bson};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

/// Poll IDs are auto-incrementing integers; each new poll gets a fresh vote scope.
pub type PollId = u32;

/// States in the poll lifecycle. Transitions only ever move forwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollState {
    NotStarted,
    Running,
    Finished,
}

impl PollState {
    /// The state `start`/`finish` move into from this one, if any.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Running),
            Self::Running => Some(Self::Finished),
            Self::Finished => None,
        }
    }
}

impl Display for PollState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Finished => "finished",
        })
    }
}

impl From<PollState> for Bson {
    fn from(state: PollState) -> Self {
        to_bson(&state).expect("Serialisation is infallible")
    }
}

/// The admin-supplied description of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    #[serde(rename = "name")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub candidates: Vec<String>,
}

impl PollSpec {
    /// Check the poll description is usable, trimming candidate names.
    ///
    /// Names must be unique ignoring case, since speech input is matched
    /// case-insensitively and has to map back to exactly one candidate.
    pub fn validate(mut self) -> Result<Self> {
        self.title = self.title.trim().to_string();
        if self.title.is_empty() {
            return Err(Error::validation("name", "poll title cannot be empty"));
        }
        if self.candidates.is_empty() {
            return Err(Error::validation(
                "candidates",
                "poll needs at least one candidate",
            ));
        }
        let mut seen = HashSet::new();
        for candidate in self.candidates.iter_mut() {
            *candidate = candidate.trim().to_string();
            if candidate.is_empty() {
                return Err(Error::validation(
                    "candidates",
                    "candidate names cannot be empty",
                ));
            }
            if !seen.insert(candidate.to_lowercase()) {
                return Err(Error::validation(
                    "candidates",
                    format!("duplicate candidate '{candidate}'"),
                ));
            }
        }
        Ok(self)
    }
}

/// The active poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    #[serde(flatten)]
    pub spec: PollSpec,
    pub state: PollState,
}

impl Poll {
    pub fn has_candidate(&self, candidate: &str) -> bool {
        self.spec.candidates.iter().any(|c| c == candidate)
    }
}

/// Vote counts per candidate, in candidate-list order.
///
/// Serialises as a JSON object whose key order is the candidate order, which
/// is the order gesture codes refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally(Vec<(String, u64)>);

impl Tally {
    /// Lay out raw per-candidate counts in candidate order, with zero for
    /// candidates nobody has voted for yet.
    pub fn for_candidates(candidates: &[String], counts: &HashMap<String, u64>) -> Self {
        Self(
            candidates
                .iter()
                .map(|c| (c.clone(), counts.get(c).copied().unwrap_or(0)))
                .collect(),
        )
    }

    pub fn get(&self, candidate: &str) -> Option<u64> {
        self.0
            .iter()
            .find(|(name, _)| name == candidate)
            .map(|(_, count)| *count)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|(_, count)| count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(name, count)| (name.as_str(), *count))
    }
}

impl Serialize for Tally {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, count) in &self.0 {
            map.serialize_entry(name, count)?;
        }
        map.end()
    }
}

/// The public view of the active poll with its live tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSnapshot {
    #[serde(rename = "name")]
    pub title: String,
    pub description: String,
    pub candidates: Vec<String>,
    pub votes: Tally,
}

/// Response body for the poll status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatus {
    pub status: PollState,
}
