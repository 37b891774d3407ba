use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    auth::Identity,
    poll::{PollId, PollState},
    store::Storage,
    voter::VoterId,
};

/// A counted vote. One exists per (poll, voter) at most, and it is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub poll_id: PollId,
    pub voter_id: VoterId,
    pub voter_name: String,
    pub candidate: String,
    pub cast_at: DateTime<Utc>,
}

/// Whether a voter may still vote in the active poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Voteability {
    Voted,
    NotVoted,
}

/// Acknowledgement of a successful cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub poll_id: PollId,
    pub voter_id: VoterId,
    pub candidate: String,
    pub cast_at: DateTime<Utc>,
}

impl From<VoteRecord> for VoteReceipt {
    fn from(record: VoteRecord) -> Self {
        Self {
            poll_id: record.poll_id,
            voter_id: record.voter_id,
            candidate: record.candidate,
            cast_at: record.cast_at,
        }
    }
}

/// The vote ledger: accepts at most one vote per voter per poll.
#[derive(Clone)]
pub struct VoteLedger {
    storage: Storage,
}

impl VoteLedger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Has this voter voted in the active poll?
    ///
    /// With no poll configured there is nothing to have voted in.
    pub async fn check_voteability(&self, voter: VoterId) -> Result<Voteability> {
        let poll = match self.storage.poll().await? {
            Some(poll) => poll,
            None => return Ok(Voteability::NotVoted),
        };
        Ok(match self.storage.vote_record(poll.id, voter).await? {
            Some(_) => Voteability::Voted,
            None => Voteability::NotVoted,
        })
    }

    /// Cast the voter's single vote for `candidate` in the active poll.
    ///
    /// Fails with [`Error::PollNotOpen`] unless the poll is running,
    /// [`Error::UnknownCandidate`] unless the name is on the ballot exactly,
    /// and [`Error::AlreadyVoted`] if this voter's vote is already counted.
    /// None of these are retried here.
    pub async fn cast(&self, voter: &Identity, candidate: &str) -> Result<VoteReceipt> {
        let poll = self
            .storage
            .poll()
            .await?
            .ok_or(Error::PollNotOpen(PollState::NotStarted))?;
        if poll.state != PollState::Running {
            return Err(Error::PollNotOpen(poll.state));
        }
        if !poll.has_candidate(candidate) {
            return Err(Error::UnknownCandidate(candidate.to_string()));
        }

        let record = VoteRecord {
            poll_id: poll.id,
            voter_id: voter.id,
            voter_name: voter.name.clone(),
            candidate: candidate.to_string(),
            cast_at: Utc::now(),
        };
        self.storage.insert_vote(record.clone()).await?;
        info!(
            "Voter {} cast a vote in poll {} for '{}'",
            voter.id, poll.id, candidate
        );
        Ok(record.into())
    }
}
