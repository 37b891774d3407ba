use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use rocket::request::{self, FromRequest, Request};

use crate::error::{Error, Result};
use crate::model::{
    ledger::VoteRecord,
    memory::MemoryStore,
    poll::{Poll, PollId, PollSpec, PollState},
    voter::{Accessibility, NewVoter, Voter, VoterId},
};

/// Durable state of the service.
///
/// Every method that guards an invariant does so with the backend's own
/// atomic primitives (unique keys, conditional writes, atomic increments),
/// so several stateless server instances may share one store.
#[rocket::async_trait]
pub trait Store: Send + Sync {
    /// Insert a voter, assigning a fresh ID.
    /// Fails with a validation error if the email or national identifier is taken.
    async fn insert_voter(&self, voter: NewVoter) -> Result<Voter>;

    async fn voter_by_id(&self, id: VoterId) -> Result<Option<Voter>>;

    /// Look up a voter by (normalised) email.
    async fn voter_by_email(&self, email: &str) -> Result<Option<Voter>>;

    /// All voters, in ID order.
    async fn voters(&self) -> Result<Vec<Voter>>;

    /// Does any admin account exist?
    async fn admin_exists(&self) -> Result<bool>;

    /// Mark a voter as verified. Returns false if no such voter exists.
    async fn set_verified(&self, id: VoterId) -> Result<bool>;

    /// Replace a voter's accessibility flags. Returns false if no such voter exists.
    async fn set_accessibility(&self, id: VoterId, flags: Accessibility) -> Result<bool>;

    /// The active poll, if one has ever been created.
    async fn poll(&self) -> Result<Option<Poll>>;

    /// Atomically replace the active poll with a new, not-started poll built
    /// from `spec`, unless the current poll is running.
    async fn replace_poll(&self, spec: PollSpec) -> Result<Poll>;

    /// Atomically move the active poll from `from` to `to`.
    /// Returns false if the poll was not in state `from`.
    async fn transition_poll(&self, from: PollState, to: PollState) -> Result<bool>;

    async fn vote_record(&self, poll: PollId, voter: VoterId) -> Result<Option<VoteRecord>>;

    /// Record a vote and increment the chosen candidate's total.
    ///
    /// The record insert is unique per (poll, voter) and is the single point
    /// where a vote becomes counted: a second insert for the same key fails
    /// with [`Error::AlreadyVoted`] and leaves the totals untouched.
    /// Unless the record's poll is still the running poll when the vote is
    /// counted, nothing is kept and the call fails with [`Error::PollNotOpen`].
    async fn insert_vote(&self, record: VoteRecord) -> Result<()>;

    /// Per-candidate vote counts for a poll. Candidates without votes may be absent.
    async fn totals(&self, poll: PollId) -> Result<HashMap<String, u64>>;
}

/// Shared handle on the configured store.
#[derive(Clone)]
pub struct Storage(Arc<dyn Store>);

impl Storage {
    pub fn new(store: impl Store + 'static) -> Self {
        Self(Arc::new(store))
    }

    /// A fresh, empty in-memory store.
    pub fn memory() -> Self {
        Self::new(MemoryStore::default())
    }
}

impl Deref for Storage {
    type Target = dyn Store;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Storage {
    type Error = Error;

    /// Get the store from the managed state.
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.rocket().state::<Storage>() {
            Some(storage) => request::Outcome::Success(storage.clone()),
            None => Error::Config("no store is managed".to_string()).into_outcome(req),
        }
    }
}
