//! In-process [`Store`] used for single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::error::{Error, Result};
use crate::model::{
    ledger::VoteRecord,
    poll::{Poll, PollId, PollSpec, PollState},
    store::Store,
    voter::{Accessibility, NewVoter, Voter, VoterId},
};

/// Store backed by concurrent maps.
///
/// Uniqueness is enforced by `DashMap` entries, which hold their shard lock
/// from the vacancy check to the insert; totals are atomic counters.
pub struct MemoryStore {
    voters: DashMap<VoterId, Voter>,
    emails: DashMap<String, VoterId>,
    citizenships: DashMap<String, VoterId>,
    next_voter_id: AtomicU32,
    poll: RwLock<Option<Poll>>,
    next_poll_id: AtomicU32,
    votes: DashMap<(PollId, VoterId), VoteRecord>,
    totals: DashMap<(PollId, String), AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            voters: DashMap::new(),
            emails: DashMap::new(),
            citizenships: DashMap::new(),
            next_voter_id: AtomicU32::new(1),
            poll: RwLock::new(None),
            next_poll_id: AtomicU32::new(1),
            votes: DashMap::new(),
            totals: DashMap::new(),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal("poll lock poisoned by a panicked writer".to_string())
}

#[rocket::async_trait]
impl Store for MemoryStore {
    async fn insert_voter(&self, voter: NewVoter) -> Result<Voter> {
        // Both unique keys stay locked until the id is drawn, so a rejected
        // signup never consumes one.
        let email = match self.emails.entry(voter.email.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::validation("email", "email already registered"));
            }
            Entry::Vacant(entry) => entry,
        };
        let citizenship = match self.citizenships.entry(voter.citizenship_hmac.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::validation(
                    "citizenshipNumber",
                    "citizenship number already registered",
                ));
            }
            Entry::Vacant(entry) => entry,
        };
        let id = self.next_voter_id.fetch_add(1, Ordering::Relaxed);
        email.insert(id);
        citizenship.insert(id);

        let voter = Voter { id, voter };
        self.voters.insert(id, voter.clone());
        Ok(voter)
    }

    async fn voter_by_id(&self, id: VoterId) -> Result<Option<Voter>> {
        Ok(self.voters.get(&id).map(|v| v.clone()))
    }

    async fn voter_by_email(&self, email: &str) -> Result<Option<Voter>> {
        let id = match self.emails.get(email) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.voter_by_id(id).await
    }

    async fn voters(&self) -> Result<Vec<Voter>> {
        let mut voters: Vec<Voter> = self.voters.iter().map(|v| v.clone()).collect();
        voters.sort_by_key(|v| v.id);
        Ok(voters)
    }

    async fn admin_exists(&self) -> Result<bool> {
        Ok(self.voters.iter().any(|v| v.admin))
    }

    async fn set_verified(&self, id: VoterId) -> Result<bool> {
        Ok(match self.voters.get_mut(&id) {
            Some(mut voter) => {
                voter.verified = true;
                true
            }
            None => false,
        })
    }

    async fn set_accessibility(&self, id: VoterId, flags: Accessibility) -> Result<bool> {
        Ok(match self.voters.get_mut(&id) {
            Some(mut voter) => {
                voter.accessibility = flags;
                true
            }
            None => false,
        })
    }

    async fn poll(&self) -> Result<Option<Poll>> {
        Ok(self.poll.read().map_err(|_| poisoned())?.clone())
    }

    async fn replace_poll(&self, spec: PollSpec) -> Result<Poll> {
        let mut active = self.poll.write().map_err(|_| poisoned())?;
        if let Some(current) = active.as_ref() {
            if current.state == PollState::Running {
                return Err(Error::InvalidTransition {
                    from: PollState::Running,
                    to: PollState::NotStarted,
                });
            }
        }
        let poll = Poll {
            id: self.next_poll_id.fetch_add(1, Ordering::Relaxed),
            spec,
            state: PollState::NotStarted,
        };
        for candidate in &poll.spec.candidates {
            self.totals
                .insert((poll.id, candidate.clone()), AtomicU64::new(0));
        }
        *active = Some(poll.clone());
        Ok(poll)
    }

    async fn transition_poll(&self, from: PollState, to: PollState) -> Result<bool> {
        let mut active = self.poll.write().map_err(|_| poisoned())?;
        Ok(match active.as_mut() {
            Some(poll) if poll.state == from => {
                poll.state = to;
                true
            }
            _ => false,
        })
    }

    async fn vote_record(&self, poll: PollId, voter: VoterId) -> Result<Option<VoteRecord>> {
        Ok(self.votes.get(&(poll, voter)).map(|r| r.clone()))
    }

    async fn insert_vote(&self, record: VoteRecord) -> Result<()> {
        // Transitions take the write lock, so the poll stays running until the
        // vote is counted.
        let active = self.poll.read().map_err(|_| poisoned())?;
        match active.as_ref() {
            Some(poll) if poll.id == record.poll_id && poll.state == PollState::Running => {}
            Some(poll) if poll.id == record.poll_id => return Err(Error::PollNotOpen(poll.state)),
            _ => return Err(Error::PollNotOpen(PollState::Finished)),
        }

        let key = (record.poll_id, record.voter_id);
        match self.votes.entry(key) {
            Entry::Occupied(_) => Err(Error::AlreadyVoted {
                voter: key.1,
                poll: key.0,
            }),
            Entry::Vacant(entry) => {
                self.totals
                    .entry((record.poll_id, record.candidate.clone()))
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::SeqCst);
                // Still holding the shard lock, so no other cast for this key
                // can observe the vacancy.
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn totals(&self, poll: PollId) -> Result<HashMap<String, u64>> {
        Ok(self
            .totals
            .iter()
            .filter(|e| e.key().0 == poll)
            .map(|e| (e.key().1.clone(), e.value().load(Ordering::SeqCst)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use chrono::Utc;
    use rocket::{http::Status, local::asynchronous::Client};

    use crate::model::store::Storage;

    use super::*;

    fn record(poll_id: PollId, voter_id: VoterId, candidate: &str) -> VoteRecord {
        VoteRecord {
            poll_id,
            voter_id,
            voter_name: "Voter".into(),
            candidate: candidate.into(),
            cast_at: Utc::now(),
        }
    }

    #[rocket::async_test]
    async fn votes_only_land_in_the_running_poll() {
        let store = MemoryStore::default();
        let first = store.replace_poll(PollSpec::example()).await.unwrap();
        assert!(matches!(
            store.insert_vote(record(first.id, 1, "Alice")).await,
            Err(Error::PollNotOpen(PollState::NotStarted))
        ));

        store
            .transition_poll(PollState::NotStarted, PollState::Running)
            .await
            .unwrap();
        store.insert_vote(record(first.id, 1, "Alice")).await.unwrap();
        store
            .transition_poll(PollState::Running, PollState::Finished)
            .await
            .unwrap();
        assert!(matches!(
            store.insert_vote(record(first.id, 2, "Alice")).await,
            Err(Error::PollNotOpen(PollState::Finished))
        ));

        // A record for a replaced poll is turned away too.
        let second = store.replace_poll(PollSpec::example()).await.unwrap();
        store
            .transition_poll(PollState::NotStarted, PollState::Running)
            .await
            .unwrap();
        assert!(matches!(
            store.insert_vote(record(first.id, 3, "Bob")).await,
            Err(Error::PollNotOpen(_))
        ));

        assert_eq!(store.totals(first.id).await.unwrap()["Alice"], 1);
        assert_eq!(store.totals(first.id).await.unwrap()["Bob"], 0);
        assert!(store.totals(second.id).await.unwrap().values().all(|n| *n == 0));
    }

    #[rocket::async_test]
    async fn poisoned_poll_lock_is_internal() {
        let store = MemoryStore::default();
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.poll.write().unwrap();
            panic!("writer died");
        }));

        let err = store.poll().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(err.status(), Status::InternalServerError);
        assert!(matches!(
            store.replace_poll(PollSpec::example()).await,
            Err(Error::Internal(_))
        ));
    }

    #[backend_test]
    async fn rejected_signups_leave_ids_dense(_client: Client, storage: Storage) {
        let first = NewVoter::example("first@example.com", false, Accessibility::default());
        let first = storage.insert_voter(first).await.unwrap();

        // Same email, then same citizenship digest under a new email.
        let same_email = NewVoter::example("first@example.com", false, Accessibility::default());
        assert!(matches!(
            storage.insert_voter(same_email).await,
            Err(Error::Validation { field: "email", .. })
        ));
        let same_citizen = NewVoter {
            email: "other@example.com".into(),
            ..NewVoter::example("first@example.com", false, Accessibility::default())
        };
        assert!(matches!(
            storage.insert_voter(same_citizen).await,
            Err(Error::Validation { field: "citizenshipNumber", .. })
        ));
        // The clashing email was never registered.
        assert!(storage.voter_by_email("other@example.com").await.unwrap().is_none());

        let second = NewVoter::example("second@example.com", false, Accessibility::default());
        let second = storage.insert_voter(second).await.unwrap();
        assert_eq!(second.id, first.id + 1);
    }
}
