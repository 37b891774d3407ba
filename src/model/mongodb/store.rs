use std::collections::HashMap;

use mongodb::{
    bson::doc,
    options::{FindOneAndReplaceOptions, FindOptions, UpdateOptions},
    Database,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    ledger::VoteRecord,
    poll::{Poll, PollId, PollSpec, PollState},
    store::Store,
    voter::{Accessibility, NewVoter, Voter, VoterId},
};

use super::{
    collection::CITIZENSHIP_INDEX, duplicate_key_message, ensure_counters_exist,
    ensure_indexes_exist, is_duplicate_key_error, Coll, Counter, POLL_ID_COUNTER_ID,
    VOTER_ID_COUNTER_ID,
};

/// `_id` of the single poll document.
const ACTIVE_POLL_ID: &str = "active";

/// The poll singleton, as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePoll {
    #[serde(rename = "_id")]
    slot: String,
    #[serde(flatten)]
    poll: Poll,
}

/// Running vote count for one candidate of one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTotal {
    poll_id: PollId,
    candidate: String,
    votes: i64,
}

/// [`Store`] backed by MongoDB.
///
/// Uniqueness comes from unique indexes, lifecycle changes from conditional
/// updates, and totals from `$inc`, so any number of server instances may
/// share one database.
pub struct MongoStore {
    voters: Coll<Voter>,
    polls: Coll<ActivePoll>,
    votes: Coll<VoteRecord>,
    totals: Coll<CandidateTotal>,
    counters: Coll<Counter>,
}

impl MongoStore {
    pub fn from_db(db: &Database) -> Self {
        Self {
            voters: Coll::from_db(db),
            polls: Coll::from_db(db),
            votes: Coll::from_db(db),
            totals: Coll::from_db(db),
            counters: Coll::from_db(db),
        }
    }

    /// Remove a vote record, and its count if it had been made.
    /// Failures are logged; there is nothing left to roll back to.
    async fn withdraw(&self, record: &VoteRecord, counted: bool) {
        if counted {
            let filter = doc! { "poll_id": record.poll_id, "candidate": record.candidate.as_str() };
            if let Err(err) = self
                .totals
                .update_one(filter, doc! { "$inc": { "votes": -1_i64 } }, None)
                .await
            {
                error!("Failed to uncount withdrawn vote: {err}");
            }
        }
        let key = doc! { "poll_id": record.poll_id, "voter_id": record.voter_id };
        if let Err(err) = self.votes.delete_one(key, None).await {
            error!("Failed to withdraw vote: {err}");
        }
    }

    /// Ensure indexes and ID counters exist, then wrap the database.
    pub async fn prepare(db: Database) -> Result<Self> {
        ensure_indexes_exist(&db).await?;
        let store = Self::from_db(&db);
        ensure_counters_exist(&store.counters).await?;
        Ok(store)
    }
}

#[rocket::async_trait]
impl Store for MongoStore {
    async fn insert_voter(&self, voter: NewVoter) -> Result<Voter> {
        // The unique indexes are the only race-free check, so a clash burns
        // this id. IDs stay unique but may have gaps.
        let id = Counter::next(&self.counters, VOTER_ID_COUNTER_ID).await?;
        let voter = Voter { id, voter };
        match self.voters.insert_one(&voter, None).await {
            Ok(_) => Ok(voter),
            Err(err) => Err(match duplicate_key_message(&err) {
                Some(message) if message.contains(CITIZENSHIP_INDEX) => Error::validation(
                    "citizenshipNumber",
                    "citizenship number already registered",
                ),
                Some(_) => Error::validation("email", "email already registered"),
                None => err.into(),
            }),
        }
    }

    async fn voter_by_id(&self, id: VoterId) -> Result<Option<Voter>> {
        Ok(self.voters.find_one(doc! { "_id": id }, None).await?)
    }

    async fn voter_by_email(&self, email: &str) -> Result<Option<Voter>> {
        Ok(self.voters.find_one(doc! { "email": email }, None).await?)
    }

    async fn voters(&self) -> Result<Vec<Voter>> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let voters: Vec<Voter> = self.voters.find(None, options).await?.try_collect().await?;
        Ok(voters)
    }

    async fn admin_exists(&self) -> Result<bool> {
        Ok(self
            .voters
            .find_one(doc! { "admin": true }, None)
            .await?
            .is_some())
    }

    async fn set_verified(&self, id: VoterId) -> Result<bool> {
        let result = self
            .voters
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "verified": true } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn set_accessibility(&self, id: VoterId, flags: Accessibility) -> Result<bool> {
        let update = doc! {
            "$set": {
                "is_blind": flags.is_blind,
                "is_disabled": flags.is_disabled,
            }
        };
        let result = self
            .voters
            .update_one(doc! { "_id": id }, update, None)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn poll(&self) -> Result<Option<Poll>> {
        Ok(self
            .polls
            .find_one(doc! { "_id": ACTIVE_POLL_ID }, None)
            .await?
            .map(|active| active.poll))
    }

    async fn replace_poll(&self, spec: PollSpec) -> Result<Poll> {
        let running = Error::InvalidTransition {
            from: PollState::Running,
            to: PollState::NotStarted,
        };
        if let Some(current) = self.poll().await? {
            if current.state == PollState::Running {
                return Err(running);
            }
        }

        let poll = Poll {
            id: Counter::next(&self.counters, POLL_ID_COUNTER_ID).await?,
            spec,
            state: PollState::NotStarted,
        };
        // Only replace a poll that is not running; if it started since the
        // check above, the upsert collides with the existing `_id`.
        let filter = doc! {
            "_id": ACTIVE_POLL_ID,
            "state": { "$ne": PollState::Running },
        };
        let replacement = ActivePoll {
            slot: ACTIVE_POLL_ID.to_string(),
            poll: poll.clone(),
        };
        let options = FindOneAndReplaceOptions::builder().upsert(true).build();
        let result = self
            .polls
            .find_one_and_replace(filter, replacement, options)
            .await;
        if is_duplicate_key_error(result.as_ref()) {
            return Err(running);
        }
        result?;

        // Candidates without a total read as zero, so a failure here loses nothing.
        let totals = poll.spec.candidates.iter().map(|candidate| CandidateTotal {
            poll_id: poll.id,
            candidate: candidate.clone(),
            votes: 0,
        });
        if let Err(err) = self.totals.insert_many(totals, None).await {
            warn!("Failed to seed totals for poll {}: {err}", poll.id);
        }
        Ok(poll)
    }

    async fn transition_poll(&self, from: PollState, to: PollState) -> Result<bool> {
        let result = self
            .polls
            .update_one(
                doc! { "_id": ACTIVE_POLL_ID, "state": from },
                doc! { "$set": { "state": to } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn vote_record(&self, poll: PollId, voter: VoterId) -> Result<Option<VoteRecord>> {
        Ok(self
            .votes
            .find_one(doc! { "poll_id": poll, "voter_id": voter }, None)
            .await?)
    }

    async fn insert_vote(&self, record: VoteRecord) -> Result<()> {
        let result = self.votes.insert_one(&record, None).await;
        if is_duplicate_key_error(result.as_ref()) {
            return Err(Error::AlreadyVoted {
                voter: record.voter_id,
                poll: record.poll_id,
            });
        }
        result?;

        let filter = doc! { "poll_id": record.poll_id, "candidate": record.candidate.as_str() };
        let options = UpdateOptions::builder().upsert(true).build();
        if let Err(err) = self
            .totals
            .update_one(filter, doc! { "$inc": { "votes": 1_i64 } }, options)
            .await
        {
            // The vote must not stand uncounted; withdraw it.
            error!(
                "Failed to count vote of voter {} in poll {}, withdrawing it",
                record.voter_id, record.poll_id
            );
            self.withdraw(&record, false).await;
            return Err(err.into());
        }

        // A transition that landed while the vote was being written wins.
        let poll = self.poll().await;
        match poll {
            Ok(Some(poll)) if poll.id == record.poll_id && poll.state == PollState::Running => {
                Ok(())
            }
            Ok(poll) => {
                let state = match poll {
                    Some(poll) if poll.id == record.poll_id => poll.state,
                    _ => PollState::Finished,
                };
                warn!(
                    "Poll {} was {state} by the time voter {} was counted, withdrawing the vote",
                    record.poll_id, record.voter_id
                );
                self.withdraw(&record, true).await;
                Err(Error::PollNotOpen(state))
            }
            Err(err) => {
                self.withdraw(&record, true).await;
                Err(err)
            }
        }
    }

    async fn totals(&self, poll: PollId) -> Result<HashMap<String, u64>> {
        let totals: Vec<CandidateTotal> = self
            .totals
            .find(doc! { "poll_id": poll }, None)
            .await?
            .try_collect()
            .await?;
        Ok(totals
            .into_iter()
            .map(|total| (total.candidate, total.votes.max(0) as u64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mongodb::Client;
    use rocket::{futures::future::join_all, tokio};

    use crate::model::{store::Storage, voter::Accessibility};

    use super::*;

    /// Connection string of a scratch MongoDB server; without it these tests pass vacuously.
    const TEST_DB_URI: &str = "ACCESSVOTE_TEST_DB_URI";

    /// A prepared store on a database of its own, dropped when the test is done.
    async fn scratch_store() -> Option<(Database, MongoStore)> {
        let uri = match std::env::var(TEST_DB_URI) {
            Ok(uri) => uri,
            Err(_) => {
                eprintln!("{TEST_DB_URI} is not set, skipping");
                return None;
            }
        };
        let client = Client::with_uri_str(uri).await.unwrap();
        let db = client.database(&format!("accessvote_test_{:08x}", rand::random::<u32>()));
        let store = MongoStore::prepare(db.clone()).await.unwrap();
        Some((db, store))
    }

    fn record(poll_id: PollId, voter_id: VoterId, candidate: &str) -> VoteRecord {
        VoteRecord {
            poll_id,
            voter_id,
            voter_name: "Voter".into(),
            candidate: candidate.into(),
            cast_at: Utc::now(),
        }
    }

    async fn running_poll(store: &MongoStore) -> Poll {
        let poll = store.replace_poll(PollSpec::example()).await.unwrap();
        assert!(store
            .transition_poll(PollState::NotStarted, PollState::Running)
            .await
            .unwrap());
        poll
    }

    #[rocket::async_test]
    async fn unique_indexes_name_the_clashing_field() {
        let Some((db, store)) = scratch_store().await else { return };

        let first = NewVoter::example("first@example.com", false, Accessibility::default());
        let first = store.insert_voter(first).await.unwrap();
        assert_eq!(
            store.voter_by_email("first@example.com").await.unwrap().unwrap().id,
            first.id
        );

        let same_email = NewVoter {
            citizenship_hmac: "another-digest".into(),
            ..NewVoter::example("first@example.com", false, Accessibility::default())
        };
        assert!(matches!(
            store.insert_voter(same_email).await,
            Err(Error::Validation { field: "email", .. })
        ));
        let same_citizen = NewVoter {
            email: "other@example.com".into(),
            ..NewVoter::example("first@example.com", false, Accessibility::default())
        };
        assert!(matches!(
            store.insert_voter(same_citizen).await,
            Err(Error::Validation { field: "citizenshipNumber", .. })
        ));

        let second = NewVoter::example("second@example.com", true, Accessibility::default());
        let second = store.insert_voter(second).await.unwrap();
        assert!(second.id > first.id);
        assert!(store.admin_exists().await.unwrap());
        assert_eq!(store.voters().await.unwrap().len(), 2);

        db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    async fn lifecycle_is_conditional() {
        let Some((db, store)) = scratch_store().await else { return };

        assert!(!store
            .transition_poll(PollState::NotStarted, PollState::Running)
            .await
            .unwrap());
        let poll = running_poll(&store).await;
        assert!(!store
            .transition_poll(PollState::NotStarted, PollState::Running)
            .await
            .unwrap());
        assert!(matches!(
            store.replace_poll(PollSpec::example()).await,
            Err(Error::InvalidTransition { from: PollState::Running, .. })
        ));
        assert!(store
            .transition_poll(PollState::Running, PollState::Finished)
            .await
            .unwrap());

        let next = store.replace_poll(PollSpec::example()).await.unwrap();
        assert!(next.id > poll.id);
        assert_eq!(store.poll().await.unwrap().unwrap().state, PollState::NotStarted);

        db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    async fn concurrent_votes_count_once() {
        let Some((db, store)) = scratch_store().await else { return };
        let poll = running_poll(&store).await;
        let storage = Storage::new(store);

        let poll_id = poll.id;
        let casts = (0..16).map(|i| {
            let storage = storage.clone();
            let candidate = if i % 2 == 0 { "Alice" } else { "Bob" };
            tokio::spawn(async move { storage.insert_vote(record(poll_id, 7, candidate)).await })
        });
        let results: Vec<_> = join_all(casts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::AlreadyVoted { voter: 7, .. })));

        let totals = storage.totals(poll.id).await.unwrap();
        assert_eq!(totals.values().sum::<u64>(), 1);
        assert!(storage.vote_record(poll.id, 7).await.unwrap().is_some());

        db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    async fn votes_after_finish_are_withdrawn() {
        let Some((db, store)) = scratch_store().await else { return };
        let poll = running_poll(&store).await;
        store.insert_vote(record(poll.id, 1, "Alice")).await.unwrap();
        store
            .transition_poll(PollState::Running, PollState::Finished)
            .await
            .unwrap();

        assert!(matches!(
            store.insert_vote(record(poll.id, 2, "Alice")).await,
            Err(Error::PollNotOpen(PollState::Finished))
        ));
        assert!(store.vote_record(poll.id, 2).await.unwrap().is_none());
        assert_eq!(store.totals(poll.id).await.unwrap()["Alice"], 1);

        db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    async fn refused_polls_leave_no_totals() {
        let Some((db, store)) = scratch_store().await else { return };
        let first = store.replace_poll(PollSpec::example()).await.unwrap();
        let storage = Storage::new(store);

        // Creates racing a start: whichever lose must not leave totals behind.
        let creates = (0..8).map(|_| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.replace_poll(PollSpec::example()).await })
        });
        let start = storage.transition_poll(PollState::NotStarted, PollState::Running);
        let (created, _) = tokio::join!(join_all(creates), start);

        let mut live: Vec<PollId> = created
            .into_iter()
            .filter_map(|joined| joined.unwrap().ok())
            .map(|poll| poll.id)
            .collect();
        live.push(first.id);

        let totals: Vec<CandidateTotal> = Coll::<CandidateTotal>::from_db(&db)
            .find(None, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(totals.iter().all(|total| live.contains(&total.poll_id)));

        db.drop(None).await.unwrap();
    }
}
