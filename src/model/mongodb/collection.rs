use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{ledger::VoteRecord, voter::Voter};

use super::{
    counter::Counter,
    store::{ActivePoll, CandidateTotal},
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Voter {
    const NAME: &'static str = "voters";
}

impl MongoCollection for ActivePoll {
    const NAME: &'static str = "polls";
}

impl MongoCollection for VoteRecord {
    const NAME: &'static str = "votes";
}

impl MongoCollection for CandidateTotal {
    const NAME: &'static str = "candidate_totals";
}

impl MongoCollection for Counter {
    const NAME: &'static str = "counters";
}

pub const EMAIL_INDEX: &str = "unique_email";
pub const CITIZENSHIP_INDEX: &str = "unique_citizenship";

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = |name: &str| {
        IndexOptions::builder()
            .unique(true)
            .name(name.to_string())
            .build()
    };

    // Voter collection.
    let voters = Coll::<Voter>::from_db(db);
    let email_index = IndexModel::builder()
        .keys(doc! {"email": 1})
        .options(unique(EMAIL_INDEX))
        .build();
    voters.create_index(email_index, None).await?;
    let citizenship_index = IndexModel::builder()
        .keys(doc! {"citizenship_hmac": 1})
        .options(unique(CITIZENSHIP_INDEX))
        .build();
    voters.create_index(citizenship_index, None).await?;

    // Vote collection: at most one vote per voter per poll.
    let vote_index = IndexModel::builder()
        .keys(doc! {"poll_id": 1, "voter_id": 1})
        .options(unique("unique_vote"))
        .build();
    Coll::<VoteRecord>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    // Candidate totals collection.
    let totals_index = IndexModel::builder()
        .keys(doc! {"poll_id": 1, "candidate": 1})
        .options(unique("unique_total"))
        .build();
    Coll::<CandidateTotal>::from_db(db)
        .create_index(totals_index, None)
        .await?;

    Ok(())
}
