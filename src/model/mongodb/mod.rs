mod collection;
mod counter;
mod errors;
mod store;

pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use counter::{ensure_counters_exist, Counter, POLL_ID_COUNTER_ID, VOTER_ID_COUNTER_ID};
pub use errors::{duplicate_key_message, is_duplicate_key_error};
pub use store::MongoStore;
