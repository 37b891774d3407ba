pub mod auth;
pub mod ledger;
pub mod memory;
pub mod mongodb;
pub mod poll;
pub mod registry;
pub mod store;
pub mod voter;
