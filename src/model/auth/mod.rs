use serde::{Deserialize, Serialize};

use crate::model::voter::VoterId;

mod session;
mod token;

pub use session::{AdminIdentity, RefreshCredential};
pub use token::{TokenPair, TokenService, LEGACY_REFRESH_COOKIE, REFRESH_COOKIE};

#[cfg(test)]
pub(crate) use token::examples::{ACCESS_SECRET, REFRESH_SECRET};

/// The identity context carried by session credentials and resolved for every
/// authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: VoterId,
    pub name: String,
    pub email: String,
    pub admin: bool,
    pub is_blind: bool,
    pub is_disabled: bool,
}

impl Identity {
    /// May this identity act on the given voter's records?
    pub fn may_act_for(&self, voter: VoterId) -> bool {
        self.admin || self.id == voter
    }
}
