use rocket::{serde::json::Json, Route};

use crate::{
    error::{Error, Result},
    model::{
        auth::{AdminIdentity, Identity},
        store::Storage,
        voter::{Accessibility, VoterDetails, VoterId},
    },
};

pub fn routes() -> Vec<Route> {
    routes![list, details, verify, set_accessibility]
}

async fn load(storage: &Storage, id: VoterId) -> Result<Json<VoterDetails>> {
    let voter = storage
        .voter_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("voter {id}")))?;
    Ok(Json(VoterDetails::from(&voter)))
}

fn require_access(identity: &Identity, id: VoterId) -> Result<()> {
    if identity.may_act_for(id) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "voter {} cannot view voter {id}",
            identity.id
        )))
    }
}

#[get("/users")]
pub async fn list(_admin: AdminIdentity, storage: Storage) -> Result<Json<Vec<VoterDetails>>> {
    let voters = storage.voters().await?;
    Ok(Json(voters.iter().map(VoterDetails::from).collect()))
}

#[get("/users/<id>")]
pub async fn details(id: VoterId, identity: Identity, storage: Storage) -> Result<Json<VoterDetails>> {
    require_access(&identity, id)?;
    load(&storage, id).await
}

/// Approve a registration so the voter can sign in.
#[post("/users/<id>/verify")]
pub async fn verify(id: VoterId, admin: AdminIdentity, storage: Storage) -> Result<Json<VoterDetails>> {
    if !storage.set_verified(id).await? {
        return Err(Error::NotFound(format!("voter {id}")));
    }
    info!("Admin {} verified voter {id}", admin.id);
    load(&storage, id).await
}

/// Change which assistive input a voter uses. Takes effect from their next
/// sign-in, since live access tokens carry the old flags.
#[put("/users/<id>/accessibility", data = "<flags>", format = "json")]
pub async fn set_accessibility(
    id: VoterId,
    flags: Json<Accessibility>,
    identity: Identity,
    storage: Storage,
) -> Result<Json<VoterDetails>> {
    require_access(&identity, id)?;
    if !storage.set_accessibility(id, flags.into_inner()).await? {
        return Err(Error::NotFound(format!("voter {id}")));
    }
    info!("Voter {} updated accessibility of voter {id}", identity.id);
    load(&storage, id).await
}
