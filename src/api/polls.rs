use rocket::{serde::json::Json, Route, State};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    assist::{
        AssistGuard, AssistOutcome, AssistedSession, Collaborators, HttpAssistServices, Modality,
        SessionLimits, Transcript,
    },
    config::Config,
    error::{Error, Result},
    logging::RequestId,
    model::{
        auth::{AdminIdentity, Identity},
        ledger::{VoteLedger, VoteReceipt, Voteability},
        poll::{Poll, PollSnapshot, PollSpec, PollStatus},
        registry::PollRegistry,
        store::Storage,
        voter::VoterId,
    },
};

pub fn routes() -> Vec<Route> {
    routes![
        status,
        snapshot,
        check_voteability,
        vote,
        create,
        start,
        finish,
        assisted_vote
    ]
}

/// Clients send voter IDs either as JSON numbers or as numeric strings.
fn voter_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<VoterId, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(VoterId),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("'{text}' is not a voter ID"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoterRef {
    #[serde(deserialize_with = "voter_id")]
    pub id: VoterId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    #[serde(deserialize_with = "voter_id")]
    pub id: VoterId,
    /// Display name sent by older clients; the session's name is recorded.
    #[serde(default)]
    pub name: Option<String>,
    pub candidate: String,
}

/// Only the voter named in the body may act, and only as themselves.
fn require_self(identity: &Identity, voter: VoterId) -> Result<()> {
    if identity.id == voter {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "voter {} cannot act for voter {voter}",
            identity.id
        )))
    }
}

#[get("/polls/status")]
pub async fn status(_identity: Identity, storage: Storage) -> Result<Json<PollStatus>> {
    let status = PollRegistry::new(storage).state().await?;
    Ok(Json(PollStatus { status }))
}

#[get("/polls")]
pub async fn snapshot(_identity: Identity, storage: Storage) -> Result<Json<PollSnapshot>> {
    Ok(Json(PollRegistry::new(storage).snapshot().await?))
}

#[post("/polls/check-voteability", data = "<voter>", format = "json")]
pub async fn check_voteability(
    voter: Json<VoterRef>,
    identity: Identity,
    storage: Storage,
) -> Result<Json<Voteability>> {
    require_self(&identity, voter.id)?;
    Ok(Json(VoteLedger::new(storage).check_voteability(voter.id).await?))
}

#[post("/polls/vote", data = "<ballot>", format = "json")]
pub async fn vote(
    ballot: Json<VoteRequest>,
    identity: Identity,
    storage: Storage,
) -> Result<Json<VoteReceipt>> {
    require_self(&identity, ballot.id)?;
    let receipt = VoteLedger::new(storage)
        .cast(&identity, &ballot.candidate)
        .await?;
    Ok(Json(receipt))
}

#[post("/polls", data = "<spec>", format = "json")]
pub async fn create(
    spec: Json<PollSpec>,
    admin: AdminIdentity,
    storage: Storage,
) -> Result<Json<Poll>> {
    let poll = PollRegistry::new(storage)
        .create(&admin, spec.into_inner())
        .await?;
    Ok(Json(poll))
}

#[post("/polls/start")]
pub async fn start(admin: AdminIdentity, storage: Storage) -> Result<Json<PollStatus>> {
    let status = PollRegistry::new(storage).start(&admin).await?;
    Ok(Json(PollStatus { status }))
}

#[post("/polls/finish")]
pub async fn finish(admin: AdminIdentity, storage: Storage) -> Result<Json<PollStatus>> {
    let status = PollRegistry::new(storage).finish(&admin).await?;
    Ok(Json(PollStatus { status }))
}

/// What happened during an assisted session, with everything that was
/// announced to the voter along the way.
#[derive(Debug, Serialize)]
pub struct AssistReport {
    pub modality: Modality,
    #[serde(flatten)]
    pub outcome: AssistOutcome,
    pub announcements: Transcript,
}

/// Run the assisted flow for the signed-in voter against the configured
/// assistive services.
#[post("/polls/assisted-vote")]
pub async fn assisted_vote(
    identity: Identity,
    storage: Storage,
    config: &State<Config>,
    services: &State<HttpAssistServices>,
    guard: &State<AssistGuard>,
    id: &RequestId,
) -> Result<Json<AssistReport>> {
    let modality = Modality::for_voter(&identity)?;
    let _in_flight = guard.claim(identity.id)?;
    debug!("{id} running assisted {modality:?} session for voter {}", identity.id);

    let limits = SessionLimits {
        call_timeout: config.assist_timeout(),
        max_speech_attempts: config.max_speech_attempts(),
    };
    let mut session = AssistedSession::new(
        identity,
        PollRegistry::new(storage.clone()),
        VoteLedger::new(storage),
        Collaborators::http(services.inner()),
        limits,
    );
    let mut announcements = Transcript::default();
    let outcome = session.run(&mut announcements).await?;

    Ok(Json(AssistReport {
        modality,
        outcome,
        announcements,
    }))
}
