use argon2::Error as Argon2Error;
use mongodb::error::Error as DbError;
use rocket::{
    http::Status,
    request::{self, Request},
    response::Responder,
    serde::json::Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    poll::{PollId, PollState},
    voter::VoterId,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Voter {voter} has already voted in poll {poll}")]
    AlreadyVoted { voter: VoterId, poll: PollId },
    #[error("Unknown candidate '{0}'")]
    UnknownCandidate(String),
    #[error("Poll is not open for voting (currently {0})")]
    PollNotOpen(PollState),
    #[error("Cannot move poll from {from} to {to}")]
    InvalidTransition { from: PollState, to: PollState },
    #[error("An assisted voting session is already running for voter {0}")]
    SessionBusy(VoterId),
    #[error("Server misconfigured: {0}")]
    Config(String),
    /// A broken invariant inside the server, as opposed to bad settings.
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Assistive service failure: {0}")]
    Collaborator(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Argon2(#[from] Argon2Error),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] on the given field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Fail a request guard with this error. The message is kept in the
    /// request cache so the catcher can render it.
    pub fn into_outcome<S>(self, req: &Request<'_>) -> request::Outcome<S, Self> {
        let status = self.status();
        self.log();
        let message = self.to_string();
        req.local_cache(|| GuardFailure(Some(message)));
        request::Outcome::Failure((status, self))
    }

    fn log(&self) {
        if self.status().code >= 500 {
            error!("{self}");
        } else {
            warn!("{self}");
        }
    }

    /// The HTTP status this error is reported with.
    pub fn status(&self) -> Status {
        match self {
            Self::Validation { .. }
            | Self::Unauthenticated(_)
            | Self::InvalidCredential(_)
            | Self::UnknownCandidate(_) => Status::BadRequest,
            Self::Forbidden(_) => Status::Forbidden,
            Self::NotFound(_) => Status::NotFound,
            Self::AlreadyVoted { .. }
            | Self::PollNotOpen(_)
            | Self::InvalidTransition { .. }
            | Self::SessionBusy(_) => Status::Conflict,
            Self::Collaborator(_) => Status::BadGateway,
            Self::Config(_) | Self::Internal(_) | Self::Db(_) | Self::Argon2(_) => {
                Status::InternalServerError
            }
        }
    }
}

/// JSON body sent alongside every error status.
#[derive(Serialize)]
pub struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        let status = self.status();
        self.log();
        let field = match &self {
            Self::Validation { field, .. } => Some(*field),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            field,
        };
        (status, Json(body)).respond_to(req)
    }
}

/// Message of the error that failed a request guard, if any.
struct GuardFailure(Option<String>);

/// Render every non-handler failure (guards, unmatched routes, bad bodies)
/// with the same JSON shape as handler errors.
#[catch(default)]
pub fn default_catcher(status: Status, req: &Request<'_>) -> (Status, Json<ErrorBody>) {
    let error = match &req.local_cache(|| GuardFailure(None)).0 {
        Some(message) => message.clone(),
        None => status.reason().unwrap_or("Unknown error").to_string(),
    };
    (status, Json(ErrorBody { error, field: None }))
}
