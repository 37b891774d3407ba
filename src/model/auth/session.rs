use std::ops::Deref;

use rocket::{
    outcome::try_outcome,
    request::{FromRequest, Outcome},
    Request,
};

use crate::error::Error;

use super::{Identity, TokenService, LEGACY_REFRESH_COOKIE, REFRESH_COOKIE};

const BEARER_PREFIX: &str = "Bearer ";

fn token_service<'r>(req: &'r Request<'_>) -> Result<&'r TokenService, Error> {
    req.rocket()
        .state::<TokenService>()
        .ok_or_else(|| Error::Config("token service is not managed".to_string()))
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Identity {
    type Error = Error;

    /// Resolve the access token in the `Authorization` header to an identity.
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let tokens = match token_service(req) {
            Ok(tokens) => tokens,
            Err(err) => return err.into_outcome(req),
        };

        let header = match req.headers().get_one("Authorization") {
            Some(header) => header,
            None => {
                return Error::Unauthenticated("no access token supplied".to_string())
                    .into_outcome(req)
            }
        };
        let token = match header.strip_prefix(BEARER_PREFIX) {
            Some(token) if !token.trim().is_empty() => token.trim(),
            _ => {
                return Error::Unauthenticated("expected a bearer access token".to_string())
                    .into_outcome(req)
            }
        };

        match tokens.verify(token) {
            Ok(identity) => Outcome::Success(identity),
            Err(err) => err.into_outcome(req),
        }
    }
}

/// An [`Identity`] with the admin flag set.
#[derive(Debug, Clone)]
pub struct AdminIdentity(pub Identity);

impl Deref for AdminIdentity {
    type Target = Identity;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminIdentity {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let identity = try_outcome!(req.guard::<Identity>().await);
        if identity.admin {
            Outcome::Success(AdminIdentity(identity))
        } else {
            Error::Forbidden(format!("voter {} is not an administrator", identity.id))
                .into_outcome(req)
        }
    }
}

/// The raw refresh token presented in the refresh cookie.
#[derive(Debug, Clone)]
pub struct RefreshCredential(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RefreshCredential {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let cookies = req.cookies();
        let cookie = cookies
            .get(REFRESH_COOKIE)
            .or_else(|| cookies.get(LEGACY_REFRESH_COOKIE));
        match cookie {
            Some(cookie) if !cookie.value().is_empty() => {
                Outcome::Success(RefreshCredential(cookie.value().to_string()))
            }
            _ => Error::Unauthenticated("no refresh token supplied".to_string()).into_outcome(req),
        }
    }
}
