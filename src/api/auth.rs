use rocket::{
    http::{Cookie, CookieJar, Status},
    serde::json::Json,
    Route, State,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{Error, Result},
    model::{
        auth::{Identity, RefreshCredential, TokenService, LEGACY_REFRESH_COOKIE, REFRESH_COOKIE},
        store::Storage,
        voter::{normalise_email, SignupRequest, VoterSummary},
    },
};

pub fn routes() -> Vec<Route> {
    routes![signup, login, check, logout]
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// A signed-in session: the identity and its access token. The refresh
/// token travels separately, in an HTTP-only cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user: Identity,
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

#[post("/auth/signup", data = "<request>", format = "json")]
pub async fn signup(
    request: Json<SignupRequest>,
    storage: Storage,
    config: &State<Config>,
) -> Result<(Status, Json<VoterSummary>)> {
    let voter = request.into_inner().into_voter(config)?;
    let voter = storage.insert_voter(voter).await?;
    info!("Registered voter {} <{}>", voter.id, voter.email);
    Ok((Status::Created, Json(VoterSummary::from(&voter))))
}

#[post("/auth/login", data = "<credentials>", format = "json")]
pub async fn login(
    credentials: Json<LoginRequest>,
    cookies: &CookieJar<'_>,
    storage: Storage,
    tokens: &State<TokenService>,
    config: &State<Config>,
) -> Result<Json<SessionResponse>> {
    let rejected = || Error::InvalidCredential("Invalid email or password".to_string());

    let email = normalise_email(&credentials.email).map_err(|_| rejected())?;
    let voter = storage.voter_by_email(&email).await?.ok_or_else(rejected)?;
    if !voter.verify_password(&credentials.password)? {
        return Err(rejected());
    }
    if !voter.verified {
        return Err(Error::InvalidCredential(
            "Account has not been verified yet".to_string(),
        ));
    }

    let identity = Identity::from(&voter);
    let pair = tokens.issue(&identity)?;
    cookies.add(tokens.refresh_cookie(pair.refresh, config.secure_cookies()));
    info!("Voter {} signed in", identity.id);

    Ok(Json(SessionResponse {
        user: identity,
        access_token: pair.access,
    }))
}

/// Exchange the refresh cookie for a new access token and a rotated cookie.
#[post("/auth/check")]
pub async fn check(
    refresh: RefreshCredential,
    cookies: &CookieJar<'_>,
    tokens: &State<TokenService>,
    config: &State<Config>,
) -> Result<Json<SessionResponse>> {
    let (identity, pair) = match tokens.rotate(&refresh.0) {
        Ok(rotated) => rotated,
        Err(err) => {
            if matches!(err, Error::InvalidCredential(_)) {
                remove_refresh_cookies(cookies);
            }
            return Err(err);
        }
    };
    cookies.remove(Cookie::named(LEGACY_REFRESH_COOKIE));
    cookies.add(tokens.refresh_cookie(pair.refresh, config.secure_cookies()));

    Ok(Json(SessionResponse {
        user: identity,
        access_token: pair.access,
    }))
}

#[post("/auth/logout")]
pub fn logout(cookies: &CookieJar<'_>) -> Status {
    remove_refresh_cookies(cookies);
    Status::Ok
}

fn remove_refresh_cookies(cookies: &CookieJar<'_>) {
    cookies.remove(Cookie::named(REFRESH_COOKIE));
    cookies.remove(Cookie::named(LEGACY_REFRESH_COOKIE));
}
