use chrono::{serde::ts_seconds, DateTime, Duration, Utc};
use jsonwebtoken::{
    errors::ErrorKind as JwtErrorKind, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use rocket::http::{Cookie, SameSite};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

use super::Identity;

/// Cookie carrying the refresh credential.
pub const REFRESH_COOKIE: &str = "refreshToken";
/// Older clients used this name; still accepted on the way in.
pub const LEGACY_REFRESH_COOKIE: &str = "refresh";

/// Token claims: the identity plus an expiry datetime.
#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    identity: Identity,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

/// A freshly issued access/refresh credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

struct SigningKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
}

/// Issues, verifies and rotates session credentials.
///
/// Purely computational: nothing is remembered between calls, so a rotated
/// refresh token stays usable until its own expiry.
pub struct TokenService {
    keys: std::result::Result<SigningKeys, String>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    validation: Validation,
}

impl TokenService {
    /// Create a token service. Missing, empty or identical secrets are not an
    /// error here; every operation reports them as [`Error::Config`] instead.
    pub fn new(
        access_secret: Option<&str>,
        refresh_secret: Option<&str>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        let keys = match (access_secret, refresh_secret) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                if access == refresh {
                    Err("access and refresh token secrets must differ".to_string())
                } else {
                    Ok(SigningKeys {
                        access_encoding: EncodingKey::from_secret(access.as_bytes()),
                        access_decoding: DecodingKey::from_secret(access.as_bytes()),
                        refresh_encoding: EncodingKey::from_secret(refresh.as_bytes()),
                        refresh_decoding: DecodingKey::from_secret(refresh.as_bytes()),
                    })
                }
            }
            _ => Err("access and refresh token secrets are not configured".to_string()),
        };
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            keys,
            access_ttl,
            refresh_ttl,
            validation,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.access_token_secret(),
            config.refresh_token_secret(),
            config.access_ttl(),
            config.refresh_ttl(),
        )
    }

    /// Is the service able to sign tokens?
    pub fn is_configured(&self) -> bool {
        self.keys.is_ok()
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn keys(&self) -> Result<&SigningKeys> {
        self.keys.as_ref().map_err(|msg| Error::Config(msg.clone()))
    }

    /// Sign a fresh access/refresh pair for the given identity.
    pub fn issue(&self, identity: &Identity) -> Result<TokenPair> {
        let keys = self.keys()?;
        let now = Utc::now();
        Ok(TokenPair {
            access: sign(identity, now + self.access_ttl, &keys.access_encoding)?,
            refresh: sign(identity, now + self.refresh_ttl, &keys.refresh_encoding)?,
        })
    }

    /// Check an access token, returning the identity it carries.
    pub fn verify(&self, access: &str) -> Result<Identity> {
        let keys = self.keys()?;
        self.decode(access, &keys.access_decoding)
    }

    /// Exchange a refresh token for a new pair. The claims are carried forward
    /// from the presented token as-is.
    pub fn rotate(&self, refresh: &str) -> Result<(Identity, TokenPair)> {
        let keys = self.keys()?;
        let identity = self.decode(refresh, &keys.refresh_decoding)?;
        let pair = self.issue(&identity)?;
        debug!("Rotated refresh credential for voter {}", identity.id);
        Ok((identity, pair))
    }

    fn decode(&self, token: &str, key: &DecodingKey) -> Result<Identity> {
        jsonwebtoken::decode(token, key, &self.validation)
            .map(|data: TokenData<Claims>| data.claims.identity)
            .map_err(|err| {
                Error::InvalidCredential(
                    match err.kind() {
                        JwtErrorKind::ExpiredSignature => "token has expired",
                        JwtErrorKind::InvalidSignature => "token signature is invalid",
                        _ => "token is malformed",
                    }
                    .to_string(),
                )
            })
    }

    /// Build the cookie that carries a refresh token.
    pub fn refresh_cookie(&self, refresh: String, secure: bool) -> Cookie<'static> {
        Cookie::build(REFRESH_COOKIE, refresh)
            .path("/")
            .max_age(rocket::time::Duration::seconds(
                self.refresh_ttl.num_seconds(),
            ))
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(secure)
            .finish()
    }
}

fn sign(identity: &Identity, expire_at: DateTime<Utc>, key: &EncodingKey) -> Result<String> {
    let claims = Claims {
        identity: identity.clone(),
        expire_at,
    };
    jsonwebtoken::encode(&Header::default(), &claims, key)
        .map_err(|err| Error::Config(format!("failed to sign token: {err}")))
}

#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    pub const ACCESS_SECRET: &str = "access-secret-for-tests";
    pub const REFRESH_SECRET: &str = "refresh-secret-for-tests";

    impl TokenService {
        pub fn example() -> Self {
            Self::new(
                Some(ACCESS_SECRET),
                Some(REFRESH_SECRET),
                Duration::minutes(10),
                Duration::days(1),
            )
        }

        /// A service whose tokens are already expired when issued.
        pub fn example_expired() -> Self {
            Self::new(
                Some(ACCESS_SECRET),
                Some(REFRESH_SECRET),
                Duration::seconds(-30),
                Duration::seconds(-30),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_verify_round_trips_claims() {
        let tokens = TokenService::example();
        let identity = Identity::example(9);
        let pair = tokens.issue(&identity).unwrap();
        assert_ne!(pair.access, pair.refresh);
        assert_eq!(tokens.verify(&pair.access).unwrap(), identity);

        let blind = Identity {
            is_blind: true,
            ..Identity::example_admin()
        };
        let pair = tokens.issue(&blind).unwrap();
        assert_eq!(tokens.verify(&pair.access).unwrap(), blind);
    }

    #[test]
    fn credentials_are_not_interchangeable() {
        let tokens = TokenService::example();
        let pair = tokens.issue(&Identity::example(1)).unwrap();
        assert!(matches!(
            tokens.verify(&pair.refresh),
            Err(Error::InvalidCredential(_))
        ));
        assert!(matches!(
            tokens.rotate(&pair.access),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[test]
    fn rotate_carries_claims_forward() {
        let tokens = TokenService::example();
        let identity = Identity::example(4);
        let pair = tokens.issue(&identity).unwrap();
        let (rotated_identity, rotated) = tokens.rotate(&pair.refresh).unwrap();
        assert_eq!(rotated_identity, identity);
        assert_eq!(tokens.verify(&rotated.access).unwrap(), identity);
        // No revocation list: the superseded refresh token still works.
        assert!(tokens.rotate(&pair.refresh).is_ok());
    }

    #[test]
    fn rotate_rejects_expired_and_tampered_tokens() {
        let expired = TokenService::example_expired()
            .issue(&Identity::example(1))
            .unwrap();
        let tokens = TokenService::example();
        assert!(matches!(
            tokens.rotate(&expired.refresh),
            Err(Error::InvalidCredential(_))
        ));
        assert!(matches!(
            tokens.verify(&expired.access),
            Err(Error::InvalidCredential(_))
        ));

        let pair = tokens.issue(&Identity::example(1)).unwrap();
        let mut tampered = pair.refresh.clone();
        // Flip a character in the payload section.
        let payload_start = tampered.find('.').unwrap() + 1;
        let flipped = if &tampered[payload_start..payload_start + 1] == "e" {
            "f"
        } else {
            "e"
        };
        tampered.replace_range(payload_start..payload_start + 1, flipped);
        assert!(matches!(
            tokens.rotate(&tampered),
            Err(Error::InvalidCredential(_))
        ));
        assert!(matches!(
            tokens.rotate("not.a.token"),
            Err(Error::InvalidCredential(_))
        ));

        let forged = TokenService::new(
            Some("someone-else"),
            Some("someone-elses-refresh"),
            Duration::minutes(10),
            Duration::days(1),
        )
        .issue(&Identity::example_admin())
        .unwrap();
        assert!(matches!(
            tokens.rotate(&forged.refresh),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[test]
    fn missing_secrets_are_config_errors() {
        let identity = Identity::example(1);
        for tokens in [
            TokenService::new(None, Some("r"), Duration::minutes(1), Duration::days(1)),
            TokenService::new(Some("a"), Some(""), Duration::minutes(1), Duration::days(1)),
            TokenService::new(Some("same"), Some("same"), Duration::minutes(1), Duration::days(1)),
        ] {
            assert!(!tokens.is_configured());
            assert!(matches!(tokens.issue(&identity), Err(Error::Config(_))));
            assert!(matches!(tokens.rotate("x.y.z"), Err(Error::Config(_))));
            assert!(matches!(tokens.verify("x.y.z"), Err(Error::Config(_))));
        }
    }
}
