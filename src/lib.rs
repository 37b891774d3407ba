#[macro_use]
extern crate rocket;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{figment::Figment, Build, Rocket};

pub mod api;
pub mod assist;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;

use config::{ConfigFairing, StoreFairing};
use logging::LoggerFairing;
use model::store::Storage;

/// Build the server from `Rocket.toml` and the environment.
pub fn build() -> Rocket<Build> {
    assemble(rocket::build())
}

/// Build the server from the given configuration, backed by an existing store.
pub fn rocket_for_store(figment: Figment, storage: Storage) -> Rocket<Build> {
    assemble(rocket::custom(figment).manage(storage))
}

fn assemble(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .mount("/", api::routes())
        .register("/", catchers![error::default_catcher])
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(StoreFairing)
}

/// The configuration every test server runs with.
#[cfg(test)]
pub(crate) fn test_figment() -> Figment {
    use model::auth::{ACCESS_SECRET, REFRESH_SECRET};
    use rocket::data::{Limits, ToByteUnit};

    rocket::Config::figment()
        .merge(("limits", Limits::default().limit("json", 8.mebibytes())))
        .merge(("log_level", "off"))
        .merge(("hmac_secret", "hmac-secret-for-tests"))
        .merge(("access_token_secret", ACCESS_SECRET))
        .merge(("refresh_token_secret", REFRESH_SECRET))
        .merge(("store", "memory"))
        .merge(("assist_service_url", "http://127.0.0.1:9"))
        .merge(("assist_timeout", 2))
}

#[cfg(test)]
pub(crate) use testing::Bearer;

/// Helpers for tests that talk to the server as a signed-in user.
#[cfg(test)]
pub(crate) mod testing {
    use rocket::{
        http::{ContentType, Header, Status},
        local::asynchronous::Client,
        serde::json::json,
    };
    use serde::Deserialize;

    use crate::model::{
        auth::Identity,
        store::Storage,
        voter::{Accessibility, NewVoter},
    };

    /// An access token together with the identity it was issued for.
    #[derive(Debug, Clone)]
    pub struct Bearer {
        pub token: String,
        pub identity: Identity,
    }

    impl Bearer {
        pub fn header(&self) -> Header<'static> {
            Header::new("Authorization", format!("Bearer {}", self.token))
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub enum Role {
        Admin,
        Voter,
        BlindVoter,
        DisabledVoter,
    }

    impl Role {
        fn account(self) -> (&'static str, bool, Accessibility) {
            let mut accessibility = Accessibility::default();
            let (email, admin) = match self {
                Self::Admin => ("admin@example.com", true),
                Self::Voter => ("voter@example.com", false),
                Self::BlindVoter => {
                    accessibility.is_blind = true;
                    ("blind@example.com", false)
                }
                Self::DisabledVoter => {
                    accessibility.is_disabled = true;
                    ("disabled@example.com", false)
                }
            };
            (email, admin, accessibility)
        }
    }

    #[derive(Deserialize)]
    struct Session {
        user: Identity,
        #[serde(rename = "accessToken")]
        access_token: String,
    }

    /// Register a verified account for the role and sign it in.
    /// The client keeps the refresh cookie.
    pub async fn login(client: &Client, storage: &Storage, role: Role) -> Bearer {
        let (email, admin, accessibility) = role.account();
        storage
            .insert_voter(NewVoter::example(email, admin, accessibility))
            .await
            .unwrap();

        let response = client
            .post("/auth/login")
            .header(ContentType::JSON)
            .body(json!({"email": email, "password": "password123"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let session: Session = response.into_json().await.unwrap();
        Bearer {
            token: session.access_token,
            identity: session.user,
        }
    }
}
