use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::assist::{AssistGuard, HttpAssistServices};
use crate::model::{
    auth::TokenService,
    memory::MemoryStore,
    mongodb::MongoStore,
    store::Storage,
    voter::{ensure_admin_exists, AdminBootstrap},
};

/// Which [`Store`](crate::model::store::Store) implementation backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Mongodb,
    Memory,
}

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "default_access_ttl")]
    access_ttl: i64,
    #[serde(default = "default_refresh_ttl")]
    refresh_ttl: i64,
    #[serde(default)]
    secure_cookies: bool,
    #[serde(default)]
    store: StoreKind,
    #[serde(default = "default_assist_service_url")]
    assist_service_url: String,
    #[serde(default = "default_assist_timeout")]
    assist_timeout: u64,
    #[serde(default = "default_max_speech_attempts")]
    max_speech_attempts: u32,
    // secrets
    access_token_secret: Option<String>,
    refresh_token_secret: Option<String>,
    hmac_secret: String,
    admin_email: Option<String>,
    admin_password: Option<String>,
}

fn default_access_ttl() -> i64 {
    600
}

fn default_refresh_ttl() -> i64 {
    86_400
}

fn default_assist_service_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_assist_timeout() -> u64 {
    30
}

fn default_max_speech_attempts() -> u32 {
    3
}

impl Config {
    /// Valid lifetime of access tokens.
    pub fn access_ttl(&self) -> Duration {
        Duration::seconds(self.access_ttl)
    }

    /// Valid lifetime of refresh tokens and their cookie.
    pub fn refresh_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_ttl)
    }

    /// Should the refresh cookie be marked `Secure`?
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    pub fn store(&self) -> StoreKind {
        self.store
    }

    /// Base URL of the face, speech and gesture services.
    pub fn assist_service_url(&self) -> &str {
        self.assist_service_url.trim_end_matches('/')
    }

    /// Upper bound on each call to an assistive service.
    pub fn assist_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.assist_timeout)
    }

    /// Number of transcripts a speech session may try before giving up.
    pub fn max_speech_attempts(&self) -> u32 {
        self.max_speech_attempts.max(1)
    }

    /// Secret key used to sign access tokens.
    pub fn access_token_secret(&self) -> Option<&str> {
        self.access_token_secret.as_deref()
    }

    /// Secret key used to sign refresh tokens.
    pub fn refresh_token_secret(&self) -> Option<&str> {
        self.refresh_token_secret.as_deref()
    }

    /// Secret key used to sign HMACs.
    pub fn hmac_secret(&self) -> &[u8] {
        self.hmac_secret.as_bytes()
    }

    /// Credentials of the admin account created on first launch, if configured.
    pub fn admin_bootstrap(&self) -> Option<AdminBootstrap> {
        match (&self.admin_email, &self.admin_password) {
            (Some(email), Some(password)) => Some(AdminBootstrap {
                email: email.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// A fairing that loads the application config and puts it in managed state,
/// together with the token service and assistive service clients built from it.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Missing secrets do not stop the launch; every token operation
        // reports them instead.
        let tokens = TokenService::from_config(&config);
        if !tokens.is_configured() {
            error!("Token signing secrets are missing or invalid, sessions will be refused");
        }

        let assist = match HttpAssistServices::new(&config) {
            Ok(assist) => assist,
            Err(e) => {
                error!("Failed to build assistive service client: {e}");
                return Err(rocket);
            }
        };
        info!(
            "Loaded application config, assistive services at {}",
            config.assist_service_url()
        );

        // Manage the state.
        rocket = rocket
            .manage(config)
            .manage(tokens)
            .manage(assist)
            .manage(AssistGuard::default());
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that selects and connects the configured store, performs any
/// setup necessary, and places the [`Storage`] into managed state.
///
/// A store that is already managed (as in tests) is used as-is.
pub struct StoreFairing;

#[rocket::async_trait]
impl Fairing for StoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "Store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.state::<Config>() {
            Some(config) => config,
            None => {
                error!("Store fairing requires the application config");
                return Err(rocket);
            }
        };
        let bootstrap = config.admin_bootstrap();

        let storage = match rocket.state::<Storage>() {
            Some(storage) => storage.clone(),
            None => {
                let storage = match config.store() {
                    StoreKind::Memory => {
                        info!("Using in-memory store");
                        Storage::new(MemoryStore::default())
                    }
                    StoreKind::Mongodb => match connect(&rocket).await {
                        Some(storage) => storage,
                        None => return Err(rocket),
                    },
                };
                rocket = rocket.manage(storage.clone());
                storage
            }
        };

        // Ensure there is an admin to run the poll, if one was configured.
        if let Some(bootstrap) = bootstrap {
            let result = match rocket.state::<Config>() {
                Some(config) => ensure_admin_exists(&storage, &bootstrap, config).await,
                None => return Err(rocket),
            };
            if let Err(e) = result {
                error!("Failed to create bootstrap admin: {e}");
                return Err(rocket);
            }
        }

        Ok(rocket)
    }
}

/// Connect to MongoDB and prepare the collections.
async fn connect(rocket: &Rocket<Build>) -> Option<Storage> {
    // Load the config.
    let config = match rocket.figment().extract::<DbConfig>() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load database config");
            rocket::config::pretty_print_error(e);
            return None;
        }
    };
    info!("Loaded database config, connecting...");
    // Construct the connection.
    let client = match MongoClient::with_uri_str(config.db_uri).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to database: {e}");
            return None;
        }
    };
    let db = client.database(DATABASE_NAME);

    // Ensure the required indexes and counters exist.
    match MongoStore::prepare(db).await {
        Ok(store) => {
            info!("...database connection online!");
            Some(Storage::new(store))
        }
        Err(e) => {
            error!("Failed to prepare database: {e}");
            None
        }
    }
}

const DATABASE_NAME: &str = "accessvote";

#[cfg(test)]
impl Config {
    /// The configuration the test server runs with.
    pub fn example() -> Self {
        crate::test_figment()
            .extract()
            .expect("test figment holds a valid config")
    }
}
