pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod store;

use std::sync::Arc;

use beacon_common::SnowflakeGenerator;

use auth::password::CredentialHasher;
use auth::tokens::JwtTokenService;
use config::Config;
use error::HubError;
use gateway::{Hub, HubSettings};
use store::memory::{MemoryCredentialStore, MemoryMessageLog};
use store::postgres::{PgCredentialStore, PgMessageLog};
use store::{CredentialPolicy, CredentialStore, MessageLog};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
}

impl AppState {
    /// Wire the hub to PostgreSQL when `DATABASE_URL` is set, otherwise to
    /// in-memory collaborators.
    pub fn from_config(config: Config) -> Result<Self, HubError> {
        let hasher = CredentialHasher::new()?;
        let policy = CredentialPolicy::from(&config);

        let (credentials, messages): (Arc<dyn CredentialStore>, Arc<dyn MessageLog>) =
            match &config.database_url {
                Some(url) => {
                    let db = db::pool::connect(url)?;
                    let ids = Arc::new(SnowflakeGenerator::new(0));
                    (
                        Arc::new(PgCredentialStore::new(db.clone(), hasher, policy)),
                        Arc::new(PgMessageLog::new(db, ids)),
                    )
                }
                None => {
                    tracing::warn!("DATABASE_URL not set; users and messages are kept in memory");
                    (
                        Arc::new(MemoryCredentialStore::new(hasher, policy)),
                        Arc::new(MemoryMessageLog::new()),
                    )
                }
            };

        Ok(Self::with_collaborators(config, credentials, messages))
    }

    /// Build state around caller-supplied stores. Tokens are always JWTs
    /// signed with the configured secret.
    pub fn with_collaborators(
        config: Config,
        credentials: Arc<dyn CredentialStore>,
        messages: Arc<dyn MessageLog>,
    ) -> Self {
        let tokens = Arc::new(JwtTokenService::new(
            &config.token_secret,
            config.token_ttl_secs,
        ));
        let hub = Hub::new(credentials, tokens, messages, HubSettings::from(&config));
        Self {
            config: Arc::new(config),
            hub: Arc::new(hub),
        }
    }
}
