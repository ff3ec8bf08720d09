//! Argon2id password hashing, run off the async runtime.

use argon2::{Algorithm, Argon2, Params, Version};
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};

use crate::error::HubError;

/// Hashes and verifies passwords with a fixed set of Argon2id parameters.
///
/// Also holds a throwaway hash so that a login for an unknown username costs
/// the same as one with a wrong password.
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    dummy_hash: String,
}

impl CredentialHasher {
    /// Argon2id with the crate's default (OWASP-recommended) parameters.
    pub fn new() -> Result<Self, HubError> {
        Self::with_params(Params::default())
    }

    /// Cheaper parameters: `m_cost_kib` of memory, `t_cost` passes, one lane.
    pub fn with_cost(m_cost_kib: u32, t_cost: u32) -> Result<Self, HubError> {
        let params = Params::new(m_cost_kib, t_cost, 1, None)
            .map_err(|e| HubError::Internal(format!("invalid argon2 params: {e}")))?;
        Self::with_params(params)
    }

    fn with_params(params: Params) -> Result<Self, HubError> {
        let dummy_hash = hash_with(&params, "beacon-dummy-password")?;
        Ok(Self { params, dummy_hash })
    }

    pub async fn hash(&self, password: &str) -> Result<String, HubError> {
        let params = self.params.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hash_with(&params, &password))
            .await
            .map_err(|e| HubError::Internal(format!("hashing task failed: {e}")))?
    }

    /// Returns `Ok(false)` on mismatch; `Err` only if the stored hash is unreadable.
    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool, HubError> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || verify_with(&password, &hash))
            .await
            .map_err(|e| HubError::Internal(format!("verification task failed: {e}")))?
    }

    /// Burn one verification against the dummy hash. The result is discarded.
    pub async fn verify_dummy(&self, password: &str) {
        let _ = self.verify(password, &self.dummy_hash.clone()).await;
    }
}

fn hash_with(params: &Params, password: &str) -> Result<String, HubError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(?e, "password hashing failed");
            HubError::Internal("failed to process password".to_string())
        })
}

fn verify_with(password: &str, hash: &str) -> Result<bool, HubError> {
    let parsed =
        PasswordHash::new(hash).map_err(|_| HubError::Internal("invalid hash format".into()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(HubError::Internal(format!("password verification failed: {e}"))),
    }
}
