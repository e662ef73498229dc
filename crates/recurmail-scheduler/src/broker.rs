//! Credential Broker: hands out a currently valid credential for a user,
//! refreshing and persisting it when the stored one has expired.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use recurmail_core::{
    provider::IdentityProvider,
    types::{Credential, User},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    store::JobStore,
};

pub struct CredentialBroker {
    store: Arc<dyn JobStore>,
    identity: Arc<dyn IdentityProvider>,
    /// Credentials expiring within this window are treated as expired.
    skew: Duration,
    /// Serialises refreshes so parallel dispatches for one user refresh once.
    refresh_gate: Mutex<()>,
}

impl CredentialBroker {
    pub fn new(store: Arc<dyn JobStore>, identity: Arc<dyn IdentityProvider>, skew: Duration) -> Self {
        Self {
            store,
            identity,
            skew,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    /// Return `user`'s credential if still valid, otherwise refresh it.
    ///
    /// Fails with [`SchedulerError::CredentialExpired`] when there is no
    /// refresh token or the provider rejects it; nothing is persisted then.
    pub async fn get_valid_credential(&self, user: &User) -> Result<Credential> {
        self.get_valid_credential_at(user, Utc::now()).await
    }

    pub async fn get_valid_credential_at(&self, user: &User, now: DateTime<Utc>) -> Result<Credential> {
        // Fast path — no lock
        if !user.credential.is_expired(now, self.skew) {
            return Ok(user.credential.clone());
        }

        // Slow path — one refresh at a time
        let _gate = self.refresh_gate.lock().await;

        // Another dispatch may have refreshed this user while we waited.
        let current = match self.store.get_user(&user.id).await {
            Ok(Some(stored)) => stored.credential,
            Ok(None) => {
                return Err(SchedulerError::UserNotFound {
                    id: user.id.to_string(),
                })
            }
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "could not re-read credential; using caller's copy");
                user.credential.clone()
            }
        };
        if !current.is_expired(now, self.skew) {
            debug!(user_id = %user.id, "credential already refreshed by a concurrent dispatch");
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(SchedulerError::CredentialExpired(
                "access token expired and no refresh token is stored".to_string(),
            ));
        };

        info!(user_id = %user.id, provider = self.identity.name(), "refreshing access token");
        let mut fresh = self
            .identity
            .refresh_credential(&refresh_token)
            .await
            .map_err(|e| SchedulerError::CredentialExpired(e.to_string()))?;
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }

        match self.store.save_credential(&user.id, &fresh).await {
            Ok(true) => debug!(user_id = %user.id, expires_at = %fresh.expires_at, "refreshed credential saved"),
            Ok(false) => warn!(user_id = %user.id, "user vanished before refreshed credential could be saved"),
            Err(e) => warn!(user_id = %user.id, error = %e, "failed to save refreshed credential"),
        }

        Ok(fresh)
    }
}
