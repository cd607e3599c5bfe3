//! Profile store: validated, liveness-tested, encrypted connection profiles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::error::{BrokerError, Result};
use super::mutex::MutexManager;
use super::storage::ProfileStorage;
use super::types::{ConnectionProfile, ConnectionTarget, ProfileInput, ProfileSummary, ResourceType};
use super::validation::{ensure_host, ensure_profile_name, ensure_username};
use super::vault::CipherVault;

/// Opens a connection to a target, runs a trivial no-op and closes it.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, target: &ConnectionTarget) -> Result<()>;
}

pub struct ProfileStore {
    vault: Arc<CipherVault>,
    storage: Arc<dyn ProfileStorage>,
    probe: Arc<dyn LivenessProbe>,
    locks: MutexManager<String>,
    liveness_timeout: Duration,
    lock_timeout: Duration,
}

fn write_lock_key(name: &str) -> String {
    format!("profile:{}", name)
}

impl ProfileStore {
    pub fn new(
        vault: Arc<CipherVault>,
        storage: Arc<dyn ProfileStorage>,
        probe: Arc<dyn LivenessProbe>,
        liveness_timeout: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            vault,
            storage,
            probe,
            locks: MutexManager::new(),
            liveness_timeout,
            lock_timeout,
        }
    }

    /// Create or replace profile `name`.
    ///
    /// The store is only written after the liveness probe succeeds. A replaced
    /// profile keeps its `created_at`.
    pub async fn set_profile(&self, name: &str, input: ProfileInput) -> Result<ConnectionProfile> {
        let name = ensure_profile_name(name)?;
        let mut target = input.to_target();
        target.host = ensure_host(&target.host)?.to_string();
        target.username = ensure_username(&target.username)?.to_string();
        if target.port == 0 {
            return Err(BrokerError::InvalidInput("port must be 1-65535".to_string()));
        }
        target.extra.database = target
            .extra
            .database
            .take()
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty());

        let _guard = self
            .locks
            .acquire(&write_lock_key(name), self.lock_timeout)
            .await?;

        match tokio::time::timeout(self.liveness_timeout, self.probe.probe(&target)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Liveness test for profile '{}' failed: {}", name, e);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Liveness test for profile '{}' timed out after {:?}",
                    name, self.liveness_timeout
                );
                return Err(BrokerError::Connection(format!(
                    "liveness test for {} timed out after {:?}",
                    target.pool_key(),
                    self.liveness_timeout
                )));
            }
        }

        let secret = self.vault.encrypt(&target.secret)?;
        let created_at = self
            .storage
            .get(name)
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);

        let profile = ConnectionProfile {
            name: name.to_string(),
            resource_type: target.resource_type,
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            secret,
            extra: target.extra.clone(),
            created_at,
            last_used_at: None,
        };
        let replaced = self.storage.insert(profile.clone()).is_some();
        info!(
            "{} {} profile '{}' for {}",
            if replaced { "Updated" } else { "Stored" },
            profile.resource_type,
            name,
            target.pool_key()
        );
        Ok(profile)
    }

    /// Look up a profile of the expected type and decrypt its secret.
    pub fn get_profile(
        &self,
        name: &str,
        resource_type: ResourceType,
    ) -> Result<(ConnectionProfile, ConnectionTarget)> {
        let profile = self
            .storage
            .get(name)
            .ok_or_else(|| BrokerError::ProfileNotFound(name.to_string()))?;
        if profile.resource_type != resource_type {
            return Err(BrokerError::ProfileTypeMismatch {
                name: name.to_string(),
                expected: resource_type,
                actual: profile.resource_type,
            });
        }
        let secret = self.vault.decrypt(&profile.secret)?;
        let target = ConnectionTarget {
            resource_type: profile.resource_type,
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            secret,
            extra: profile.extra.clone(),
        };
        Ok((profile, target))
    }

    pub fn list_profiles(&self, resource_type: Option<ResourceType>) -> Vec<ProfileSummary> {
        self.storage
            .list(resource_type)
            .iter()
            .map(ConnectionProfile::summary)
            .collect()
    }

    pub async fn delete_profile(&self, name: &str) -> Result<ProfileSummary> {
        let name = ensure_profile_name(name)?;
        let _guard = self
            .locks
            .acquire(&write_lock_key(name), self.lock_timeout)
            .await?;
        let removed = self
            .storage
            .remove(name)
            .ok_or_else(|| BrokerError::ProfileNotFound(name.to_string()))?;
        info!("Deleted {} profile '{}'", removed.resource_type, name);
        Ok(removed.summary())
    }

    /// Stamp `last_used_at` after a successful operation.
    pub fn touch(&self, name: &str) -> bool {
        self.storage.touch(name, Utc::now())
    }
}
