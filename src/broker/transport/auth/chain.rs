//! Authentication chain for trying multiple strategies.

use async_trait::async_trait;
use russh::client;
use tracing::debug;
use zeroize::Zeroizing;

use crate::broker::transport::ssh::SshClientHandler;
use crate::broker::types::{AuthMode, ConnectionTarget};

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// The first successful authentication stops the chain.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Chain for a shell target, driven by its `auth_mode`.
    pub fn for_target(target: &ConnectionTarget) -> Self {
        match target.extra.auth_mode {
            AuthMode::Password => Self::new().with_password(target.secret.clone()),
            AuthMode::PrivateKey => Self::new().with_key(target.secret.clone()),
        }
    }

    pub fn with_password(mut self, password: Zeroizing<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_data: Zeroizing<String>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_data)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication rejected with strategy: {}", strategy.name());
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::{ProfileExtra, ResourceType};

    fn secret(value: &str) -> Zeroizing<String> {
        Zeroizing::new(value.to_string())
    }

    fn shell_target(auth_mode: AuthMode) -> ConnectionTarget {
        ConnectionTarget {
            resource_type: ResourceType::Shell,
            host: "web1".to_string(),
            port: 22,
            username: "ops".to_string(),
            secret: secret("pw"),
            extra: ProfileExtra {
                auth_mode,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_auth_chain_empty() {
        let chain = AuthChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_auth_chain_preserves_order() {
        let chain = AuthChain::new()
            .with_password(secret("a"))
            .with_key(secret("b"))
            .with_password(secret("c"));
        let names: Vec<_> = chain.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["password", "key", "password"]);
    }

    #[test]
    fn test_for_target_follows_auth_mode() {
        let chain = AuthChain::for_target(&shell_target(AuthMode::Password));
        let names: Vec<_> = chain.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["password"]);

        let chain = AuthChain::for_target(&shell_target(AuthMode::PrivateKey));
        let names: Vec<_> = chain.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["key"]);
    }

    #[test]
    fn test_auth_chain_name() {
        assert_eq!(AuthChain::default().name(), "chain");
    }

    #[test]
    fn test_auth_chain_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthChain>();
    }
}
