//! In-memory private key SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;
use zeroize::Zeroizing;

use crate::broker::transport::ssh::SshClientHandler;

use super::traits::AuthStrategy;

/// Public key authentication from an OpenSSH/PEM private key held in memory.
///
/// The key text comes from the vault and is never written to disk.
/// Passphrase-protected keys are not supported.
pub struct KeyAuth {
    key_data: Zeroizing<String>,
}

impl KeyAuth {
    pub fn new(key_data: Zeroizing<String>) -> Self {
        Self { key_data }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_pair = keys::decode_secret_key(self.key_data.as_str(), None)
            .map_err(|e| format!("Failed to decode private key: {}", e))?;

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
