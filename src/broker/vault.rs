//! Cipher vault for profile secrets.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under one process-wide key and a
//! fresh random 96-bit nonce per call. The key is resolved once, in order:
//! explicit key material, a persisted key file, or a newly generated key that
//! is then written to the key file.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce, aead::Aead};
use once_cell::sync::OnceCell;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use super::config::VaultConfig;
use super::error::{BrokerError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Ciphertext of one secret, as persisted in a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Base64 nonce
    pub iv: String,
    /// Base64 ciphertext with the Poly1305 tag appended
    pub ciphertext: String,
}

/// The 256-bit vault key. Wiped on drop, never printed.
pub struct KeyMaterial(Zeroizing<[u8; KEY_LEN]>);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Interpret operator-supplied key text.
    ///
    /// Exactly 64 hex characters are taken as the raw key; any other
    /// non-empty text is stretched with SHA-256.
    pub fn from_text(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BrokerError::KeyMaterial("key text is empty".to_string()));
        }
        if let Some(key) = decode_hex_key(text) {
            return Ok(key);
        }
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Ok(Self::from_bytes(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&*self.0))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

fn decode_hex_key(text: &str) -> Option<KeyMaterial> {
    if text.len() != KEY_LEN * 2 {
        return None;
    }
    let mut decoded = Zeroizing::new(hex::decode(text).ok()?);
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&decoded);
    decoded.zeroize();
    Some(KeyMaterial::from_bytes(bytes))
}

/// Resolve the vault key: explicit text, then key file, then generate and persist.
pub fn resolve_key(config: &VaultConfig) -> Result<KeyMaterial> {
    if let Some(explicit) = &config.explicit_key {
        debug!("Using explicit vault key");
        return KeyMaterial::from_text(explicit);
    }

    let path = config.key_file.as_path();
    if path.exists() {
        let contents = Zeroizing::new(fs::read_to_string(path)?);
        let key = decode_hex_key(contents.trim()).ok_or_else(|| {
            BrokerError::KeyMaterial(format!(
                "key file {} does not hold 64 hex characters",
                path.display()
            ))
        })?;
        debug!("Loaded vault key from {}", path.display());
        return Ok(key);
    }

    let key = KeyMaterial::generate();
    persist_key(path, &key)?;
    info!("Generated new vault key at {}", path.display());
    Ok(key)
}

fn persist_key(path: &Path, key: &KeyMaterial) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(key.to_hex().as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

static GLOBAL_VAULT: OnceCell<Arc<CipherVault>> = OnceCell::new();

/// Symmetric encryption of profile secrets.
pub struct CipherVault {
    cipher: ChaCha20Poly1305,
    max_secret_bytes: usize,
}

impl CipherVault {
    pub fn new(key: &KeyMaterial, max_secret_bytes: usize) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(&*key.0)
            .map_err(|_| BrokerError::KeyMaterial("key must be 32 bytes".to_string()))?;
        Ok(Self {
            cipher,
            max_secret_bytes,
        })
    }

    /// Process-wide vault, resolving the key on first use.
    ///
    /// Later calls return the same instance and ignore `config`.
    pub fn global(config: &VaultConfig) -> Result<Arc<CipherVault>> {
        GLOBAL_VAULT
            .get_or_try_init(|| {
                let key = resolve_key(config)?;
                CipherVault::new(&key, config.max_secret_bytes).map(Arc::new)
            })
            .cloned()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        if plaintext.len() > self.max_secret_bytes {
            return Err(BrokerError::PayloadTooLarge {
                len: plaintext.len(),
                max: self.max_secret_bytes,
            });
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| BrokerError::KeyMaterial("encryption failed".to_string()))?;

        Ok(EncryptedSecret {
            iv: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<String>> {
        let nonce = BASE64
            .decode(&secret.iv)
            .map_err(|e| BrokerError::Decryption(format!("malformed iv: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(BrokerError::Decryption(format!(
                "iv is {} bytes, expected {}",
                nonce.len(),
                NONCE_LEN
            )));
        }
        let ciphertext = BASE64
            .decode(&secret.ciphertext)
            .map_err(|e| BrokerError::Decryption(format!("malformed ciphertext: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                BrokerError::Decryption("authentication failed (tampered data or wrong key)".into())
            })?;

        match String::from_utf8(plaintext) {
            Ok(text) => Ok(Zeroizing::new(text)),
            Err(err) => {
                let mut bytes = err.into_bytes();
                bytes.zeroize();
                Err(BrokerError::Decryption(
                    "plaintext is not valid UTF-8".to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for CipherVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherVault")
            .field("max_secret_bytes", &self.max_secret_bytes)
            .finish_non_exhaustive()
    }
}
