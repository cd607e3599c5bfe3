//! Configuration resolution for the broker.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! Unparseable environment values are ignored in favour of the default.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BROKER_MAX_CONNECTIONS` | 5 | Live handles per pool key |
//! | `BROKER_IDLE_TIMEOUT_SECS` | 300 | Idle time before a free handle is swept |
//! | `BROKER_SWEEP_INTERVAL_SECS` | 60 | Period of the idle sweep |
//! | `BROKER_LOCK_TIMEOUT_MS` | 10000 | Mutex acquisition timeout |
//! | `BROKER_CONNECT_TIMEOUT_SECS` | 30 | Connection establishment timeout |
//! | `BROKER_COMMAND_TIMEOUT_SECS` | 180 | Command/query round-trip timeout |
//! | `BROKER_LIVENESS_TIMEOUT_SECS` | 10 | Profile setup liveness test timeout |
//! | `BROKER_MAX_COMMAND_LENGTH` | 4096 | Command length ceiling in bytes |
//! | `BROKER_MAX_IDENTIFIER_LENGTH` | 63 | SQL identifier length ceiling |
//! | `BROKER_MAX_SECRET_BYTES` | 65536 | Vault plaintext ceiling |
//! | `BROKER_DEFAULT_ROW_LIMIT` | 1000 | Row cap added to uncapped SELECTs |
//! | `BROKER_USAGE_CAPACITY` | 1000 | Usage ring buffer size |
//! | `BROKER_USAGE_RETENTION_SECS` | 3600 | Age after which usage records are swept |
//! | `BROKER_ENCRYPTION_KEY` | unset | Explicit key material |
//! | `BROKER_KEY_FILE` | `.broker/encryption.key` | Persisted key location |
//! | `BROKER_MAX_RETRIES` | 2 | Front-end retry attempts |
//! | `BROKER_RETRY_DELAY_MS` | 500 | Initial front-end retry delay |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;
pub(crate) const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_MAX_COMMAND_LENGTH: usize = 4096;
pub(crate) const DEFAULT_MAX_IDENTIFIER_LENGTH: usize = 63;
pub(crate) const DEFAULT_MAX_SECRET_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_ROW_LIMIT: u64 = 1000;
pub(crate) const DEFAULT_USAGE_CAPACITY: usize = 1000;
pub(crate) const DEFAULT_USAGE_RETENTION_SECS: u64 = 3600;
pub(crate) const DEFAULT_KEY_FILE: &str = ".broker/encryption.key";
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const MAX_CONNECTIONS_ENV_VAR: &str = "BROKER_MAX_CONNECTIONS";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "BROKER_IDLE_TIMEOUT_SECS";
pub(crate) const SWEEP_INTERVAL_ENV_VAR: &str = "BROKER_SWEEP_INTERVAL_SECS";
pub(crate) const LOCK_TIMEOUT_ENV_VAR: &str = "BROKER_LOCK_TIMEOUT_MS";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "BROKER_CONNECT_TIMEOUT_SECS";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "BROKER_COMMAND_TIMEOUT_SECS";
pub(crate) const LIVENESS_TIMEOUT_ENV_VAR: &str = "BROKER_LIVENESS_TIMEOUT_SECS";
pub(crate) const MAX_COMMAND_LENGTH_ENV_VAR: &str = "BROKER_MAX_COMMAND_LENGTH";
pub(crate) const MAX_IDENTIFIER_LENGTH_ENV_VAR: &str = "BROKER_MAX_IDENTIFIER_LENGTH";
pub(crate) const MAX_SECRET_BYTES_ENV_VAR: &str = "BROKER_MAX_SECRET_BYTES";
pub(crate) const DEFAULT_ROW_LIMIT_ENV_VAR: &str = "BROKER_DEFAULT_ROW_LIMIT";
pub(crate) const USAGE_CAPACITY_ENV_VAR: &str = "BROKER_USAGE_CAPACITY";
pub(crate) const USAGE_RETENTION_ENV_VAR: &str = "BROKER_USAGE_RETENTION_SECS";
pub(crate) const ENCRYPTION_KEY_ENV_VAR: &str = "BROKER_ENCRYPTION_KEY";
pub(crate) const KEY_FILE_ENV_VAR: &str = "BROKER_KEY_FILE";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "BROKER_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "BROKER_RETRY_DELAY_MS";

/// Resolve a value with priority: parameter -> env var -> default
pub(crate) fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set and parseable
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve the front-end retry count with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

/// Resolve the front-end initial retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

/// Connection pool limits and timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum live handles per pool key (at least 1)
    pub max_connections: usize,
    /// Free handles idle longer than this are swept
    pub idle_timeout: Duration,
    /// Mutex acquisition timeout for `get_connection` and the sweep
    pub lock_timeout: Duration,
    /// Bound on establishing a new connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Length ceilings enforced by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_command_length: usize,
    pub max_identifier_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            max_identifier_length: DEFAULT_MAX_IDENTIFIER_LENGTH,
        }
    }
}

/// Where the vault gets its key and how large a secret may be.
#[derive(Clone)]
pub struct VaultConfig {
    /// Explicit key material, highest priority
    pub explicit_key: Option<Zeroizing<String>>,
    /// File holding a previously generated key (hex)
    pub key_file: PathBuf,
    /// Plaintext ceiling in bytes
    pub max_secret_bytes: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            explicit_key: None,
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
            max_secret_bytes: DEFAULT_MAX_SECRET_BYTES,
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field(
                "explicit_key",
                &self.explicit_key.as_ref().map(|_| "<redacted>"),
            )
            .field("key_file", &self.key_file)
            .field("max_secret_bytes", &self.max_secret_bytes)
            .finish()
    }
}

/// Complete process-level configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub pool: PoolConfig,
    pub vault: VaultConfig,
    pub limits: ValidationLimits,
    pub sweep_interval: Duration,
    pub command_timeout: Duration,
    pub liveness_timeout: Duration,
    pub default_row_limit: u64,
    pub usage_capacity: usize,
    pub usage_retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            vault: VaultConfig::default(),
            limits: ValidationLimits::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            liveness_timeout: Duration::from_secs(DEFAULT_LIVENESS_TIMEOUT_SECS),
            default_row_limit: DEFAULT_ROW_LIMIT,
            usage_capacity: DEFAULT_USAGE_CAPACITY,
            usage_retention: Duration::from_secs(DEFAULT_USAGE_RETENTION_SECS),
        }
    }
}

impl BrokerConfig {
    /// Build the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let explicit_key = env::var(ENCRYPTION_KEY_ENV_VAR)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(Zeroizing::new);
        let key_file = env::var(KEY_FILE_ENV_VAR)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));

        Self {
            pool: PoolConfig {
                max_connections: resolve(None, MAX_CONNECTIONS_ENV_VAR, DEFAULT_MAX_CONNECTIONS)
                    .max(1),
                idle_timeout: Duration::from_secs(resolve(
                    None,
                    IDLE_TIMEOUT_ENV_VAR,
                    DEFAULT_IDLE_TIMEOUT_SECS,
                )),
                lock_timeout: Duration::from_millis(resolve(
                    None,
                    LOCK_TIMEOUT_ENV_VAR,
                    DEFAULT_LOCK_TIMEOUT_MS,
                )),
                connect_timeout: Duration::from_secs(resolve(
                    None,
                    CONNECT_TIMEOUT_ENV_VAR,
                    DEFAULT_CONNECT_TIMEOUT_SECS,
                )),
            },
            vault: VaultConfig {
                explicit_key,
                key_file,
                max_secret_bytes: resolve(None, MAX_SECRET_BYTES_ENV_VAR, DEFAULT_MAX_SECRET_BYTES),
            },
            limits: ValidationLimits {
                max_command_length: resolve(
                    None,
                    MAX_COMMAND_LENGTH_ENV_VAR,
                    DEFAULT_MAX_COMMAND_LENGTH,
                ),
                max_identifier_length: resolve(
                    None,
                    MAX_IDENTIFIER_LENGTH_ENV_VAR,
                    DEFAULT_MAX_IDENTIFIER_LENGTH,
                ),
            },
            sweep_interval: Duration::from_secs(
                resolve(None, SWEEP_INTERVAL_ENV_VAR, DEFAULT_SWEEP_INTERVAL_SECS).max(1),
            ),
            command_timeout: Duration::from_secs(resolve(
                None,
                COMMAND_TIMEOUT_ENV_VAR,
                DEFAULT_COMMAND_TIMEOUT_SECS,
            )),
            liveness_timeout: Duration::from_secs(resolve(
                None,
                LIVENESS_TIMEOUT_ENV_VAR,
                DEFAULT_LIVENESS_TIMEOUT_SECS,
            )),
            default_row_limit: resolve(None, DEFAULT_ROW_LIMIT_ENV_VAR, DEFAULT_ROW_LIMIT).max(1),
            usage_capacity: resolve(None, USAGE_CAPACITY_ENV_VAR, DEFAULT_USAGE_CAPACITY).max(1),
            usage_retention: Duration::from_secs(resolve(
                None,
                USAGE_RETENTION_ENV_VAR,
                DEFAULT_USAGE_RETENTION_SECS,
            )),
        }
    }
}
