//! Data model shared by the broker components.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::vault::EncryptedSecret;

/// Kind of remote resource a profile points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// PostgreSQL-compatible database
    Sql,
    /// Shell host reachable over SSH
    #[serde(alias = "ssh")]
    Shell,
}

impl ResourceType {
    /// Port used when a profile does not specify one.
    pub fn default_port(self) -> u16 {
        match self {
            ResourceType::Sql => 5432,
            ResourceType::Shell => 22,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Sql => write!(f, "sql"),
            ResourceType::Shell => write!(f, "shell"),
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "postgres" | "postgresql" => Ok(ResourceType::Sql),
            "shell" | "ssh" => Ok(ResourceType::Shell),
            other => Err(format!(
                "unknown resource type '{}', expected 'sql' or 'shell'",
                other
            )),
        }
    }
}

/// How the stored secret of a shell profile is used to authenticate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Secret is a password
    #[default]
    Password,
    /// Secret is an OpenSSH/PEM private key
    PrivateKey,
}

/// Resource-specific connection settings that are not secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProfileExtra {
    /// Database name (sql profiles)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Require TLS for the database connection (sql profiles)
    #[serde(default)]
    pub tls: bool,
    /// How the secret authenticates (shell profiles)
    #[serde(default)]
    pub auth_mode: AuthMode,
}

/// Identity of one logical pool and one mutex.
///
/// Structured rather than a concatenated string so a username containing a
/// separator can never collide with a different host/port split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct PoolKey {
    pub resource_type: ResourceType,
    pub host: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}@{}:{}",
            self.resource_type, self.username, self.host, self.port
        )?;
        if let Some(database) = &self.database {
            write!(f, "/{}", database)?;
        }
        Ok(())
    }
}

/// A stored profile. The secret is only ever held encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub resource_type: ResourceType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: EncryptedSecret,
    #[serde(default)]
    pub extra: ProfileExtra,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ConnectionProfile {
    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            resource_type: self.resource_type,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            database: self.extra.database.clone(),
            created_at: self.created_at.to_rfc3339(),
            last_used_at: self.last_used_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Secret-free view of a profile for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProfileSummary {
    pub name: String,
    pub resource_type: ResourceType,
    pub host: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

/// Caller-supplied data for creating or replacing a profile.
#[derive(Clone)]
pub struct ProfileInput {
    pub resource_type: ResourceType,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub secret: Zeroizing<String>,
    pub extra: ProfileExtra,
}

impl ProfileInput {
    /// Decrypted connection view of this input, used by the liveness test.
    pub fn to_target(&self) -> ConnectionTarget {
        ConnectionTarget {
            resource_type: self.resource_type,
            host: self.host.trim().to_string(),
            port: self.port.unwrap_or_else(|| self.resource_type.default_port()),
            username: self.username.trim().to_string(),
            secret: self.secret.clone(),
            extra: self.extra.clone(),
        }
    }
}

impl fmt::Debug for ProfileInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileInput")
            .field("resource_type", &self.resource_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("extra", &self.extra)
            .finish()
    }
}

/// Everything a transport needs to open a connection, secret included.
///
/// Lives only in memory; the secret is wiped on drop and redacted from `Debug`.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub resource_type: ResourceType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: Zeroizing<String>,
    pub extra: ProfileExtra,
}

impl ConnectionTarget {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            resource_type: self.resource_type,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            database: match self.resource_type {
                ResourceType::Sql => self.extra.database.clone(),
                ResourceType::Shell => None,
            },
        }
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("resource_type", &self.resource_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("extra", &self.extra)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(resource_type: ResourceType, username: &str, host: &str) -> ConnectionTarget {
        ConnectionTarget {
            resource_type,
            host: host.to_string(),
            port: resource_type.default_port(),
            username: username.to_string(),
            secret: Zeroizing::new("hunter2".to_string()),
            extra: ProfileExtra {
                database: Some("app".to_string()),
                ..Default::default()
            },
        }
    }

    mod resource_type {
        use super::*;

        #[test]
        fn test_parse_aliases() {
            assert_eq!("ssh".parse::<ResourceType>(), Ok(ResourceType::Shell));
            assert_eq!("Shell".parse::<ResourceType>(), Ok(ResourceType::Shell));
            assert_eq!("postgres".parse::<ResourceType>(), Ok(ResourceType::Sql));
            assert!("ftp".parse::<ResourceType>().is_err());
        }

        #[test]
        fn test_serde_accepts_ssh_alias() {
            let parsed: ResourceType = serde_json::from_str("\"ssh\"").unwrap();
            assert_eq!(parsed, ResourceType::Shell);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"shell\"");
        }

        #[test]
        fn test_default_ports() {
            assert_eq!(ResourceType::Shell.default_port(), 22);
            assert_eq!(ResourceType::Sql.default_port(), 5432);
        }
    }

    mod pool_key {
        use super::*;

        #[test]
        fn test_derivation_is_deterministic() {
            let a = target(ResourceType::Sql, "app", "db1").pool_key();
            let b = target(ResourceType::Sql, "app", "db1").pool_key();
            assert_eq!(a, b);
        }

        #[test]
        fn test_shell_keys_ignore_database() {
            let key = target(ResourceType::Shell, "ops", "web1").pool_key();
            assert_eq!(key.database, None);
        }

        #[test]
        fn test_separator_in_username_does_not_collide() {
            let a = target(ResourceType::Shell, "a:b", "c").pool_key();
            let b = target(ResourceType::Shell, "a", "b:c").pool_key();
            assert_ne!(a, b);
        }

        #[test]
        fn test_display() {
            let key = target(ResourceType::Sql, "app", "db1").pool_key();
            assert_eq!(key.to_string(), "sql://app@db1:5432/app");
        }
    }

    mod redaction {
        use super::*;

        #[test]
        fn test_target_debug_hides_secret() {
            let rendered = format!("{:?}", target(ResourceType::Shell, "ops", "web1"));
            assert!(!rendered.contains("hunter2"));
            assert!(rendered.contains("<redacted>"));
        }

        #[test]
        fn test_input_debug_hides_secret() {
            let input = ProfileInput {
                resource_type: ResourceType::Shell,
                host: "web1".into(),
                port: None,
                username: "ops".into(),
                secret: Zeroizing::new("hunter2".into()),
                extra: ProfileExtra::default(),
            };
            assert!(!format!("{:?}", input).contains("hunter2"));
        }

        #[test]
        fn test_input_to_target_applies_default_port() {
            let input = ProfileInput {
                resource_type: ResourceType::Shell,
                host: " web1 ".into(),
                port: None,
                username: "ops".into(),
                secret: Zeroizing::new("pw".into()),
                extra: ProfileExtra::default(),
            };
            let target = input.to_target();
            assert_eq!(target.port, 22);
            assert_eq!(target.host, "web1");
        }
    }
}
