//! MCP broker tools.
//!
//! This module exposes the [`Broker`] over MCP:
//!
//! - `profile_setup`: Test, encrypt and store a named SQL or shell profile
//! - `profile_list`: List stored profiles (never secrets)
//! - `profile_delete`: Forget a profile
//! - `ssh_execute`: Run a gated shell command through a shell profile
//! - `sql_query`: Run SQL through a SQL profile (read-only queries are row-capped)
//! - `sql_select` / `sql_insert` / `sql_update` / `sql_delete`: Structured table access
//! - `usage_stats`: Windowed operation statistics
//! - `pool_status`: Connection pool occupancy
//!
//! Read-only tools retry retryable failures with exponential backoff and
//! jitter via the `backon` crate. Writes and shell commands are never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use poem_mcpserver::{Tools, tool::StructuredContent};
use serde_json::{Map, Value};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::broker::config::{MAX_RETRY_DELAY, resolve_max_retries, resolve_retry_delay};
use crate::broker::usage::UsageStats;
use crate::broker::validation::is_read_only_query;
use crate::broker::{AuthMode, Broker, BrokerError, ProfileExtra, ProfileInput, ResourceType};

use super::types::{
    PoolStatusResponse, ProfileDeleteResponse, ProfileListResponse, ProfileSetupResponse,
    SqlQueryResponse, SqlWriteResponse, SshExecuteResponse,
};

/// Front-end retry settings for read-only tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
}

impl RetryPolicy {
    /// Resolve from `BROKER_MAX_RETRIES` and `BROKER_RETRY_DELAY_MS`.
    pub fn from_env() -> Self {
        Self {
            max_retries: resolve_max_retries(None),
            min_delay: resolve_retry_delay(None),
        }
    }
}

/// Retry `call` while it fails with a retryable [`BrokerError`].
pub(crate) async fn retry_read<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    call: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(policy.min_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(policy.max_retries as usize)
        .with_jitter();

    call.retry(backoff)
        .when(BrokerError::is_retryable)
        .notify(|err, dur| {
            warn!("{} failed: {}. Retrying in {:?}", operation, err, dur);
        })
        .await
}

/// Tool error string: `"{kind}: {message}"`.
fn tool_error(err: BrokerError) -> String {
    format!("{}: {}", err.kind(), err)
}

fn parse_resource_type(value: &str) -> Result<ResourceType, String> {
    value
        .parse()
        .map_err(|e| tool_error(BrokerError::InvalidInput(e)))
}

fn parse_auth_mode(value: Option<&str>) -> Result<AuthMode, String> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("password") => Ok(AuthMode::Password),
        Some("private_key") | Some("key") => Ok(AuthMode::PrivateKey),
        Some(other) => Err(tool_error(BrokerError::InvalidInput(format!(
            "unknown auth_mode '{}', expected 'password' or 'private_key'",
            other
        )))),
    }
}

/// MCP tool surface over a shared [`Broker`].
pub struct McpBrokerCommands {
    broker: Arc<Broker>,
    retry: RetryPolicy,
}

impl McpBrokerCommands {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self::with_retry(broker, RetryPolicy::from_env())
    }

    pub fn with_retry(broker: Arc<Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }
}

#[Tools]
impl McpBrokerCommands {
    /// Create or replace a named connection profile.
    ///
    /// The connection is tested first (connect, trivial no-op, disconnect);
    /// nothing is stored if the test fails. The secret is encrypted at rest and
    /// never returned. Use the profile name with `ssh_execute` or the `sql_*` tools.
    #[allow(clippy::too_many_arguments)]
    async fn profile_setup(
        &self,
        /// Profile name: 1-64 characters of letters, digits, '_', '.' or '-'
        name: String,
        /// Resource type: "sql" (PostgreSQL) or "shell" (SSH, alias "ssh")
        resource_type: String,
        /// Hostname or IP address
        host: String,
        /// Port (default: 5432 for sql, 22 for shell)
        port: Option<u16>,
        /// Username for authentication
        username: String,
        /// Password, or the private key text when auth_mode is "private_key"
        secret: String,
        /// Database name (sql profiles)
        database: Option<String>,
        /// Require TLS for the database connection (sql profiles, default: false)
        tls: Option<bool>,
        /// How the secret authenticates a shell profile: "password" (default) or "private_key"
        auth_mode: Option<String>,
    ) -> Result<StructuredContent<ProfileSetupResponse>, String> {
        let resource_type = parse_resource_type(&resource_type)?;
        let input = ProfileInput {
            resource_type,
            host,
            port,
            username,
            secret: Zeroizing::new(secret),
            extra: ProfileExtra {
                database,
                tls: tls.unwrap_or(false),
                auth_mode: parse_auth_mode(auth_mode.as_deref())?,
            },
        };

        info!("Setting up {} profile '{}'", resource_type, name);
        let profile = self
            .broker
            .setup_profile(&name, input)
            .await
            .map_err(tool_error)?;

        Ok(StructuredContent(ProfileSetupResponse {
            message: format!(
                "Profile '{}' verified and stored for {}@{}:{}",
                profile.name, profile.username, profile.host, profile.port
            ),
            profile,
        }))
    }

    /// List stored profiles, optionally filtered by resource type. Secrets are never included.
    async fn profile_list(
        &self,
        /// Filter: "sql" or "shell" (default: all)
        resource_type: Option<String>,
    ) -> Result<StructuredContent<ProfileListResponse>, String> {
        let filter = resource_type
            .as_deref()
            .map(parse_resource_type)
            .transpose()?;
        let profiles = self.broker.list_profiles(filter);
        Ok(StructuredContent(ProfileListResponse {
            count: profiles.len(),
            profiles,
        }))
    }

    /// Delete a stored profile.
    ///
    /// Pooled connections are shared by every profile with the same resource
    /// type, host, port, user and database, so they stay open for those
    /// profiles and close only once idle past BROKER_IDLE_TIMEOUT_SECS.
    async fn profile_delete(
        &self,
        /// Profile name
        name: String,
    ) -> Result<StructuredContent<ProfileDeleteResponse>, String> {
        let profile = self
            .broker
            .delete_profile(&name)
            .await
            .map_err(tool_error)?;
        Ok(StructuredContent(ProfileDeleteResponse {
            message: format!("Profile '{}' deleted", profile.name),
            profile,
        }))
    }

    /// Execute a shell command on the host behind a shell profile.
    ///
    /// Destructive commands (disk wiping, formatting, shutdown, credential file
    /// access, mass kill, fork bombs...) are rejected before reaching the host.
    /// The command runs with the profile user's permissions and is bounded by
    /// BROKER_COMMAND_TIMEOUT_SECS; a timed-out session is discarded.
    async fn ssh_execute(
        &self,
        /// Shell profile name
        profile: String,
        /// Command to run
        command: String,
    ) -> Result<StructuredContent<SshExecuteResponse>, String> {
        let output = self
            .broker
            .execute_command(&profile, &command)
            .await
            .map_err(tool_error)?;
        Ok(StructuredContent(SshExecuteResponse::new(profile, output)))
    }

    /// Run SQL through a SQL profile.
    ///
    /// Read-only queries (SELECT/WITH) without a LIMIT get one appended and
    /// return rows as JSON objects; they are retried on transient failures.
    /// Other statements return the affected row count and are not retried.
    async fn sql_query(
        &self,
        /// SQL profile name
        profile: String,
        /// SQL statement, parameters as $1, $2, ...
        sql: String,
        /// Positional parameter values
        params: Option<Vec<Value>>,
        /// Row cap for read-only queries (default: BROKER_DEFAULT_ROW_LIMIT)
        limit: Option<u64>,
    ) -> Result<StructuredContent<SqlQueryResponse>, String> {
        let params = params.unwrap_or_default();
        let result = if is_read_only_query(&sql) {
            retry_read(self.retry, "sql_query", || {
                self.broker.run_query(&profile, &sql, params.clone(), limit)
            })
            .await
        } else {
            self.broker.run_query(&profile, &sql, params, limit).await
        };
        let outcome = result.map_err(tool_error)?;
        Ok(StructuredContent(SqlQueryResponse::new(profile, outcome)))
    }

    /// Select rows from a table. Identifiers are validated and quoted; values bind as parameters.
    #[allow(clippy::too_many_arguments)]
    async fn sql_select(
        &self,
        /// SQL profile name
        profile: String,
        /// Table name
        table: String,
        /// Columns to return (default: all)
        columns: Option<Vec<String>>,
        /// Optional WHERE clause without the keyword, parameters as $1, $2, ...
        where_clause: Option<String>,
        /// Values for the WHERE clause parameters
        params: Option<Vec<Value>>,
        /// Row cap (default: BROKER_DEFAULT_ROW_LIMIT)
        limit: Option<u64>,
    ) -> Result<StructuredContent<SqlQueryResponse>, String> {
        let columns = columns.unwrap_or_default();
        let params = params.unwrap_or_default();
        let outcome = retry_read(self.retry, "sql_select", || {
            self.broker.select_rows(
                &profile,
                &table,
                &columns,
                where_clause.as_deref(),
                params.clone(),
                limit,
            )
        })
        .await
        .map_err(tool_error)?;
        Ok(StructuredContent(SqlQueryResponse::new(profile, outcome)))
    }

    /// Insert one row. Keys of `values` are column names.
    async fn sql_insert(
        &self,
        /// SQL profile name
        profile: String,
        /// Table name
        table: String,
        /// Column values, e.g. {"email": "a@example.com", "active": true}
        values: Map<String, Value>,
    ) -> Result<StructuredContent<SqlWriteResponse>, String> {
        let rows_affected = self
            .broker
            .insert_row(&profile, &table, &values)
            .await
            .map_err(tool_error)?;
        Ok(StructuredContent(SqlWriteResponse {
            profile,
            table,
            rows_affected,
        }))
    }

    /// Update rows. A non-empty WHERE clause is mandatory.
    async fn sql_update(
        &self,
        /// SQL profile name
        profile: String,
        /// Table name
        table: String,
        /// New column values
        values: Map<String, Value>,
        /// WHERE clause without the keyword, parameters numbered from $1
        where_clause: String,
        /// Values for the WHERE clause parameters
        params: Option<Vec<Value>>,
    ) -> Result<StructuredContent<SqlWriteResponse>, String> {
        let rows_affected = self
            .broker
            .update_rows(
                &profile,
                &table,
                &values,
                &where_clause,
                params.unwrap_or_default(),
            )
            .await
            .map_err(tool_error)?;
        Ok(StructuredContent(SqlWriteResponse {
            profile,
            table,
            rows_affected,
        }))
    }

    /// Delete rows. A non-empty WHERE clause is mandatory.
    async fn sql_delete(
        &self,
        /// SQL profile name
        profile: String,
        /// Table name
        table: String,
        /// WHERE clause without the keyword, parameters as $1, $2, ...
        where_clause: String,
        /// Values for the WHERE clause parameters
        params: Option<Vec<Value>>,
    ) -> Result<StructuredContent<SqlWriteResponse>, String> {
        let rows_affected = self
            .broker
            .delete_rows(&profile, &table, &where_clause, params.unwrap_or_default())
            .await
            .map_err(tool_error)?;
        Ok(StructuredContent(SqlWriteResponse {
            profile,
            table,
            rows_affected,
        }))
    }

    /// Operation counts (total, successful, failed, per type) over a time window.
    async fn usage_stats(
        &self,
        /// Window in seconds (default: BROKER_USAGE_RETENTION_SECS)
        window_secs: Option<u64>,
    ) -> StructuredContent<UsageStats> {
        StructuredContent(
            self.broker
                .usage_stats(window_secs.map(Duration::from_secs)),
        )
    }

    /// Live connections per pool key (resource type, user, host, port, database).
    async fn pool_status(&self) -> StructuredContent<PoolStatusResponse> {
        StructuredContent(PoolStatusResponse::new(self.broker.pool_stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::PoolKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay: Duration::from_millis(10),
        }
    }

    fn exhausted() -> BrokerError {
        BrokerError::PoolExhausted {
            key: PoolKey {
                resource_type: ResourceType::Sql,
                host: "db1".to_string(),
                port: 5432,
                username: "app".to_string(),
                database: None,
            },
            max: 1,
        }
    }

    mod retry {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_retryable_errors_are_retried() {
            let calls = AtomicUsize::new(0);
            let calls_ref = &calls;
            let result = retry_read(policy(3), "test", || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(exhausted())
                } else {
                    Ok("rows")
                }
            })
            .await;

            assert_eq!(result.unwrap(), "rows");
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn test_validation_errors_are_not_retried() {
            let calls = AtomicUsize::new(0);
            let calls_ref = &calls;
            let result: Result<(), _> = retry_read(policy(3), "test", || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::EmptyCommand)
            })
            .await;

            assert!(matches!(result, Err(BrokerError::EmptyCommand)));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_gives_up_after_max_retries() {
            let calls = AtomicUsize::new(0);
            let calls_ref = &calls;
            let result: Result<(), _> = retry_read(policy(2), "test", || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::LockTimeout(Duration::from_secs(1)))
            })
            .await;

            assert!(matches!(result, Err(BrokerError::LockTimeout(_))));
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_resource_type() {
            assert_eq!(parse_resource_type("ssh"), Ok(ResourceType::Shell));
            let err = parse_resource_type("ftp").unwrap_err();
            assert!(err.starts_with("validation_error: "));
        }

        #[test]
        fn test_auth_mode() {
            assert_eq!(parse_auth_mode(None), Ok(AuthMode::Password));
            assert_eq!(parse_auth_mode(Some("Private_Key")), Ok(AuthMode::PrivateKey));
            assert_eq!(parse_auth_mode(Some("key")), Ok(AuthMode::PrivateKey));
            assert!(parse_auth_mode(Some("agent")).is_err());
        }

        #[test]
        fn test_tool_error_carries_kind() {
            assert_eq!(
                tool_error(BrokerError::MissingWhereClause("DELETE")),
                "validation_error: a non-empty WHERE clause is required for DELETE"
            );
            assert!(tool_error(exhausted()).starts_with("pool_exhausted: "));
        }
    }
}
