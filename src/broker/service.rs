//! Broker facade: the single entry point dispatchers call.
//!
//! Every operation follows the same path: validate the payload, resolve and
//! decrypt the profile, check out a pooled connection, run the sanitized
//! command under the command timeout, release the connection and record the
//! outcome in the usage tracker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BrokerConfig;
use super::error::{BrokerError, Result};
use super::pool::{ConnectionPool, Connector, PoolStats, PooledHandle};
use super::profile::{LivenessProbe, ProfileStore};
use super::storage::{DashMapProfileStorage, ProfileStorage};
use super::transport::sql::{build_delete, build_insert, build_select, build_update};
use super::transport::{
    CommandOutput, QueryOutcome, ShellTransport, SqlConnector, SqlRequest, SqlTransport,
    SshConnector, TransportProbe,
};
use super::types::{ProfileInput, ProfileSummary, ResourceType};
use super::usage::{UsageStats, UsageTracker};
use super::validation::Validator;
use super::vault::CipherVault;

/// Runs `fut` under `timeout`, mapping expiry to `CommandTimeout`.
async fn bounded<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::CommandTimeout(timeout)),
    }
}

/// Errors after which a checked-out connection must not be reused.
fn poisons_connection(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::CommandTimeout(_) | BrokerError::Connection(_)
    )
}

fn affected_rows(outcome: QueryOutcome) -> u64 {
    match outcome {
        QueryOutcome::Affected { rows_affected } => rows_affected,
        QueryOutcome::Rows { row_count, .. } => row_count,
    }
}

pub struct Broker<S = SshConnector, Q = SqlConnector>
where
    S: ShellTransport,
    Q: SqlTransport,
{
    config: BrokerConfig,
    validator: Validator,
    profiles: ProfileStore,
    shell_pool: ConnectionPool<S>,
    sql_pool: ConnectionPool<Q>,
    usage: Arc<UsageTracker>,
}

impl Broker {
    /// Broker over russh and sqlx with the process-wide vault and in-memory
    /// profile storage.
    pub fn from_config(config: BrokerConfig) -> Result<Self> {
        let vault = CipherVault::global(&config.vault)?;
        let ssh = SshConnector::new();
        let sql = SqlConnector::new();
        let probe = Arc::new(TransportProbe::new(ssh.clone(), sql.clone()));
        Ok(Self::new(
            config,
            vault,
            Arc::new(DashMapProfileStorage::new()),
            probe,
            ssh,
            sql,
        ))
    }
}

impl<S, Q> Broker<S, Q>
where
    S: ShellTransport,
    Q: SqlTransport,
{
    pub fn new(
        config: BrokerConfig,
        vault: Arc<CipherVault>,
        storage: Arc<dyn ProfileStorage>,
        probe: Arc<dyn LivenessProbe>,
        shell: S,
        sql: Q,
    ) -> Self {
        let profiles = ProfileStore::new(
            vault,
            storage,
            probe,
            config.liveness_timeout,
            config.pool.lock_timeout,
        );
        Self {
            validator: Validator::new(config.limits),
            profiles,
            shell_pool: ConnectionPool::new(shell, config.pool.clone()),
            sql_pool: ConnectionPool::new(sql, config.pool.clone()),
            usage: Arc::new(UsageTracker::new(config.usage_capacity)),
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn finish<T>(&self, profile: &str, operation: &str, result: &Result<T>) {
        self.usage.record(operation, result.is_ok());
        match result {
            Ok(_) => {
                self.profiles.touch(profile);
            }
            Err(e) => debug!("{} on profile '{}' failed: {}", operation, profile, e),
        }
    }

    // Profiles

    /// Test, encrypt and store a profile.
    pub async fn setup_profile(&self, name: &str, input: ProfileInput) -> Result<ProfileSummary> {
        let result = self
            .profiles
            .set_profile(name, input)
            .await
            .map(|profile| profile.summary());
        self.usage.record("profile_setup", result.is_ok());
        result
    }

    /// Secret-free view of one profile, checking its type.
    pub fn get_profile(&self, name: &str, resource_type: ResourceType) -> Result<ProfileSummary> {
        let (profile, _) = self.profiles.get_profile(name, resource_type)?;
        Ok(profile.summary())
    }

    pub fn list_profiles(&self, resource_type: Option<ResourceType>) -> Vec<ProfileSummary> {
        self.profiles.list_profiles(resource_type)
    }

    pub async fn delete_profile(&self, name: &str) -> Result<ProfileSummary> {
        self.profiles.delete_profile(name).await
    }

    // Shell

    /// Run a shell command on the host behind a shell profile.
    pub async fn execute_command(&self, profile: &str, command: &str) -> Result<CommandOutput> {
        let result = self.execute_command_inner(profile, command).await;
        self.finish(profile, "ssh_execute", &result);
        result
    }

    async fn execute_command_inner(&self, profile: &str, command: &str) -> Result<CommandOutput> {
        let command = self.validator.ensure_command(command)?;
        let (_, target) = self.profiles.get_profile(profile, ResourceType::Shell)?;

        let mut handle = self.shell_pool.get_connection(&target).await?;
        let timeout = self.config.command_timeout;
        let result = match handle.connection() {
            Some(conn) => bounded(timeout, self.shell_pool.connector().exec(conn, &command)).await,
            None => Err(BrokerError::Connection("pooled handle has no connection".to_string())),
        };
        self.settle(&self.shell_pool, handle, &result).await;
        result
    }

    /// Release `handle`, discarding it when `result` shows the connection broke.
    async fn settle<C: Connector, T>(
        &self,
        pool: &ConnectionPool<C>,
        mut handle: PooledHandle<C>,
        result: &Result<T>,
    ) {
        if let Err(e) = result
            && poisons_connection(e)
        {
            warn!("Discarding connection {} for {}: {}", handle.id(), handle.key(), e);
            handle.invalidate();
        }
        pool.release_connection(handle).await;
    }

    // SQL

    async fn run_sql(&self, profile: &str, request: SqlRequest) -> Result<QueryOutcome> {
        let (_, target) = self.profiles.get_profile(profile, ResourceType::Sql)?;

        let mut handle = self.sql_pool.get_connection(&target).await?;
        let timeout = self.config.command_timeout;
        let result = match handle.connection() {
            Some(conn) => bounded(timeout, self.sql_pool.connector().run(conn, request)).await,
            None => Err(BrokerError::Connection("pooled handle has no connection".to_string())),
        };
        self.settle(&self.sql_pool, handle, &result).await;
        result
    }

    fn row_limit(&self, limit: Option<u64>) -> u64 {
        limit.unwrap_or(self.config.default_row_limit).max(1)
    }

    /// Run caller SQL. Uncapped read-only queries get a row limit.
    pub async fn run_query(
        &self,
        profile: &str,
        sql: &str,
        params: Vec<Value>,
        limit: Option<u64>,
    ) -> Result<QueryOutcome> {
        let result = async {
            let sql = self.validator.ensure_statement(sql)?;
            let request = SqlRequest::Raw {
                sql,
                params,
                limit: self.row_limit(limit),
            };
            self.run_sql(profile, request).await
        }
        .await;
        self.finish(profile, "sql_query", &result);
        result
    }

    pub async fn select_rows(
        &self,
        profile: &str,
        table: &str,
        columns: &[String],
        where_clause: Option<&str>,
        params: Vec<Value>,
        limit: Option<u64>,
    ) -> Result<QueryOutcome> {
        let result = async {
            let statement = build_select(
                &self.validator,
                table,
                columns,
                where_clause,
                params,
                self.row_limit(limit),
            )?;
            self.run_sql(profile, SqlRequest::Fetch(statement)).await
        }
        .await;
        self.finish(profile, "sql_select", &result);
        result
    }

    pub async fn insert_row(&self, profile: &str, table: &str, values: &Map<String, Value>) -> Result<u64> {
        let result = async {
            let statement = build_insert(&self.validator, table, values)?;
            self.run_sql(profile, SqlRequest::Execute(statement))
                .await
                .map(affected_rows)
        }
        .await;
        self.finish(profile, "sql_insert", &result);
        result
    }

    /// UPDATE with a mandatory WHERE clause. `$n` placeholders in the clause
    /// refer to `params`.
    pub async fn update_rows(
        &self,
        profile: &str,
        table: &str,
        values: &Map<String, Value>,
        where_clause: &str,
        params: Vec<Value>,
    ) -> Result<u64> {
        let result = async {
            let statement = build_update(&self.validator, table, values, where_clause, params)?;
            self.run_sql(profile, SqlRequest::Execute(statement))
                .await
                .map(affected_rows)
        }
        .await;
        self.finish(profile, "sql_update", &result);
        result
    }

    pub async fn delete_rows(
        &self,
        profile: &str,
        table: &str,
        where_clause: &str,
        params: Vec<Value>,
    ) -> Result<u64> {
        let result = async {
            let statement = build_delete(&self.validator, table, where_clause, params)?;
            self.run_sql(profile, SqlRequest::Execute(statement))
                .await
                .map(affected_rows)
        }
        .await;
        self.finish(profile, "sql_delete", &result);
        result
    }

    // Observability and lifecycle

    /// Usage over `window`, defaulting to the retention period.
    pub fn usage_stats(&self, window: Option<Duration>) -> UsageStats {
        self.usage
            .windowed_stats(window.unwrap_or(self.config.usage_retention))
    }

    /// Occupancy of every shell and SQL pool key.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats = self.shell_pool.stats();
        stats.extend(self.sql_pool.stats());
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Start the idle sweepers and the usage cleanup. They stop when `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = self.config.sweep_interval;
        info!(
            "Starting maintenance: sweep every {:?}, usage retention {:?}",
            interval, self.config.usage_retention
        );
        vec![
            self.shell_pool.spawn_sweeper(interval, cancel.clone()),
            self.sql_pool.spawn_sweeper(interval, cancel.clone()),
            self.usage
                .spawn_cleanup(interval, self.config.usage_retention, cancel),
        ]
    }

    /// Close every idle connection in both pools.
    pub async fn shutdown(&self) {
        tokio::join!(self.shell_pool.shutdown(), self.sql_pool.shutdown());
    }
}
