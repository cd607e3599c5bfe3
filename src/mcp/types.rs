//! Serializable response types for the MCP broker tools.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for proper
//! MCP protocol compatibility. Unsigned fields use the `uint` schema helper.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::pool::PoolStats;
use crate::broker::transport::{CommandOutput, QueryOutcome};
use crate::broker::types::ProfileSummary;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProfileSetupResponse {
    pub profile: ProfileSummary,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProfileListResponse {
    pub profiles: Vec<ProfileSummary>,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProfileDeleteResponse {
    pub profile: ProfileSummary,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshExecuteResponse {
    pub profile: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl SshExecuteResponse {
    pub fn new(profile: String, output: CommandOutput) -> Self {
        Self {
            profile,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }
}

/// Rows for read-only statements, an affected row count otherwise
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SqlQueryResponse {
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::mcp::schema::optional_uint")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::mcp::schema::optional_uint")]
    pub rows_affected: Option<u64>,
}

impl SqlQueryResponse {
    pub fn new(profile: String, outcome: QueryOutcome) -> Self {
        match outcome {
            QueryOutcome::Rows { rows, row_count } => Self {
                profile,
                rows: Some(rows),
                row_count: Some(row_count),
                rows_affected: None,
            },
            QueryOutcome::Affected { rows_affected } => Self {
                profile,
                rows: None,
                row_count: None,
                rows_affected: Some(rows_affected),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SqlWriteResponse {
    pub profile: String,
    pub table: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub rows_affected: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PoolStatusResponse {
    pub pools: Vec<PoolStats>,
    /// Live connections across all pools
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub total: usize,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub in_use: usize,
}

impl PoolStatusResponse {
    pub fn new(pools: Vec<PoolStats>) -> Self {
        Self {
            total: pools.iter().map(|p| p.total).sum(),
            in_use: pools.iter().map(|p| p.in_use).sum(),
            pools,
        }
    }
}
