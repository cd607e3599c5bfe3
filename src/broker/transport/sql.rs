//! PostgreSQL transport built on `sqlx`.
//!
//! Statements are built from validated identifiers and executed on a single
//! pooled [`PgConnection`]. Values are always bound as parameters, never
//! interpolated.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Arguments, Connection};
use tracing::debug;

use crate::broker::error::{BrokerError, Result};
use crate::broker::pool::Connector;
use crate::broker::types::ConnectionTarget;
use crate::broker::validation::{
    Validator, decorate_select, ensure_where_clause, is_read_only_query, quote_identifier,
};

use super::SqlTransport;

static PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\$(\d+)").ok());

/// Result of a SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    /// Rows of a read-only query, one JSON object per row
    Rows {
        rows: Vec<Value>,
        #[schemars(schema_with = "crate::mcp::schema::uint")]
        row_count: u64,
    },
    /// Row count of a data-modifying statement
    Affected {
        #[schemars(schema_with = "crate::mcp::schema::uint")]
        rows_affected: u64,
    },
}

/// What to run on a pooled database connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlRequest {
    /// Caller-written SQL
    Raw {
        sql: String,
        params: Vec<Value>,
        limit: u64,
    },
    /// Built statement returning rows
    Fetch(Statement),
    /// Built statement returning a row count
    Execute(Statement),
}

/// A statement together with the values bound to its placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Connection options for a target. `tls` requires TLS, otherwise it is preferred.
pub(crate) fn connect_options(target: &ConnectionTarget) -> PgConnectOptions {
    let ssl_mode = if target.extra.tls {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };
    let options = PgConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .username(&target.username)
        .password(target.secret.as_str())
        .ssl_mode(ssl_mode);
    match &target.extra.database {
        Some(database) => options.database(database),
        None => options,
    }
}

/// Opens single PostgreSQL connections.
#[derive(Debug, Clone, Default)]
pub struct SqlConnector;

impl SqlConnector {
    pub fn new() -> Self {
        Self
    }

    /// Connect, run `SELECT 1` and close.
    pub async fn probe(&self, target: &ConnectionTarget) -> Result<()> {
        let mut conn = self.connect(target).await?;
        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&mut conn)
            .await;
        self.close(conn).await;
        result?;
        Ok(())
    }
}

#[async_trait]
impl SqlTransport for SqlConnector {
    async fn run(&self, conn: &mut PgConnection, request: SqlRequest) -> Result<QueryOutcome> {
        dispatch(conn, request).await
    }
}

#[async_trait]
impl Connector for SqlConnector {
    type Connection = PgConnection;

    async fn connect(&self, target: &ConnectionTarget) -> Result<PgConnection> {
        let conn = PgConnection::connect_with(&connect_options(target))
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;
        debug!("Database connection established for {}", target.pool_key());
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!("Database close failed: {}", e);
        }
    }
}

/// Bind JSON values: null, bool, integer, float and string map to their SQL
/// counterparts, arrays and objects bind as `jsonb`.
fn build_arguments(params: &[Value]) -> Result<PgArguments> {
    let mut args = PgArguments::default();
    for (index, value) in params.iter().enumerate() {
        let added = match value {
            Value::Null => args.add(Option::<String>::None),
            Value::Bool(b) => args.add(*b),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => args.add(i),
                (None, Some(f)) => args.add(f),
                (None, None) => args.add(n.to_string()),
            },
            Value::String(s) => args.add(s.clone()),
            other => args.add(sqlx::types::Json(other.clone())),
        };
        added.map_err(|e| {
            BrokerError::InvalidInput(format!("cannot bind parameter ${}: {}", index + 1, e))
        })?;
    }
    Ok(args)
}

/// Shift every `$n` placeholder in `clause` by `offset`.
fn renumber_placeholders(clause: &str, offset: usize) -> String {
    match PLACEHOLDER.as_ref() {
        Some(re) if offset > 0 => re
            .replace_all(clause, |caps: &Captures<'_>| match caps[1].parse::<usize>() {
                Ok(n) => format!("${}", n + offset),
                Err(_) => caps[0].to_string(),
            })
            .into_owned(),
        _ => clause.to_string(),
    }
}

fn quoted_columns<'a>(
    validator: &Validator,
    columns: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<String>> {
    columns
        .into_iter()
        .map(|column| validator.ensure_identifier(column).map(quote_identifier))
        .collect()
}

/// `SELECT cols FROM table [WHERE ...] LIMIT n`. Empty `columns` selects `*`.
pub fn build_select(
    validator: &Validator,
    table: &str,
    columns: &[String],
    where_clause: Option<&str>,
    params: Vec<Value>,
    limit: u64,
) -> Result<Statement> {
    let table = quote_identifier(validator.ensure_identifier(table)?);
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        quoted_columns(validator, columns)?.join(", ")
    };
    let mut sql = format!("SELECT {} FROM {}", projection, table);
    if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(clause);
    }
    sql.push_str(&format!(" LIMIT {}", limit));
    Ok(Statement { sql, params })
}

/// `INSERT INTO table (cols) VALUES ($1, ...)`.
pub fn build_insert(validator: &Validator, table: &str, values: &Map<String, Value>) -> Result<Statement> {
    if values.is_empty() {
        return Err(BrokerError::InvalidInput(
            "insert requires at least one column".to_string(),
        ));
    }
    let table = quote_identifier(validator.ensure_identifier(table)?);
    let columns = quoted_columns(validator, values.keys())?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params: values.values().cloned().collect(),
    })
}

/// `UPDATE table SET col = $1, ... WHERE ...`.
///
/// Placeholders in `where_clause` are numbered from `$1` and shifted past the
/// SET values.
pub fn build_update(
    validator: &Validator,
    table: &str,
    values: &Map<String, Value>,
    where_clause: &str,
    where_params: Vec<Value>,
) -> Result<Statement> {
    let where_clause = ensure_where_clause(where_clause, "UPDATE")?;
    if values.is_empty() {
        return Err(BrokerError::InvalidInput(
            "update requires at least one column".to_string(),
        ));
    }
    let table = quote_identifier(validator.ensure_identifier(table)?);
    let assignments: Vec<String> = quoted_columns(validator, values.keys())?
        .into_iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", column, i + 1))
        .collect();

    let mut params: Vec<Value> = values.values().cloned().collect();
    let where_clause = renumber_placeholders(where_clause.trim(), params.len());
    params.extend(where_params);
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            table,
            assignments.join(", "),
            where_clause
        ),
        params,
    })
}

/// `DELETE FROM table WHERE ...`.
pub fn build_delete(
    validator: &Validator,
    table: &str,
    where_clause: &str,
    params: Vec<Value>,
) -> Result<Statement> {
    let where_clause = ensure_where_clause(where_clause, "DELETE")?;
    let table = quote_identifier(validator.ensure_identifier(table)?);
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {}", table, where_clause.trim()),
        params,
    })
}

/// Fetch the rows of a read-only statement as JSON objects.
pub async fn fetch_rows(conn: &mut PgConnection, statement: &Statement) -> Result<Vec<Value>> {
    let body = statement.sql.trim().trim_end_matches(';').trim_end();
    let wrapped = format!(
        "SELECT COALESCE(json_agg(t), '[]'::json) FROM ({}) AS t",
        body
    );
    let args = build_arguments(&statement.params)?;
    let value: Value = sqlx::query_scalar_with(&wrapped, args)
        .fetch_one(&mut *conn)
        .await?;
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

/// Execute a data-modifying statement and return the affected row count.
pub async fn execute(conn: &mut PgConnection, statement: &Statement) -> Result<u64> {
    let args = build_arguments(&statement.params)?;
    let result = sqlx::query_with(&statement.sql, args)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Run `request` on `conn`.
///
/// Raw queries that are read-only get a row cap and return rows, any other raw
/// statement returns the affected row count.
pub async fn dispatch(conn: &mut PgConnection, request: SqlRequest) -> Result<QueryOutcome> {
    let (statement, returns_rows) = match request {
        SqlRequest::Raw { sql, params, limit } => {
            if is_read_only_query(&sql) {
                let sql = decorate_select(&sql, limit);
                (Statement { sql, params }, true)
            } else {
                let sql = sql.trim().to_string();
                (Statement { sql, params }, false)
            }
        }
        SqlRequest::Fetch(statement) => (statement, true),
        SqlRequest::Execute(statement) => (statement, false),
    };

    if returns_rows {
        let rows = fetch_rows(conn, &statement).await?;
        Ok(QueryOutcome::Rows {
            row_count: rows.len() as u64,
            rows,
        })
    } else {
        let rows_affected = execute(conn, &statement).await?;
        Ok(QueryOutcome::Affected { rows_affected })
    }
}
