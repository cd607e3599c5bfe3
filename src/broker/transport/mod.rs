//! Concrete transports: SSH sessions and PostgreSQL connections.
//!
//! The broker talks to both through [`ShellTransport`] and [`SqlTransport`],
//! which extend the pool's [`Connector`] with the one operation each kind of
//! connection supports.

pub mod auth;
pub mod sql;
pub mod ssh;

use async_trait::async_trait;

use super::error::Result;
use super::pool::Connector;
use super::profile::LivenessProbe;
use super::types::{ConnectionTarget, ResourceType};

pub use sql::{QueryOutcome, SqlConnector, SqlRequest};
pub use ssh::{CommandOutput, SshConnector};

/// Connections that run shell commands.
#[async_trait]
pub trait ShellTransport: Connector {
    async fn exec(&self, conn: &mut Self::Connection, command: &str) -> Result<CommandOutput>;
}

/// Connections that run SQL.
#[async_trait]
pub trait SqlTransport: Connector {
    async fn run(&self, conn: &mut Self::Connection, request: SqlRequest) -> Result<QueryOutcome>;
}

/// Liveness test that dispatches on the target's resource type.
pub struct TransportProbe {
    ssh: SshConnector,
    sql: SqlConnector,
}

impl TransportProbe {
    pub fn new(ssh: SshConnector, sql: SqlConnector) -> Self {
        Self { ssh, sql }
    }
}

#[async_trait]
impl LivenessProbe for TransportProbe {
    async fn probe(&self, target: &ConnectionTarget) -> Result<()> {
        match target.resource_type {
            ResourceType::Shell => self.ssh.probe(target).await,
            ResourceType::Sql => self.sql.probe(target).await,
        }
    }
}
