//! SSH transport built on `russh`.
//!
//! - `SshClientHandler`: a russh client handler that accepts all host keys
//!   (similar to `StrictHostKeyChecking=no` in OpenSSH).
//! - [`SshConnector`]: opens and authenticates sessions for the connection pool.
//! - [`execute`]: runs one command on a pooled session and collects its output.
//!
//! Command round-trips are bounded by the caller, which disconnects the
//! session when the bound is hit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::error::{BrokerError, Result};
use crate::broker::pool::Connector;
use crate::broker::types::ConnectionTarget;

use super::ShellTransport;
use super::auth::{AuthChain, AuthStrategy};

/// Keepalive period for pooled sessions
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Command used by the setup liveness test
const LIVENESS_COMMAND: &str = "echo test";

/// Client handler for russh that accepts all host keys.
///
/// # Security Note
///
/// Host keys are not verified against a known_hosts file.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type SshSession = client::Handle<SshClientHandler>;

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the server sent no exit status
    pub exit_code: i32,
}

impl CommandOutput {
    fn from_bytes(stdout: &[u8], stderr: &[u8], exit_code: Option<u32>) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
        }
    }
}

/// Client configuration for pooled sessions.
///
/// The inactivity timeout is disabled: idle sessions are reaped by the pool sweep.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    let preferred = russh::Preferred {
        compression: (&[russh::compression::ZLIB, russh::compression::NONE][..]).into(),
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Opens authenticated SSH sessions.
#[derive(Clone)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            config: build_client_config(),
        }
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<SshSession> {
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let auth_chain = AuthChain::for_target(target);
        let success = auth_chain
            .authenticate(&mut handle, &target.username)
            .await
            .map_err(|e| BrokerError::Connection(format!("Authentication failed: {}", e)))?;

        if !success {
            return Err(BrokerError::Connection(
                "Authentication failed: no authentication methods succeeded".to_string(),
            ));
        }

        debug!("SSH session established for {}", target.pool_key());
        Ok(handle)
    }

    /// Open a session, run a no-op and disconnect.
    pub async fn probe(&self, target: &ConnectionTarget) -> Result<()> {
        let session = self.open(target).await?;
        let result = execute(&session, LIVENESS_COMMAND).await;
        self.close(session).await;

        check_liveness(&result?)
    }
}

/// The liveness command passes only with exit status 0. A missing status counts as failure.
fn check_liveness(output: &CommandOutput) -> Result<()> {
    if output.exit_code != 0 {
        return Err(BrokerError::Connection(format!(
            "liveness command exited with {}",
            output.exit_code
        )));
    }
    Ok(())
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Connection = SshSession;

    async fn connect(&self, target: &ConnectionTarget) -> Result<SshSession> {
        self.open(target).await
    }

    async fn is_valid(&self, conn: &mut SshSession) -> bool {
        !conn.is_closed()
    }

    async fn close(&self, conn: SshSession) {
        if let Err(e) = conn
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

#[async_trait]
impl ShellTransport for SshConnector {
    async fn exec(&self, conn: &mut SshSession, command: &str) -> Result<CommandOutput> {
        execute(conn, command).await
    }
}

/// Run `command` on `session` and collect stdout, stderr and the exit status.
pub async fn execute(session: &SshSession, command: &str) -> Result<CommandOutput> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| BrokerError::Connection(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| BrokerError::Connection(format!("Failed to execute command: {}", e)))?;

    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_code: Option<u32> = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                // ext == 1 is stderr in SSH protocol
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status);
            }
            Some(ChannelMsg::Eof) => {
                // Keep waiting for the exit status if it has not arrived
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let _ = channel.close().await;
    Ok(CommandOutput::from_bytes(&stdout, &stderr, exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod config {
        use super::*;

        #[test]
        fn test_pooled_sessions_have_no_inactivity_timeout() {
            let config = build_client_config();
            assert!(config.inactivity_timeout.is_none());
            assert_eq!(config.keepalive_interval, Some(KEEPALIVE_INTERVAL));
            assert_eq!(config.keepalive_max, 3);
        }
    }

    mod liveness {
        use super::*;

        #[test]
        fn test_zero_exit_passes() {
            let output = CommandOutput::from_bytes(b"test\n", b"", Some(0));
            assert!(check_liveness(&output).is_ok());
        }

        #[test]
        fn test_nonzero_exit_fails() {
            let output = CommandOutput::from_bytes(b"", b"denied", Some(1));
            let err = check_liveness(&output).unwrap_err();
            assert!(matches!(err, BrokerError::Connection(_)));
            assert!(err.to_string().contains("exited with 1"));
        }

        #[test]
        fn test_missing_exit_status_fails() {
            let output = CommandOutput::from_bytes(b"test\n", b"", None);
            assert!(matches!(
                check_liveness(&output),
                Err(BrokerError::Connection(_))
            ));
        }
    }

    mod output {
        use super::*;

        #[test]
        fn test_missing_exit_status_is_minus_one() {
            let output = CommandOutput::from_bytes(b"hi\n", b"", None);
            assert_eq!(output.stdout, "hi\n");
            assert_eq!(output.exit_code, -1);
        }

        #[test]
        fn test_invalid_utf8_is_replaced() {
            let output = CommandOutput::from_bytes(&[0x66, 0xff, 0x6f], b"warn", Some(2));
            assert_eq!(output.stdout, "f\u{fffd}o");
            assert_eq!(output.stderr, "warn");
            assert_eq!(output.exit_code, 2);
        }
    }
}
