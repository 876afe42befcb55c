//! Command channels to deployment hosts

use std::collections::HashSet;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AuthMethod, HostDescriptor};
use crate::deploy::ssh::{SshOptions, SshSession};
use crate::errors::ConnectionError;

/// Result of running a command on a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr if present, stdout otherwise
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// An open command channel to one host
///
/// Implementations release their session when dropped, so a pipeline that is
/// cancelled mid-command still frees the host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Address of the host this channel is bound to
    fn address(&self) -> &str;

    fn is_local(&self) -> bool;

    /// Run a shell command on the host
    ///
    /// A non-zero exit is reported through [`CommandOutput`]; only a broken
    /// channel is an error.
    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError>;

    /// Close the session
    async fn close(&mut self);
}

/// Opens command channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostDescriptor) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Runs commands on the orchestrator machine itself
pub struct LocalConnection {
    address: String,
}

impl LocalConnection {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        debug!("[{}] $ {}", self.address, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConnectionError::Channel {
                address: self.address.clone(),
                reason: format!("failed to spawn local shell: {}", e),
            })?;
        Ok(output.into())
    }

    async fn close(&mut self) {}
}

/// Connector backed by the local shell and the system OpenSSH client
pub struct SystemConnector {
    ssh: SshOptions,
    local_names: HashSet<String>,
}

impl SystemConnector {
    pub fn new(ssh: SshOptions) -> Self {
        let mut local_names: HashSet<String> = ["localhost", "127.0.0.1", "::1"]
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(hostname) = sysinfo::System::host_name() {
            local_names.insert(hostname.to_lowercase());
        }
        Self { ssh, local_names }
    }

    pub fn is_local(&self, address: &str) -> bool {
        self.local_names.contains(&address.to_lowercase())
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn connect(&self, host: &HostDescriptor) -> Result<Box<dyn Connection>, ConnectionError> {
        if self.is_local(&host.address) {
            debug!("{} resolves to the local machine", host.address);
            return Ok(Box::new(LocalConnection::new(host.address.clone())));
        }

        if let AuthMethod::Key(path) = &host.auth_method {
            tokio::fs::File::open(path).await.map_err(|e| {
                ConnectionError::Config(format!("private key {:?} is unreadable: {}", path, e))
            })?;
        }

        info!(
            "Opening SSH session to {}@{}:{} ({} auth)",
            host.username,
            host.address,
            host.ssh_port,
            host.auth_method.kind()
        );
        let session = SshSession::establish(host, &self.ssh).await?;
        Ok(Box::new(session))
    }
}
