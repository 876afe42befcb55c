//! Remote command channel over the system OpenSSH client
//!
//! A session is an OpenSSH control master kept in the foreground as a child
//! process. Every command is multiplexed over its control socket, so
//! authentication happens exactly once per host. Password authentication is
//! driven through `sshpass -e`, which reads the secret from the environment
//! rather than the command line.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::{AuthMethod, HostDescriptor};
use crate::deploy::connector::{CommandOutput, Connection};
use crate::errors::ConnectionError;
use crate::utils::generate_uuid;

/// `sshpass` exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// `ssh` exit status for connection-level failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// OpenSSH client options
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_program: String,
    pub sshpass_program: String,
    /// Budget for reaching the host and authenticating
    pub connect_timeout: Duration,
    /// Directory holding control sockets
    pub control_dir: PathBuf,
    pub strict_host_key_checking: String,
    pub server_alive_interval: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            connect_timeout: Duration::from_secs(20),
            control_dir: std::env::temp_dir(),
            strict_host_key_checking: "accept-new".to_string(),
            server_alive_interval: Duration::from_secs(15),
        }
    }
}

/// An authenticated SSH control master
pub struct SshSession {
    address: String,
    destination: String,
    port: u16,
    ssh_program: String,
    control_path: PathBuf,
    master: Option<Child>,
}

impl SshSession {
    /// Start the control master and wait until it accepts commands
    pub async fn establish(host: &HostDescriptor, options: &SshOptions) -> Result<Self, ConnectionError> {
        let control_path = options
            .control_dir
            .join(format!("maestro-{}.sock", &generate_uuid()[..8]));
        let destination = format!("{}@{}", host.username, host.address);

        let mut command = match &host.auth_method {
            AuthMethod::Password(secret) => {
                let mut command = Command::new(&options.sshpass_program);
                command
                    .env("SSHPASS", secret.expose_secret())
                    .arg("-e")
                    .arg(&options.ssh_program)
                    .args(["-o", "BatchMode=no"])
                    .args(["-o", "PubkeyAuthentication=no"])
                    .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
                    .args(["-o", "NumberOfPasswordPrompts=1"]);
                command
            }
            AuthMethod::Key(path) => {
                let mut command = Command::new(&options.ssh_program);
                command
                    .arg("-i")
                    .arg(path)
                    .args(["-o", "BatchMode=yes"])
                    .args(["-o", "IdentitiesOnly=yes"]);
                command
            }
        };

        command
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&control_path)
            .args(["-o", "ControlPersist=no"])
            .arg("-o")
            .arg(format!("StrictHostKeyChecking={}", options.strict_host_key_checking))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", options.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg(format!("ServerAliveInterval={}", options.server_alive_interval.as_secs().max(1)))
            .arg("-p")
            .arg(host.ssh_port.to_string())
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let via_sshpass = matches!(host.auth_method, AuthMethod::Password(_));
        let master = command.spawn().map_err(|e| {
            let program = if via_sshpass {
                &options.sshpass_program
            } else {
                &options.ssh_program
            };
            if e.kind() == ErrorKind::NotFound {
                ConnectionError::Config(format!("{} is not installed", program))
            } else {
                ConnectionError::Config(format!("failed to launch {}: {}", program, e))
            }
        })?;

        let mut session = Self {
            address: host.address.clone(),
            destination,
            port: host.ssh_port,
            ssh_program: options.ssh_program.clone(),
            control_path,
            master: Some(master),
        };

        match tokio::time::timeout(options.connect_timeout, session.wait_ready(via_sshpass)).await {
            Ok(Ok(())) => {
                debug!("SSH control master ready for {}", session.address);
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectionError::Unreachable {
                address: host.address.clone(),
                reason: format!("no session after {:?}", options.connect_timeout),
            }),
        }
    }

    async fn wait_ready(&mut self, via_sshpass: bool) -> Result<(), ConnectionError> {
        loop {
            let exited = match self.master.as_mut() {
                Some(master) => master.try_wait().map_err(|e| ConnectionError::Channel {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })?,
                None => None,
            };

            if let Some(status) = exited {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.master.as_mut().and_then(|m| m.stderr.take()) {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                self.master = None;
                return Err(classify_ssh_failure(
                    &self.address,
                    status.code(),
                    &stderr,
                    via_sshpass,
                ));
            }

            if self.check().await {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn check(&self) -> bool {
        self.control_command()
            .args(["-O", "check"])
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn control_command(&self) -> Command {
        let mut command = Command::new(&self.ssh_program);
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no"])
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Connection for SshSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        debug!("[{}] $ {}", self.address, command);
        let output = self
            .control_command()
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .output()
            .await
            .map_err(|e| ConnectionError::Channel {
                address: self.address.clone(),
                reason: format!("failed to spawn ssh: {}", e),
            })?;

        let output = CommandOutput::from(output);
        // 255 is also a legal remote exit code; only a dead master means a broken channel
        if output.exit_code == Some(SSH_CONNECTION_FAILURE) && !self.check().await {
            return Err(ConnectionError::Channel {
                address: self.address.clone(),
                reason: output.diagnostics().to_string(),
            });
        }
        Ok(output)
    }

    async fn close(&mut self) {
        if self.master.is_none() {
            return;
        }

        let exit = self
            .control_command()
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = exit {
            warn!("Failed to request SSH master exit for {}: {}", self.address, e);
        }

        if let Some(mut master) = self.master.take() {
            let _ = master.kill().await;
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
        debug!("SSH session to {} closed", self.address);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // The master child is killed by `kill_on_drop`; only the socket remains
        if self.master.take().is_some() {
            let _ = std::fs::remove_file(&self.control_path);
        }
    }
}

/// Map a failed session attempt to the connection error it represents
pub fn classify_ssh_failure(
    address: &str,
    exit_code: Option<i32>,
    stderr: &str,
    via_sshpass: bool,
) -> ConnectionError {
    let lower = stderr.to_lowercase();
    let reason = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("ssh exited without a message")
        .to_string();

    let rejected = (via_sshpass && exit_code == Some(SSHPASS_BAD_PASSWORD))
        || lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures");
    if rejected {
        return ConnectionError::Authentication {
            address: address.to_string(),
            reason,
        };
    }

    if lower.contains("load key") || lower.contains("bad permissions") || lower.contains("invalid format") {
        return ConnectionError::Config(reason);
    }

    ConnectionError::Unreachable {
        address: address.to_string(),
        reason,
    }
}
