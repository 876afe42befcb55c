//! Container runtime operations used by the deployer

use async_trait::async_trait;
use tracing::debug;

use crate::deploy::connector::{CommandOutput, Connection};
use crate::errors::RuntimeError;
use crate::utils::{shell_quote, tail_lines};

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub ports: Vec<String>,
    pub restart_policy: Option<String>,
}

/// Outcome of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Container runtime on one host
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Current status (`running`, `exited`, ...) or `None` if absent
    async fn status(&self, name: &str) -> Result<Option<String>, RuntimeError>;

    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<StopOutcome, RuntimeError>;

    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    async fn create(&self, request: &ContainerRequest) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of all containers, running or not, starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError>;
}

/// Docker CLI driven over a host connection
pub struct CliRuntime<'a> {
    conn: &'a dyn Connection,
    docker: String,
}

impl<'a> CliRuntime<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self {
            conn,
            docker: "docker".to_string(),
        }
    }

    /// Pick `docker` or `sudo -n docker` depending on daemon socket access
    pub async fn detect(conn: &'a dyn Connection) -> Self {
        let mut runtime = Self::new(conn);
        if conn.is_local() {
            return runtime;
        }
        let direct = conn.exec("docker info --format '{{.ServerVersion}}'").await;
        let denied = matches!(&direct, Ok(out) if !out.success() && out.diagnostics().to_lowercase().contains("permission denied"));
        if denied {
            let elevated = conn
                .exec("sudo -n docker info --format '{{.ServerVersion}}'")
                .await;
            if matches!(elevated, Ok(out) if out.success()) {
                debug!("Using sudo for docker on {}", conn.address());
                runtime.docker = "sudo -n docker".to_string();
            }
        }
        runtime
    }

    async fn docker(&self, args: &[&str]) -> Result<CommandOutput, RuntimeError> {
        let mut command = self.docker.clone();
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        Ok(self.conn.exec(&command).await?)
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    let diagnostics = output.diagnostics().to_lowercase();
    diagnostics.contains("no such container") || diagnostics.contains("no such object")
}

fn failure(what: &str, output: &CommandOutput) -> RuntimeError {
    RuntimeError(format!(
        "docker {} exited with {}: {}",
        what,
        output
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string()),
        tail_lines(output.diagnostics(), 5)
    ))
}

#[async_trait]
impl ContainerRuntime for CliRuntime<'_> {
    async fn status(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let output = self
            .docker(&["inspect", "--type", "container", "--format", "{{.State.Status}}", name])
            .await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else if is_missing(&output) {
            Ok(None)
        } else {
            Err(failure("inspect", &output))
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let output = self.docker(&["pull", "--quiet", image]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(failure("pull", &output))
        }
    }

    async fn stop(&self, name: &str) -> Result<StopOutcome, RuntimeError> {
        match self.status(name).await?.as_deref() {
            None | Some("created") | Some("exited") | Some("dead") => {
                return Ok(StopOutcome::AlreadyStopped)
            }
            _ => {}
        }
        let output = self.docker(&["stop", name]).await?;
        if output.success() {
            Ok(StopOutcome::Stopped)
        } else if is_missing(&output) || output.diagnostics().to_lowercase().contains("is not running") {
            Ok(StopOutcome::AlreadyStopped)
        } else {
            Err(failure("stop", &output))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let output = self.docker(&["rm", name]).await?;
        if output.success() || is_missing(&output) {
            Ok(())
        } else {
            Err(failure("rm", &output))
        }
    }

    async fn create(&self, request: &ContainerRequest) -> Result<(), RuntimeError> {
        let mut args: Vec<&str> = vec!["create", "--name", request.name.as_str()];
        if let Some(policy) = &request.restart_policy {
            args.extend(["--restart", policy.as_str()]);
        }
        for port in &request.ports {
            args.extend(["-p", port.as_str()]);
        }
        args.push(request.image.as_str());

        let output = self.docker(&args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(failure("create", &output))
        }
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let output = self.docker(&["start", name]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(failure("start", &output))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let filter = format!("name=^/?{}", prefix);
        let output = self
            .docker(&["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"])
            .await?;
        if !output.success() {
            return Err(failure("ps", &output));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(String::from)
            .collect())
    }
}
