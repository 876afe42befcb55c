//! Container runtime prerequisite check and installation

use tracing::{info, warn};

use crate::deploy::connector::{CommandOutput, Connection};
use crate::errors::InstallError;
use crate::utils::tail_lines;

/// Docker convenience install script
pub const INSTALL_SCRIPT_URL: &str = "https://get.docker.com";

const DETECT_COMMAND: &str = "docker --version";
const PLATFORM_COMMAND: &str = "uname -s";
const SCRIPT_PATH: &str = "/tmp/maestro-get-docker.sh";
const GROUP_COMMAND: &str = "[ \"$(id -u)\" -eq 0 ] || sudo -n usermod -aG docker \"$USER\"";

/// Runtime detected on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub version: String,
    /// Whether this call installed the runtime
    pub installed: bool,
}

/// Verifies the container runtime and installs it when absent
#[derive(Debug, Clone)]
pub struct PrerequisiteInstaller {
    script_url: String,
}

impl Default for PrerequisiteInstaller {
    fn default() -> Self {
        Self::new(INSTALL_SCRIPT_URL)
    }
}

impl PrerequisiteInstaller {
    pub fn new(script_url: impl Into<String>) -> Self {
        Self {
            script_url: script_url.into(),
        }
    }

    /// Ensure the runtime is present, installing it at most once
    pub async fn ensure_runtime(&self, conn: &dyn Connection) -> Result<Ready, InstallError> {
        let address = conn.address();

        if let Some(version) = self.detect(conn).await? {
            info!("Docker is installed on {}: {}", address, version);
            return Ok(Ready {
                version,
                installed: false,
            });
        }

        warn!("Docker is not installed on {}, attempting to install", address);
        self.install(conn).await?;

        match self.detect(conn).await? {
            Some(version) => {
                info!("Docker installed successfully on {}: {}", address, version);
                Ok(Ready {
                    version,
                    installed: true,
                })
            }
            None => Err(InstallError::new(
                "confirm",
                None,
                "install finished but docker still reports no version",
            )),
        }
    }

    async fn detect(&self, conn: &dyn Connection) -> Result<Option<String>, InstallError> {
        let output = run(conn, "detect", DETECT_COMMAND).await?;
        let version = output.stdout.trim();
        if output.success() && version.to_lowercase().contains("version") {
            Ok(Some(version.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn install(&self, conn: &dyn Connection) -> Result<(), InstallError> {
        let platform = run(conn, "platform", PLATFORM_COMMAND).await?;
        let platform = platform.stdout.trim();
        if platform != "Linux" {
            return Err(InstallError::new(
                "platform",
                None,
                format!("automatic install is not supported on {:?}", platform),
            ));
        }

        let download = format!("curl -fsSL {} -o {}", self.script_url, SCRIPT_PATH);
        check(run(conn, "download", &download).await?, "download")?;

        let install = format!(
            "if [ \"$(id -u)\" -eq 0 ]; then sh {script}; else sudo -n sh {script}; fi",
            script = SCRIPT_PATH
        );
        check(run(conn, "install", &install).await?, "install")?;

        // Let the remote user talk to the daemon without sudo
        if !conn.is_local() {
            match conn.exec(GROUP_COMMAND).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(
                    "Could not add the user to the docker group on {} (exit {:?}): {}; docker will need sudo",
                    conn.address(),
                    output.exit_code,
                    tail_lines(output.diagnostics(), 3)
                ),
                Err(e) => warn!(
                    "Could not add the user to the docker group on {}: {}; docker will need sudo",
                    conn.address(),
                    e
                ),
            }
        }

        Ok(())
    }
}

async fn run(conn: &dyn Connection, stage: &'static str, command: &str) -> Result<CommandOutput, InstallError> {
    conn.exec(command)
        .await
        .map_err(|e| InstallError::new(stage, None, e.to_string()))
}

fn check(output: CommandOutput, stage: &'static str) -> Result<(), InstallError> {
    if output.success() {
        Ok(())
    } else {
        Err(InstallError::new(
            stage,
            output.exit_code,
            tail_lines(output.diagnostics(), 5),
        ))
    }
}
