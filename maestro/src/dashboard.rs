//! Dashboard process management
//!
//! Installs the dashboard's npm dependencies, builds it the first time, then
//! keeps the preview server running. Output is forwarded to the log under the
//! `dashboard` target. A failing dashboard is reported but never stops a
//! deployment.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::document::NpmSection;
use crate::errors::MaestroError;

/// Marker written once the dashboard has been built
pub const BUILT_MARKER: &str = ".dashboard_built";

/// Dashboard options
#[derive(Debug, Clone)]
pub struct Options {
    /// Dashboard project directory
    pub path: PathBuf,

    /// Preview server port
    pub port: u16,

    /// Package manager executable
    pub program: String,
}

impl From<&NpmSection> for Options {
    fn from(section: &NpmSection) -> Self {
        Self {
            path: section.dashboard_path.clone(),
            port: section.port,
            program: "npm".to_string(),
        }
    }
}

/// Prepare the dashboard and serve it until shutdown or exit
pub async fn run(
    options: &Options,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), MaestroError> {
    if !options.path.is_dir() {
        return Err(MaestroError::DashboardError(format!(
            "dashboard directory not found at {:?}",
            options.path
        )));
    }

    let prepare = async {
        info!("Installing dashboard dependencies...");
        run_step(options, &["install"]).await?;

        let marker = options.path.join(BUILT_MARKER);
        if !marker.exists() {
            info!("Building dashboard for the first time...");
            run_step(options, &["run", "build"]).await?;
            tokio::fs::write(&marker, b"").await?;
        }
        Ok::<(), MaestroError>(())
    };
    tokio::select! {
        _ = &mut shutdown_signal => return Ok(()),
        result = prepare => result?,
    }

    let port = options.port.to_string();
    let preview_args = ["run", "preview", "--", "--port", port.as_str()];
    info!("Starting dashboard preview on port {}", port);
    let status = tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Stopping dashboard...");
            return Ok(());
        }
        status = run_npm(options, &preview_args) => status?,
    };

    Err(MaestroError::DashboardError(format!(
        "dashboard preview exited with {}",
        status
    )))
}

async fn run_step(options: &Options, args: &[&str]) -> Result<(), MaestroError> {
    let status = run_npm(options, args).await?;
    if status.success() {
        Ok(())
    } else {
        Err(MaestroError::DashboardError(format!(
            "`{} {}` exited with {}",
            options.program,
            args.join(" "),
            status
        )))
    }
}

/// Run the package manager in the dashboard directory, forwarding its output
async fn run_npm(options: &Options, args: &[&str]) -> Result<ExitStatus, MaestroError> {
    let mut child = Command::new(&options.program)
        .args(args)
        .current_dir(&options.path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            MaestroError::DashboardError(format!("failed to execute {}: {}", options.program, e))
        })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward(out, false)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward(err, true)));

    let status = child.wait().await?;
    for handle in [stdout, stderr].into_iter().flatten() {
        let _ = handle.await;
    }
    Ok(status)
}

async fn forward<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "dashboard", "{}", line);
        } else {
            info!(target: "dashboard", "{}", line);
        }
    }
}

/// Whether the dashboard at `path` has been built before
pub fn is_built(path: &Path) -> bool {
    path.join(BUILT_MARKER).exists()
}
