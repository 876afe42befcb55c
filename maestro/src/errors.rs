//! Error types for the Maestro orchestrator

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Process-level error type for Maestro
#[derive(Error, Debug)]
pub enum MaestroError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Notifier error: {0}")]
    NotifierError(String),

    #[error("Dashboard error: {0}")]
    DashboardError(String),

    #[error("Logging error: {0}")]
    LoggingError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// Fatal configuration problems, raised before any host is touched
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Parse(String),

    #[error("duplicate host address: {0}")]
    DuplicateHost(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string().trim_end().to_string())
    }
}

/// Failure to open or use a command channel to a host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("authentication rejected by {address}: {reason}")]
    Authentication { address: String, reason: String },

    #[error("host {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("connection configuration error: {0}")]
    Config(String),

    #[error("command channel to {address} failed: {reason}")]
    Channel { address: String, reason: String },
}

/// Container runtime could not be verified or installed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("runtime install failed at {stage} (exit code {}): {detail}", fmt_code(.exit_code))]
pub struct InstallError {
    pub stage: &'static str,
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl InstallError {
    pub fn new(stage: &'static str, exit_code: Option<i32>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            exit_code,
            detail: detail.into(),
        }
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Shared image build failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("image build failed: {log}")]
pub struct BuildError {
    pub log: String,
}

impl BuildError {
    pub fn new(log: impl Into<String>) -> Self {
        Self { log: log.into() }
    }
}

/// Step of the container deployment that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Pull,
    Inspect,
    Remove,
    Create,
    Start,
    Verify,
    Scale,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Pull => "pull",
            DeployStage::Inspect => "inspect",
            DeployStage::Remove => "remove",
            DeployStage::Create => "create",
            DeployStage::Start => "start",
            DeployStage::Verify => "verify",
            DeployStage::Scale => "scale",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container deployment failure on one host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("deploy failed at {stage}: {detail}{}", .last_status.as_ref().map(|s| format!(" (last status: {s})")).unwrap_or_default())]
pub struct DeployError {
    pub stage: DeployStage,
    pub detail: String,
    pub last_status: Option<String>,
}

impl DeployError {
    pub fn new(stage: DeployStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
            last_status: None,
        }
    }

    pub fn verify(detail: impl Into<String>, last_status: Option<String>) -> Self {
        Self {
            stage: DeployStage::Verify,
            detail: detail.into(),
            last_status,
        }
    }
}

/// Error reported by a container runtime back end
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RuntimeError(pub String);

impl From<ConnectionError> for RuntimeError {
    fn from(err: ConnectionError) -> Self {
        RuntimeError(err.to_string())
    }
}

/// Side-channel message that cannot be accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("protocol version {found} is older than the minimum {minimum}")]
    UnsupportedVersion { found: u64, minimum: u64 },
}

/// Why a deployment target ended up `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl FailureReason {
    /// Short name of the pipeline stage that failed
    pub fn stage(&self) -> String {
        match self {
            FailureReason::Connection(_) => "connect".to_string(),
            FailureReason::Install(_) => "install".to_string(),
            FailureReason::Build(_) => "build".to_string(),
            FailureReason::Deploy(e) => format!("deploy:{}", e.stage),
            FailureReason::Cancelled => "cancelled".to_string(),
            FailureReason::Internal(_) => "internal".to_string(),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            FailureReason::Connection(ConnectionError::Authentication { .. })
        )
    }
}
