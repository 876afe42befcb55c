//! Raw configuration document as it appears on disk

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Top-level TOML document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub logging: LoggingSection,

    pub deployment: DeploymentSection,

    pub docker: DockerSection,

    #[serde(default)]
    pub dockerfile: Option<DockerfileSection>,

    #[serde(default)]
    pub npm: Option<NpmSection>,

    #[serde(default)]
    pub notifier: NotifierSection,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,

    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Fleet definition
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSection {
    pub hosts: Vec<HostEntry>,

    /// Deploy the existing image instead of building it
    #[serde(default, alias = "skipBuild")]
    pub skip_build: bool,

    #[serde(default)]
    pub timeouts: TimeoutsSection,

    #[serde(default)]
    pub verify: VerifySection,
}

/// One `[[deployment.hosts]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub address: String,

    pub username: String,

    #[serde(alias = "authMethod")]
    pub auth_method: AuthEntry,

    #[serde(default, alias = "sshPort")]
    pub ssh_port: Option<u16>,

    #[serde(default, alias = "dockerUrl")]
    pub docker_url: Option<String>,
}

/// Authentication entry, written as `{ Password = "..." }` or `{ Key = "..." }`
#[derive(Clone, Deserialize)]
pub enum AuthEntry {
    #[serde(alias = "password")]
    Password(String),

    #[serde(alias = "key")]
    Key(PathBuf),
}

impl fmt::Debug for AuthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthEntry::Password(_) => f.write_str("Password([REDACTED])"),
            AuthEntry::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// Per-stage timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    #[serde(default = "default_install_timeout")]
    pub install: u64,

    #[serde(default = "default_build_timeout")]
    pub build: u64,

    #[serde(default = "default_deploy_timeout")]
    pub deploy: u64,

    #[serde(default = "default_verify_timeout")]
    pub verify: u64,
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_install_timeout() -> u64 {
    600
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_deploy_timeout() -> u64 {
    120
}

fn default_verify_timeout() -> u64 {
    60
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            install: default_install_timeout(),
            build: default_build_timeout(),
            deploy: default_deploy_timeout(),
            verify: default_verify_timeout(),
        }
    }
}

/// Container status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySection {
    #[serde(default = "default_verify_attempts")]
    pub attempts: u32,

    #[serde(default = "default_verify_interval_ms")]
    pub interval_ms: u64,
}

fn default_verify_attempts() -> u32 {
    10
}

fn default_verify_interval_ms() -> u64 {
    1000
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            attempts: default_verify_attempts(),
            interval_ms: default_verify_interval_ms(),
        }
    }
}

/// Image and container settings
#[derive(Debug, Clone, Deserialize)]
pub struct DockerSection {
    /// Engine API endpoint for the local host
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,

    #[serde(alias = "imageName")]
    pub image_name: String,

    #[serde(alias = "containerName")]
    pub container_name: String,

    #[serde(default = "default_instances")]
    pub instances: u32,

    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default, alias = "restartPolicy")]
    pub restart_policy: Option<String>,

    /// Push the image after a successful build
    #[serde(default)]
    pub push: bool,

    /// Pull the image on each host before creating containers
    #[serde(default)]
    pub pull: bool,
}

fn default_instances() -> u32 {
    1
}

/// Image build inputs
#[derive(Debug, Clone, Deserialize)]
pub struct DockerfileSection {
    pub path: String,

    #[serde(alias = "buildContext")]
    pub build_context: String,
}

/// Dashboard settings
#[derive(Debug, Clone, Deserialize)]
pub struct NpmSection {
    pub dashboard_path: PathBuf,

    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

fn default_dashboard_port() -> u16 {
    3007
}

/// Side channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Port of the dashboard's control listener; `0` disables the outbound link
    #[serde(default = "default_dashboard_control_port")]
    pub dashboard_port: u16,

    /// Number of events buffered per consumer before the oldest are dropped
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    3010
}

fn default_dashboard_control_port() -> u16 {
    3011
}

fn default_buffer() -> usize {
    256
}

impl Default for NotifierSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: default_listen_port(),
            dashboard_port: default_dashboard_control_port(),
            buffer: default_buffer(),
        }
    }
}
