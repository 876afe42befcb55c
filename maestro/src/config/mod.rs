//! Fleet configuration
//!
//! The TOML document is deserialized into [`document::Document`] and then
//! validated into the immutable types the orchestrator works with.

pub mod document;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::errors::ConfigError;
use document::{AuthEntry, Document, HostEntry, LoggingSection, NotifierSection, NpmSection};

/// Default location of the configuration document
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// How the orchestrator authenticates against a remote host
pub enum AuthMethod {
    Password(SecretString),
    Key(PathBuf),
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::Key(_) => "key",
        }
    }
}

impl Clone for AuthMethod {
    fn clone(&self) -> Self {
        match self {
            AuthMethod::Password(secret) => {
                AuthMethod::Password(SecretString::from(secret.expose_secret().to_owned()))
            }
            AuthMethod::Key(path) => AuthMethod::Key(path.clone()),
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMethod::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// One deployment host
#[derive(Debug, Clone)]
pub struct HostDescriptor {
    pub address: String,
    pub username: String,
    pub auth_method: AuthMethod,
    pub ssh_port: u16,
    /// Engine API endpoint used instead of the docker CLI
    pub docker_url: Option<Url>,
}

impl HostDescriptor {
    pub fn new(address: impl Into<String>, username: impl Into<String>, auth_method: AuthMethod) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            auth_method,
            ssh_port: 22,
            docker_url: None,
        }
    }
}

/// Image to build and containers to run from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub image_name: String,
    pub container_name: String,
    pub dockerfile_path: String,
    pub build_context: String,
    pub instances: u32,
    pub ports: Vec<String>,
    pub restart_policy: Option<String>,
}

impl ImageSpec {
    pub fn new(image_name: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            container_name: container_name.into(),
            dockerfile_path: "Dockerfile".to_string(),
            build_context: ".".to_string(),
            instances: 1,
            ports: Vec::new(),
            restart_policy: None,
        }
    }

    /// Name of the container for instance `index`
    pub fn instance_name(&self, index: u32) -> String {
        if index == 0 {
            self.container_name.clone()
        } else {
            format!("{}-{}", self.container_name, index)
        }
    }

    /// Port mappings of instance `index`; host ports move up by the index
    pub fn instance_ports(&self, index: u32) -> Vec<String> {
        self.ports
            .iter()
            .map(|mapping| shift_host_port(mapping, index).unwrap_or_else(|| mapping.clone()))
            .collect()
    }

    /// Every instance up to `instances` gets its own host ports
    pub fn check_instance_ports(&self, instances: u32) -> Result<(), String> {
        if self.ports.is_empty() {
            return Ok(());
        }
        let mut taken = HashSet::new();
        for index in 0..instances.max(1) {
            for mapping in &self.ports {
                let shifted = shift_host_port(mapping, index)
                    .ok_or_else(|| format!("{mapping:?} has no valid host port for instance {index}"))?;
                let (ports, proto) = shifted.split_once('/').unwrap_or((shifted.as_str(), "tcp"));
                let host = ports.split_once(':').map_or(ports, |(host, _)| host);
                // Port 0 lets the runtime pick
                if host != "0" && !taken.insert((host.to_string(), proto.to_string())) {
                    return Err(format!(
                        "host port {host}/{proto} would be bound by more than one container with {instances} instance(s)"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn instance_names(&self) -> Vec<String> {
        (0..self.instances.max(1)).map(|i| self.instance_name(i)).collect()
    }

    /// Instance index encoded in `name`, if it is one of this spec's containers
    pub fn instance_index(&self, name: &str) -> Option<u32> {
        let name = name.trim_start_matches('/');
        if name == self.container_name {
            return Some(0);
        }
        name.strip_prefix(&self.container_name)?
            .strip_prefix('-')?
            .parse()
            .ok()
            .filter(|i| *i > 0)
    }
}

/// Independent per-stage timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub connect: Duration,
    pub install: Duration,
    pub build: Duration,
    pub deploy: Duration,
    pub verify: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        let raw = document::TimeoutsSection::default();
        Self::from(&raw)
    }
}

impl From<&document::TimeoutsSection> for StageTimeouts {
    fn from(raw: &document::TimeoutsSection) -> Self {
        Self {
            connect: Duration::from_secs(raw.connect),
            install: Duration::from_secs(raw.install),
            build: Duration::from_secs(raw.build),
            deploy: Duration::from_secs(raw.deploy),
            verify: Duration::from_secs(raw.verify),
        }
    }
}

/// Container status polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Validated fleet configuration
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub hosts: Vec<Arc<HostDescriptor>>,
    pub image: Arc<ImageSpec>,
    pub skip_build: bool,
    pub push: bool,
    pub pull: bool,
    pub docker_base_url: Option<Url>,
    pub timeouts: StageTimeouts,
    pub verify: VerifyPolicy,
    pub logging: LoggingSection,
    pub dashboard: Option<NpmSection>,
    pub notifier: NotifierSection,
}

impl FleetConfig {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a configuration document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let document: Document = toml::from_str(contents)?;
        Self::from_document(document)
    }

    pub fn from_document(document: Document) -> Result<Self, ConfigError> {
        if document.deployment.hosts.is_empty() {
            return Err(ConfigError::invalid("deployment.hosts", "at least one host is required"));
        }

        let mut seen = HashSet::new();
        let mut hosts = Vec::with_capacity(document.deployment.hosts.len());
        for entry in document.deployment.hosts {
            let host = host_from_entry(entry)?;
            if !seen.insert(host.address.to_lowercase()) {
                return Err(ConfigError::DuplicateHost(host.address));
            }
            hosts.push(Arc::new(host));
        }

        let docker = document.docker;
        require_non_empty("docker.image_name", &docker.image_name)?;
        validate_container_name(&docker.container_name)?;
        if docker.instances == 0 {
            return Err(ConfigError::invalid("docker.instances", "must be at least 1"));
        }
        for port in &docker.ports {
            validate_port_mapping(port)?;
        }
        let docker_base_url = docker
            .base_url
            .as_deref()
            .map(|url| parse_url("docker.base_url", url))
            .transpose()?;

        let skip_build = document.deployment.skip_build;
        let (dockerfile_path, build_context) = match document.dockerfile {
            Some(section) => {
                require_non_empty("dockerfile.path", &section.path)?;
                require_non_empty("dockerfile.build_context", &section.build_context)?;
                (section.path, section.build_context)
            }
            None if skip_build => ("Dockerfile".to_string(), ".".to_string()),
            None => {
                return Err(ConfigError::invalid(
                    "dockerfile",
                    "section is required unless deployment.skip_build = true",
                ))
            }
        };

        let verify = &document.deployment.verify;
        if verify.attempts == 0 {
            return Err(ConfigError::invalid("deployment.verify.attempts", "must be at least 1"));
        }

        let timeouts = StageTimeouts::from(&document.deployment.timeouts);
        for (field, value) in [
            ("deployment.timeouts.connect", timeouts.connect),
            ("deployment.timeouts.install", timeouts.install),
            ("deployment.timeouts.build", timeouts.build),
            ("deployment.timeouts.deploy", timeouts.deploy),
            ("deployment.timeouts.verify", timeouts.verify),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if document.notifier.buffer == 0 {
            return Err(ConfigError::invalid("notifier.buffer", "must be at least 1"));
        }

        let image = ImageSpec {
            image_name: docker.image_name,
            container_name: docker.container_name,
            dockerfile_path,
            build_context,
            instances: docker.instances,
            ports: docker.ports,
            restart_policy: docker.restart_policy,
        };
        image
            .check_instance_ports(image.instances)
            .map_err(|reason| ConfigError::invalid("docker.ports", reason))?;

        Ok(Self {
            hosts,
            image: Arc::new(image),
            skip_build,
            push: docker.push,
            pull: docker.pull,
            docker_base_url,
            timeouts,
            verify: VerifyPolicy {
                attempts: verify.attempts,
                interval: Duration::from_millis(verify.interval_ms),
            },
            logging: document.logging,
            dashboard: document.npm,
            notifier: document.notifier,
        })
    }

    /// Look up a configured host by address
    pub fn host(&self, address: &str) -> Option<&Arc<HostDescriptor>> {
        self.hosts
            .iter()
            .find(|host| host.address.eq_ignore_ascii_case(address))
    }
}

fn host_from_entry(entry: HostEntry) -> Result<HostDescriptor, ConfigError> {
    let address = entry.address.trim().to_string();
    require_non_empty("deployment.hosts.address", &address)?;
    require_non_empty(
        &format!("deployment.hosts[{address}].username"),
        &entry.username,
    )?;

    let auth_method = match entry.auth_method {
        AuthEntry::Password(secret) => {
            if secret.is_empty() {
                return Err(ConfigError::invalid(
                    format!("deployment.hosts[{address}].auth_method"),
                    "password must not be empty",
                ));
            }
            AuthMethod::Password(SecretString::from(secret))
        }
        AuthEntry::Key(path) => AuthMethod::Key(expand_home(path)),
    };

    let docker_url = entry
        .docker_url
        .as_deref()
        .map(|url| parse_url(&format!("deployment.hosts[{address}].docker_url"), url))
        .transpose()?;

    Ok(HostDescriptor {
        address,
        username: entry.username,
        auth_method,
        ssh_port: entry.ssh_port.unwrap_or(22),
        docker_url,
    })
}

fn expand_home(path: PathBuf) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or(path),
        Err(_) => path,
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn validate_container_name(name: &str) -> Result<(), ConfigError> {
    require_non_empty("docker.container_name", name)?;
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(ConfigError::invalid(
            "docker.container_name",
            format!("{name:?} must match [a-zA-Z0-9][a-zA-Z0-9_.-]*"),
        ));
    }
    Ok(())
}

fn validate_port_mapping(mapping: &str) -> Result<(), ConfigError> {
    let (ports, proto) = match mapping.split_once('/') {
        Some((ports, proto)) => (ports, Some(proto)),
        None => (mapping, None),
    };
    let valid_proto = matches!(proto, None | Some("tcp") | Some("udp") | Some("sctp"));
    let valid_ports = ports
        .split_once(':')
        .is_some_and(|(host, container)| host.parse::<u16>().is_ok() && container.parse::<u16>().is_ok());
    if !valid_proto || !valid_ports {
        return Err(ConfigError::invalid(
            "docker.ports",
            format!("{mapping:?} must look like HOST:CONTAINER[/tcp|udp]"),
        ));
    }
    Ok(())
}

fn shift_host_port(mapping: &str, index: u32) -> Option<String> {
    let (ports, proto) = match mapping.split_once('/') {
        Some((ports, proto)) => (ports, Some(proto)),
        None => (mapping, None),
    };
    let (host, container) = ports.split_once(':')?;
    let host: u16 = host.parse().ok()?;
    let shifted = if host == 0 {
        0
    } else {
        u32::from(host)
            .checked_add(index)
            .and_then(|port| u16::try_from(port).ok())?
    };
    Some(match proto {
        Some(proto) => format!("{shifted}:{container}/{proto}"),
        None => format!("{shifted}:{container}"),
    })
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::invalid(field, e.to_string()))
}
