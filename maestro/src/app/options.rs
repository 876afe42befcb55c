//! Application configuration options

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::config::{FleetConfig, DEFAULT_CONFIG_PATH};
use crate::dashboard;
use crate::deploy::ssh::SshOptions;
use crate::errors::MaestroError;
use crate::notifier::link;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Validated fleet configuration
    pub fleet: FleetConfig,

    /// Exit after the first run instead of serving control messages
    pub once: bool,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Side channel configuration
    pub notifier: NotifierOptions,

    /// Dashboard process, when an `[npm]` section is present
    pub dashboard: Option<dashboard::Options>,

    /// OpenSSH client options
    pub ssh: SshOptions,
}

impl AppOptions {
    pub fn new(fleet: FleetConfig, once: bool) -> Result<Self, MaestroError> {
        let notifier = NotifierOptions::from_config(&fleet)?;
        let dashboard = fleet.dashboard.as_ref().map(dashboard::Options::from);
        let ssh = SshOptions {
            connect_timeout: fleet.timeouts.connect,
            ..SshOptions::default()
        };
        Ok(Self {
            fleet,
            once,
            lifecycle: LifecycleOptions::default(),
            notifier,
            dashboard,
            ssh,
        })
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Side channel options
#[derive(Debug, Clone)]
pub struct NotifierOptions {
    pub enabled: bool,

    /// Listener for dashboard clients
    pub listen_addr: SocketAddr,

    /// Outbound link to the dashboard, if enabled
    pub dashboard_link: Option<link::Options>,

    /// Events buffered per consumer
    pub buffer: usize,
}

impl NotifierOptions {
    pub fn from_config(fleet: &FleetConfig) -> Result<Self, MaestroError> {
        let section = &fleet.notifier;
        let dashboard_link = match section.dashboard_port {
            0 => None,
            port => Some(link::Options::for_port(port)?),
        };
        Ok(Self {
            enabled: section.enabled,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, section.listen_port)),
            dashboard_link,
            buffer: section.buffer,
        })
    }
}

/// Options that take a value, as `--key=value` or `--key value`
const VALUE_OPTIONS: [&str; 2] = ["config", "log-level"];

/// Parsed command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    options: HashMap<String, String>,
    positional: Vec<String>,
}

impl CliArgs {
    /// Parse arguments, excluding the program name
    pub fn parse<I>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let Some(flag) = arg.strip_prefix("--") else {
                parsed.positional.push(arg);
                continue;
            };
            if let Some((key, value)) = flag.split_once('=') {
                parsed.options.insert(key.to_string(), value.to_string());
            } else if VALUE_OPTIONS.contains(&flag) {
                let value = args.next().ok_or_else(|| format!("--{} requires a value", flag))?;
                parsed.options.insert(flag.to_string(), value);
            } else {
                // Standalone flags like --version
                parsed.options.insert(flag.to_string(), "true".to_string());
            }
        }
        Ok(parsed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// `--config`, else the first positional argument, else the default path
    pub fn config_path(&self) -> &str {
        self.get("config")
            .or_else(|| self.positional.first().map(String::as_str))
            .unwrap_or(DEFAULT_CONFIG_PATH)
    }
}
