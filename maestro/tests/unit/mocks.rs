//! Test doubles for hosts, connections and image builds

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use maestro::config::{AuthMethod, HostDescriptor, ImageSpec};
use maestro::deploy::builder::{BuildArtifact, ImageBuilder};
use maestro::deploy::connector::{CommandOutput, Connection, Connector};
use maestro::errors::{BuildError, ConnectionError};

pub fn host(address: &str) -> Arc<HostDescriptor> {
    Arc::new(HostDescriptor::new(
        address,
        "ops",
        AuthMethod::Password(SecretString::from("s3cret".to_string())),
    ))
}

pub fn spec() -> Arc<ImageSpec> {
    Arc::new(ImageSpec::new("horizon-server:latest", "horizon"))
}

#[derive(Debug)]
struct HostState {
    docker_installed: bool,
    installs: usize,
    containers: BTreeMap<String, String>,
    commands: Vec<String>,
    start_status: String,
    fail_start: bool,
    fail_create: bool,
    fail_remove: bool,
    install_failure: Option<(i32, String)>,
    install_is_noop: bool,
    group_failure: bool,
    exec_delay: Duration,
}

/// A simulated machine answering the shell commands the pipeline sends
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                docker_installed: true,
                installs: 0,
                containers: BTreeMap::new(),
                commands: Vec::new(),
                start_status: "running".to_string(),
                fail_start: false,
                fail_create: false,
                fail_remove: false,
                install_failure: None,
                install_is_noop: false,
                group_failure: false,
                exec_delay: Duration::ZERO,
            }),
        }
    }

    pub fn without_docker(self) -> Self {
        self.state.lock().unwrap().docker_installed = false;
        self
    }

    pub fn with_container(self, name: &str, status: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string(), status.to_string());
        self
    }

    /// Status containers report after `docker start`
    pub fn with_start_status(self, status: &str) -> Self {
        self.state.lock().unwrap().start_status = status.to_string();
        self
    }

    pub fn with_failing_start(self) -> Self {
        self.state.lock().unwrap().fail_start = true;
        self
    }

    pub fn with_failing_create(self) -> Self {
        self.state.lock().unwrap().fail_create = true;
        self
    }

    pub fn with_failing_remove(self) -> Self {
        self.state.lock().unwrap().fail_remove = true;
        self
    }

    /// The install script exits with `code`
    pub fn with_failing_install(self, code: i32, stderr: &str) -> Self {
        self.state.lock().unwrap().install_failure = Some((code, stderr.to_string()));
        self
    }

    /// The install script succeeds without installing anything
    pub fn with_noop_install(self) -> Self {
        self.state.lock().unwrap().install_is_noop = true;
        self
    }

    /// Adding the user to the docker group is refused
    pub fn with_failing_group_add(self) -> Self {
        self.state.lock().unwrap().group_failure = true;
        self
    }

    /// Delay applied to every command
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().exec_delay = delay;
        self
    }

    pub fn installs(&self) -> usize {
        self.state.lock().unwrap().installs
    }

    pub fn docker_installed(&self) -> bool {
        self.state.lock().unwrap().docker_installed
    }

    pub fn container(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Docker subcommands issued, e.g. `["inspect", "stop", "rm", ...]`
    pub fn docker_verbs(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| {
                let words = split_shell(c);
                let words: Vec<&str> = words
                    .iter()
                    .map(String::as_str)
                    .skip_while(|w| *w == "sudo" || *w == "-n")
                    .collect();
                match words.as_slice() {
                    ["docker", verb, ..] if !verb.starts_with('-') && *verb != "info" => Some(verb.to_string()),
                    _ => None,
                }
            })
            .collect()
    }

    fn exec(&self, command: &str) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        let words = split_shell(command);
        let mut words: Vec<&str> = words.iter().map(String::as_str).collect();
        if words.first() == Some(&"sudo") {
            words.retain(|w| *w != "sudo" && *w != "-n");
        }

        if command.starts_with("if ") && command.contains("maestro-get-docker.sh") {
            if let Some((code, stderr)) = state.install_failure.clone() {
                return fail(code, &stderr);
            }
            state.installs += 1;
            if !state.install_is_noop {
                state.docker_installed = true;
            }
            return ok("");
        }
        if command.contains("usermod") {
            if state.group_failure {
                return fail(1, "sudo: a password is required");
            }
            return ok("");
        }

        match words.as_slice() {
            ["uname", "-s"] => ok("Linux\n"),
            ["curl", ..] => ok(""),
            ["docker", "--version"] if state.docker_installed => ok("Docker version 27.3.1, build ce12230\n"),
            ["docker", ..] if !state.docker_installed => fail(127, "sh: 1: docker: not found"),
            ["docker", "info", ..] => ok("27.3.1\n"),
            ["docker", "inspect", .., name] => match state.containers.get(*name) {
                Some(status) => ok(&format!("{}\n", status)),
                None => fail(1, &format!("Error response from daemon: No such container: {}", name)),
            },
            ["docker", "pull", ..] => ok(""),
            ["docker", "stop", name] => match state.containers.get_mut(*name) {
                Some(status) => {
                    *status = "exited".to_string();
                    ok(&format!("{}\n", name))
                }
                None => fail(1, &format!("Error response from daemon: No such container: {}", name)),
            },
            ["docker", "rm", name] if state.fail_remove && state.containers.contains_key(*name) => fail(
                1,
                &format!("Error response from daemon: cannot remove container \"/{}\": device or resource busy", name),
            ),
            ["docker", "rm", name] => match state.containers.remove(*name) {
                Some(_) => ok(&format!("{}\n", name)),
                None => fail(1, &format!("Error response from daemon: No such container: {}", name)),
            },
            ["docker", "create", ..] if state.fail_create => fail(
                125,
                "Unable to find image 'horizon-server:latest' locally\nError response from daemon: pull access denied",
            ),
            ["docker", "create", "--name", name, ..] => {
                if state.containers.contains_key(*name) {
                    return fail(
                        125,
                        &format!("Conflict. The container name \"/{}\" is already in use", name),
                    );
                }
                state.containers.insert(name.to_string(), "created".to_string());
                ok("4f1c2a9e\n")
            }
            ["docker", "start", name] => {
                if state.fail_start {
                    return fail(1, "driver failed programming external connectivity");
                }
                let start_status = state.start_status.clone();
                match state.containers.get_mut(*name) {
                    Some(status) => {
                        *status = start_status;
                        ok(&format!("{}\n", name))
                    }
                    None => fail(1, &format!("Error response from daemon: No such container: {}", name)),
                }
            }
            ["docker", "ps", "-a", "--filter", filter, ..] => {
                let prefix = filter.trim_start_matches("name=^/?");
                let names: Vec<&str> = state
                    .containers
                    .keys()
                    .filter(|n| n.starts_with(prefix))
                    .map(String::as_str)
                    .collect();
                ok(&names.join("\n"))
            }
            _ => fail(127, &format!("sh: unexpected command: {}", command)),
        }
    }

    fn exec_delay(&self) -> Duration {
        self.state.lock().unwrap().exec_delay
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Split a POSIX shell command line built with single-quote escaping
pub fn split_shell(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Connection into a [`FakeHost`]
pub struct FakeConnection {
    address: String,
    host: Arc<FakeHost>,
    local: bool,
    open: Arc<AtomicUsize>,
}

impl FakeConnection {
    pub fn new(address: &str, host: Arc<FakeHost>) -> Self {
        Self {
            address: address.to_string(),
            host,
            local: false,
            open: Arc::new(AtomicUsize::new(1)),
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        let delay = self.host.exec_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.host.exec(command))
    }

    async fn close(&mut self) {}
}

/// How a host answers a connection attempt
#[derive(Clone)]
pub enum Behavior {
    Accept(Arc<FakeHost>),
    RejectCredentials,
    Refuse,
    Hang,
}

/// Connector over a table of fake hosts
#[derive(Default)]
pub struct FakeConnector {
    hosts: HashMap<String, Behavior>,
    open: Arc<AtomicUsize>,
    attempts: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, behavior: Behavior) -> Self {
        self.hosts.insert(address.to_string(), behavior);
        self
    }

    /// Connections handed out and not yet dropped
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: &HostDescriptor) -> Result<Box<dyn Connection>, ConnectionError> {
        self.attempts.lock().unwrap().push(host.address.clone());
        match self.hosts.get(&host.address).cloned() {
            Some(Behavior::Accept(fake)) => {
                self.open.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeConnection {
                    address: host.address.clone(),
                    host: fake,
                    local: false,
                    open: self.open.clone(),
                }))
            }
            Some(Behavior::RejectCredentials) => Err(ConnectionError::Authentication {
                address: host.address.clone(),
                reason: format!("{}@{}: Permission denied (publickey,password).", host.username, host.address),
            }),
            Some(Behavior::Refuse) | None => Err(ConnectionError::Unreachable {
                address: host.address.clone(),
                reason: "Connection refused".to_string(),
            }),
            Some(Behavior::Hang) => std::future::pending().await,
        }
    }
}

/// Image builder that counts invocations
pub struct CountingBuilder {
    calls: AtomicUsize,
    delay: Duration,
    failure: Option<String>,
}

impl CountingBuilder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            failure: None,
        }
    }

    pub fn failing(log: &str) -> Self {
        Self {
            failure: Some(log.to_string()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for CountingBuilder {
    async fn build(&self, spec: &ImageSpec) -> Result<BuildArtifact, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(log) => Err(BuildError::new(log.clone())),
            None => Ok(BuildArtifact::existing(spec.image_name.clone())),
        }
    }
}

/// Image builder that panics
pub struct PanickingBuilder;

#[async_trait]
impl ImageBuilder for PanickingBuilder {
    async fn build(&self, _spec: &ImageSpec) -> Result<BuildArtifact, BuildError> {
        panic!("builder exploded");
    }
}
