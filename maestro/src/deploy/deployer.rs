//! Container replacement on one host

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ImageSpec, VerifyPolicy};
use crate::deploy::builder::BuildArtifact;
use crate::deploy::runtime::{ContainerRequest, ContainerRuntime, StopOutcome};
use crate::errors::{DeployError, DeployStage, RuntimeError};

/// Container deployer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Status polling after start
    pub verify: VerifyPolicy,

    /// Upper bound for each runtime call
    pub deploy_timeout: Duration,

    /// Upper bound for the whole verification phase
    pub verify_timeout: Duration,

    /// Pull the image before creating containers
    pub pull: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verify: VerifyPolicy::default(),
            deploy_timeout: Duration::from_secs(120),
            verify_timeout: Duration::from_secs(60),
            pull: false,
        }
    }
}

/// Containers left running by a successful deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployed {
    /// Instance containers, verified running
    pub containers: Vec<String>,

    /// Surplus instances removed after scaling down
    pub removed: Vec<String>,
}

/// Replaces the containers of an image spec on one host
#[derive(Debug, Clone, Default)]
pub struct ContainerDeployer {
    options: Options,
}

impl ContainerDeployer {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub async fn deploy(
        &self,
        runtime: &dyn ContainerRuntime,
        spec: &ImageSpec,
        artifact: &BuildArtifact,
    ) -> Result<Deployed, DeployError> {
        if self.options.pull {
            info!("Pulling {}", artifact.image_name);
            self.call(DeployStage::Pull, runtime.pull(&artifact.image_name))
                .await?;
        }

        let mut deployed = Deployed::default();
        for name in spec.instance_names() {
            self.replace(runtime, spec, artifact, &name).await?;
            self.verify(runtime, &name).await?;
            deployed.containers.push(name);
        }

        deployed.removed = self.remove_surplus(runtime, spec).await?;
        Ok(deployed)
    }

    async fn replace(
        &self,
        runtime: &dyn ContainerRuntime,
        spec: &ImageSpec,
        artifact: &BuildArtifact,
        name: &str,
    ) -> Result<(), DeployError> {
        let existing = self.call(DeployStage::Inspect, runtime.status(name)).await?;
        if let Some(status) = existing {
            info!("Replacing existing container {} ({})", name, status);
            self.stop_and_remove(runtime, name).await?;
        }

        let request = ContainerRequest {
            name: name.to_string(),
            image: artifact.image_name.clone(),
            ports: spec
                .instance_index(name)
                .map_or_else(|| spec.ports.clone(), |index| spec.instance_ports(index)),
            restart_policy: spec.restart_policy.clone(),
        };
        self.call(DeployStage::Create, runtime.create(&request)).await?;
        debug!("Created container {}", name);

        // A failed start leaves the created container in place
        self.call(DeployStage::Start, runtime.start(name)).await?;
        info!("Started container {}", name);
        Ok(())
    }

    async fn stop_and_remove(&self, runtime: &dyn ContainerRuntime, name: &str) -> Result<(), DeployError> {
        // Stopping is best effort; removal is what must succeed
        match tokio::time::timeout(self.options.deploy_timeout, runtime.stop(name)).await {
            Ok(Ok(StopOutcome::Stopped)) => debug!("Stopped container {}", name),
            Ok(Ok(StopOutcome::AlreadyStopped)) => debug!("Container {} was not running", name),
            Ok(Err(e)) => warn!("Failed to stop container {}: {}", name, e),
            Err(_) => warn!("Stopping container {} timed out", name),
        }
        self.call(DeployStage::Remove, runtime.remove(name)).await
    }

    async fn verify(&self, runtime: &dyn ContainerRuntime, name: &str) -> Result<(), DeployError> {
        let policy = self.options.verify;
        let deadline = Instant::now() + self.options.verify_timeout;
        let mut last_status: Option<String> = None;

        for attempt in 1..=policy.attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeployError::verify(
                    format!("{} not running within {:?}", name, self.options.verify_timeout),
                    last_status,
                ));
            }

            match tokio::time::timeout(remaining, runtime.status(name)).await {
                Ok(Ok(Some(status))) if status == "running" => {
                    debug!("Container {} running after {} attempt(s)", name, attempt);
                    return Ok(());
                }
                Ok(Ok(status)) => last_status = status.or_else(|| Some("missing".to_string())),
                Ok(Err(e)) => debug!("Status check for {} failed: {}", name, e),
                Err(_) => {
                    return Err(DeployError::verify(
                        format!("{} not running within {:?}", name, self.options.verify_timeout),
                        last_status,
                    ))
                }
            }

            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
            }
        }

        Err(DeployError::verify(
            format!("{} not running after {} attempts", name, policy.attempts),
            last_status,
        ))
    }

    async fn remove_surplus(&self, runtime: &dyn ContainerRuntime, spec: &ImageSpec) -> Result<Vec<String>, DeployError> {
        let names = self
            .call(DeployStage::Scale, runtime.list(&spec.container_name))
            .await?;

        let mut removed = Vec::new();
        for name in names {
            let surplus = spec
                .instance_index(&name)
                .is_some_and(|index| index >= spec.instances);
            if !surplus {
                continue;
            }
            info!("Removing surplus instance {}", name);
            let _ = tokio::time::timeout(self.options.deploy_timeout, runtime.stop(&name)).await;
            self.call(DeployStage::Scale, runtime.remove(&name)).await?;
            removed.push(name);
        }
        Ok(removed)
    }

    async fn call<T>(
        &self,
        stage: DeployStage,
        operation: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, DeployError> {
        match tokio::time::timeout(self.options.deploy_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DeployError::new(stage, e.0)),
            Err(_) => Err(DeployError::new(
                stage,
                format!("timed out after {:?}", self.options.deploy_timeout),
            )),
        }
    }
}
