//! Deployment coordinator
//!
//! Fans the fleet out into one pipeline task per host:
//! connect, ensure runtime, shared build, deploy. Pipelines report their
//! stage events over a channel and the coordinator, which owns every target
//! state machine, applies them and notifies the progress callback. One
//! host's failure never holds up another.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{HostDescriptor, ImageSpec, StageTimeouts, VerifyPolicy};
use crate::deploy::builder::{ImageBuilder, SingleFlightBuilder};
use crate::deploy::connector::{Connection, Connector};
use crate::deploy::deployer::{self, ContainerDeployer, Deployed};
use crate::deploy::engine::EngineApiRuntime;
use crate::deploy::fsm::{TargetEvent, TargetFsm, TargetState, TargetStateKind};
use crate::deploy::installer::PrerequisiteInstaller;
use crate::deploy::runtime::CliRuntime;
use crate::deploy::summary::{DeploymentSummary, SummaryEntry};
use crate::errors::{ConnectionError, DeployError, DeployStage, FailureReason, InstallError};
use crate::utils::generate_uuid;

/// State change of one target, as reported to the progress callback
#[derive(Debug, Clone)]
pub struct TargetUpdate {
    pub run_id: String,
    pub address: String,
    pub state: TargetStateKind,
    pub failure: Option<FailureReason>,
}

/// Progress callback, invoked once per state transition
pub type ProgressFn = Arc<dyn Fn(&TargetUpdate) + Send + Sync>;

/// Progress callback that ignores every update
pub fn no_progress() -> ProgressFn {
    Arc::new(|_: &TargetUpdate| {})
}

/// Runs the fleet pipelines and aggregates their outcome
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    builder: Arc<dyn ImageBuilder>,
    installer: PrerequisiteInstaller,
    timeouts: StageTimeouts,
    verify: VerifyPolicy,
    pull: bool,
    docker_base_url: Option<Url>,
}

impl Coordinator {
    pub fn new(connector: Arc<dyn Connector>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            connector,
            builder,
            installer: PrerequisiteInstaller::default(),
            timeouts: StageTimeouts::default(),
            verify: VerifyPolicy::default(),
            pull: false,
            docker_base_url: None,
        }
    }

    pub fn with_installer(mut self, installer: PrerequisiteInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_verify(mut self, verify: VerifyPolicy) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    /// Engine API endpoint for the local host
    pub fn with_docker_base_url(mut self, url: Option<Url>) -> Self {
        self.docker_base_url = url;
        self
    }

    /// Deploy `spec` to every host and wait for all of them to finish
    pub async fn run(
        &self,
        hosts: &[Arc<HostDescriptor>],
        spec: &Arc<ImageSpec>,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> DeploymentSummary {
        let run_id = generate_uuid();
        let started_at = Utc::now();
        info!(
            "Starting deployment run {} of {} to {} host(s)",
            run_id,
            spec.image_name,
            hosts.len()
        );

        let pipeline = Arc::new(Pipeline {
            connector: self.connector.clone(),
            builder: SingleFlightBuilder::new(self.builder.clone(), self.timeouts.build),
            installer: self.installer.clone(),
            deployer: ContainerDeployer::new(deployer::Options {
                verify: self.verify,
                deploy_timeout: self.timeouts.deploy,
                verify_timeout: self.timeouts.verify,
                pull: self.pull,
            }),
            timeouts: self.timeouts,
            docker_base_url: self.docker_base_url.clone(),
            spec: spec.clone(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TargetEvent)>();
        let mut handles = Vec::with_capacity(hosts.len());
        for (index, host) in hosts.iter().enumerate() {
            let pipeline = pipeline.clone();
            let host = host.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(FailureReason::Cancelled),
                    result = pipeline.run(&host, |event| { let _ = tx.send((index, event)); }) => result,
                };
                let terminal = match outcome {
                    Ok(_) => TargetEvent::Succeed,
                    Err(reason) => TargetEvent::Fail(reason),
                };
                let _ = tx.send((index, terminal));
            }));
        }
        drop(tx);

        let mut targets: Vec<TargetFsm> = hosts.iter().map(|_| TargetFsm::new()).collect();
        let apply = |targets: &mut Vec<TargetFsm>, index: usize, event: TargetEvent| {
            let address = &hosts[index].address;
            match targets[index].process(event) {
                Ok(state) => {
                    log_transition(address, state);
                    progress(&TargetUpdate {
                        run_id: run_id.clone(),
                        address: address.clone(),
                        state: state.kind(),
                        failure: state.failure().cloned(),
                    });
                }
                Err(e) => warn!("Ignoring event for {}: {}", address, e),
            }
        };

        while let Some((index, event)) = rx.recv().await {
            apply(&mut targets, index, event);
        }

        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Pipeline for {} aborted: {}", hosts[index].address, e);
                apply(
                    &mut targets,
                    index,
                    TargetEvent::Fail(FailureReason::Internal(format!("pipeline aborted: {}", e))),
                );
            }
        }

        // Anything still open here never got to report
        for index in 0..targets.len() {
            if !targets[index].state().is_terminal() {
                let reason = if cancel.is_cancelled() {
                    FailureReason::Cancelled
                } else {
                    FailureReason::Internal("pipeline ended without a result".to_string())
                };
                apply(&mut targets, index, TargetEvent::Fail(reason));
            }
        }

        let entries = hosts
            .iter()
            .zip(&targets)
            .map(|(host, fsm)| SummaryEntry {
                address: host.address.clone(),
                failure: fsm.state().failure().cloned(),
            })
            .collect();
        let summary = DeploymentSummary::new(run_id, started_at, entries);
        info!(
            "Deployment run {} finished: {} succeeded, {} failed",
            summary.run_id,
            summary.succeeded.len(),
            summary.failed.len()
        );
        summary
    }
}

fn log_transition(address: &str, state: &TargetState) {
    match state {
        TargetState::Failed(reason) => warn!("[{}] failed at {}: {}", address, reason.stage(), reason),
        TargetState::Succeeded => info!("[{}] deployment succeeded", address),
        other => debug!("[{}] {:?}", address, other.kind()),
    }
}

/// Everything a single host pipeline needs, shared by all hosts of a run
struct Pipeline {
    connector: Arc<dyn Connector>,
    builder: SingleFlightBuilder,
    installer: PrerequisiteInstaller,
    deployer: ContainerDeployer,
    timeouts: StageTimeouts,
    docker_base_url: Option<Url>,
    spec: Arc<ImageSpec>,
}

impl Pipeline {
    async fn run<F>(&self, host: &HostDescriptor, report: F) -> Result<Deployed, FailureReason>
    where
        F: Fn(TargetEvent) + Send + Sync,
    {
        report(TargetEvent::Connect);
        let mut conn = match tokio::time::timeout(self.timeouts.connect, self.connector.connect(host)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConnectionError::Unreachable {
                    address: host.address.clone(),
                    reason: format!("connect timed out after {:?}", self.timeouts.connect),
                }
                .into())
            }
        };

        let result = self.drive(host, conn.as_ref(), &report).await;
        conn.close().await;
        result
    }

    async fn drive<F>(&self, host: &HostDescriptor, conn: &dyn Connection, report: &F) -> Result<Deployed, FailureReason>
    where
        F: Fn(TargetEvent) + Send + Sync,
    {
        report(TargetEvent::Install);
        let ready = tokio::time::timeout(self.timeouts.install, self.installer.ensure_runtime(conn))
            .await
            .map_err(|_| {
                InstallError::new(
                    "timeout",
                    None,
                    format!("runtime not ready within {:?}", self.timeouts.install),
                )
            })??;
        debug!("[{}] runtime ready: {}", host.address, ready.version);

        report(TargetEvent::Build);
        let artifact = self.builder.build(&self.spec).await?;

        report(TargetEvent::Deploy);
        let engine_url = host.docker_url.clone().or_else(|| {
            conn.is_local()
                .then(|| self.docker_base_url.clone())
                .flatten()
        });
        let deployed = match engine_url {
            Some(url) => {
                debug!("[{}] using Engine API at {}", host.address, url);
                let runtime = EngineApiRuntime::new(url, self.timeouts.deploy)
                    .map_err(|e| DeployError::new(DeployStage::Inspect, e.0))?;
                self.deployer.deploy(&runtime, &self.spec, &artifact).await?
            }
            None => {
                let runtime = CliRuntime::detect(conn).await;
                self.deployer.deploy(&runtime, &self.spec, &artifact).await?
            }
        };

        info!(
            "[{}] running {}",
            host.address,
            deployed.containers.join(", ")
        );
        Ok(deployed)
    }
}
