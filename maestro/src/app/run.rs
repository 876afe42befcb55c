//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::config::{HostDescriptor, ImageSpec};
use crate::dashboard;
use crate::deploy::builder::{DockerImageBuilder, ImageBuilder, SkipBuild};
use crate::deploy::connector::{Connector, SystemConnector};
use crate::deploy::coordinator::{Coordinator, ProgressFn, TargetUpdate};
use crate::deploy::summary::DeploymentSummary;
use crate::errors::MaestroError;
use crate::notifier::bus::EventBus;
use crate::notifier::protocol::{ControlMessage, StatusEvent};
use crate::notifier::{link, server};

/// Run Maestro with the system connector and docker builder
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<DeploymentSummary, MaestroError> {
    let coordinator = build_coordinator(&options);
    run_with_coordinator(options, coordinator, shutdown_signal).await
}

/// Coordinator wired to the real connector and builder
pub fn build_coordinator(options: &AppOptions) -> Coordinator {
    let fleet = &options.fleet;
    let connector: Arc<dyn Connector> = Arc::new(SystemConnector::new(options.ssh.clone()));
    let builder: Arc<dyn ImageBuilder> = if fleet.skip_build {
        Arc::new(SkipBuild)
    } else {
        Arc::new(DockerImageBuilder::new(fleet.push))
    };
    Coordinator::new(connector, builder)
        .with_timeouts(fleet.timeouts)
        .with_verify(fleet.verify)
        .with_pull(fleet.pull)
        .with_docker_base_url(fleet.docker_base_url.clone())
}

/// Run the fleet with `coordinator`, then serve control messages unless `once`
///
/// Returns the latest deployment summary.
pub async fn run_with_coordinator(
    options: AppOptions,
    coordinator: Coordinator,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<DeploymentSummary, MaestroError> {
    info!("Initializing Maestro...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let bus = EventBus::new(options.notifier.buffer);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    if let Err(e) = init(&options, &bus, control_tx, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start Maestro: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    // A shutdown signal cancels the run in progress
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal.await;
        info!("Shutdown signal received, cancelling deployment...");
        signal_cancel.cancel();
    });

    let progress: ProgressFn = {
        let bus = bus.clone();
        Arc::new(move |update: &TargetUpdate| bus.publish(StatusEvent::from(update)))
    };

    let fleet = &options.fleet;
    let mut spec: Arc<ImageSpec> = fleet.image.clone();
    let mut summary = deploy(&coordinator, fleet.hosts.as_slice(), &spec, &progress, &bus, &cancel).await;

    if !options.once {
        info!("Waiting for control messages (Ctrl+C to exit)...");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = control_rx.recv() => message,
            };
            match message {
                Some(ControlMessage::RedeployHost { address }) => match fleet.host(&address) {
                    Some(host) => {
                        info!("Redeploying {}", host.address);
                        let hosts = [host.clone()];
                        let rerun = coordinator.run(&hosts, &spec, progress.clone(), cancel.clone()).await;
                        summary = summary.merge(&rerun);
                        report(&summary, &bus);
                    }
                    None => warn!("Redeploy requested for unknown host {}", address),
                },
                Some(ControlMessage::ScaleRequest { count }) if count >= 1 => {
                    if let Err(reason) = spec.check_instance_ports(count) {
                        warn!("Ignoring scale request to {} instances: {}", count, reason);
                        continue;
                    }
                    info!("Scaling {} from {} to {} instance(s)", spec.container_name, spec.instances, count);
                    spec = Arc::new(ImageSpec {
                        instances: count,
                        ..(*spec).clone()
                    });
                    summary = deploy(&coordinator, fleet.hosts.as_slice(), &spec, &progress, &bus, &cancel).await;
                }
                Some(ControlMessage::ScaleRequest { count }) => {
                    warn!("Ignoring scale request to {} instances", count);
                }
                Some(ControlMessage::Unknown) => {}
                None => {
                    // No side channel left; wait for the shutdown signal
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    Ok(summary)
}

async fn deploy(
    coordinator: &Coordinator,
    hosts: &[Arc<HostDescriptor>],
    spec: &Arc<ImageSpec>,
    progress: &ProgressFn,
    bus: &EventBus,
    cancel: &CancellationToken,
) -> DeploymentSummary {
    let summary = coordinator
        .run(hosts, spec, progress.clone(), cancel.clone())
        .await;
    report(&summary, bus);
    summary
}

fn report(summary: &DeploymentSummary, bus: &EventBus) {
    summary.print();
    bus.publish(StatusEvent::from(summary));
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    bus: &EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), MaestroError> {
    if options.notifier.enabled {
        init_notifier_server(
            options,
            bus.clone(),
            control_tx.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;

        if let Some(link_options) = options.notifier.dashboard_link.clone() {
            init_dashboard_link(
                link_options,
                bus.clone(),
                control_tx,
                shutdown_manager,
                shutdown_tx.subscribe(),
            )?;
        }
    }

    if let Some(dashboard_options) = options.dashboard.clone() {
        init_dashboard(dashboard_options, shutdown_manager, shutdown_tx.subscribe())?;
    }

    Ok(())
}

async fn init_notifier_server(
    options: &AppOptions,
    bus: EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MaestroError> {
    info!("Initializing notifier server...");

    // The side channel is optional; deployment goes ahead without it
    let listener = match server::bind(options.notifier.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Notifier disabled: {}", e);
            return Ok(());
        }
    };

    let server_handle = tokio::spawn(async move {
        server::serve(
            listener,
            bus,
            control_tx,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_notifier_server_handle(server_handle)?;
    Ok(())
}

fn init_dashboard_link(
    options: link::Options,
    bus: EventBus,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MaestroError> {
    info!("Initializing dashboard link...");

    let link_handle = tokio::spawn(async move {
        link::run(
            &options,
            bus,
            control_tx,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_dashboard_link_handle(link_handle)?;
    Ok(())
}

fn init_dashboard(
    options: dashboard::Options,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MaestroError> {
    info!("Initializing dashboard...");

    let dashboard_handle = tokio::spawn(async move {
        let result = dashboard::run(
            &options,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
        if let Err(e) = result {
            error!("Dashboard failed: {}", e);
        }
    });

    shutdown_manager.with_dashboard_handle(dashboard_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    notifier_server_handle: Option<JoinHandle<()>>,
    dashboard_link_handle: Option<JoinHandle<()>>,
    dashboard_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            notifier_server_handle: None,
            dashboard_link_handle: None,
            dashboard_handle: None,
        }
    }

    pub fn with_notifier_server_handle(&mut self, handle: JoinHandle<()>) -> Result<(), MaestroError> {
        if self.notifier_server_handle.is_some() {
            return Err(MaestroError::ShutdownError("notifier_server_handle already set".to_string()));
        }
        self.notifier_server_handle = Some(handle);
        Ok(())
    }

    pub fn with_dashboard_link_handle(&mut self, handle: JoinHandle<()>) -> Result<(), MaestroError> {
        if self.dashboard_link_handle.is_some() {
            return Err(MaestroError::ShutdownError("dashboard_link_handle already set".to_string()));
        }
        self.dashboard_link_handle = Some(handle);
        Ok(())
    }

    pub fn with_dashboard_handle(&mut self, handle: JoinHandle<()>) -> Result<(), MaestroError> {
        if self.dashboard_handle.is_some() {
            return Err(MaestroError::ShutdownError("dashboard_handle already set".to_string()));
        }
        self.dashboard_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), MaestroError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MaestroError::ShutdownError(format!(
                "shutdown timed out after {:?}",
                self.lifecycle_options.max_shutdown_delay
            ))),
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), MaestroError> {
        info!("Shutting down Maestro...");

        // 1. Dashboard link
        if let Some(handle) = self.dashboard_link_handle.take() {
            handle.await.map_err(|e| MaestroError::ShutdownError(e.to_string()))?;
        }

        // 2. Notifier server
        if let Some(handle) = self.notifier_server_handle.take() {
            handle.await.map_err(|e| MaestroError::ShutdownError(e.to_string()))?;
        }

        // 3. Dashboard process
        if let Some(handle) = self.dashboard_handle.take() {
            handle.await.map_err(|e| MaestroError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
