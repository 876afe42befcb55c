//! Image build and the per-run single-flight guard

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ImageSpec;
use crate::errors::BuildError;
use crate::utils::tail_lines;

/// Reference to an image ready for deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub image_name: String,
    /// Image id reported by the build, if one ran
    pub image_id: Option<String>,
    pub pushed: bool,
}

impl BuildArtifact {
    /// Artifact for an image that already exists
    pub fn existing(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            image_id: None,
            pushed: false,
        }
    }
}

/// Produces the image for a spec
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, spec: &ImageSpec) -> Result<BuildArtifact, BuildError>;
}

/// Builds with the local docker CLI
#[derive(Debug, Clone)]
pub struct DockerImageBuilder {
    program: String,
    push: bool,
}

impl DockerImageBuilder {
    pub fn new(push: bool) -> Self {
        Self {
            program: "docker".to_string(),
            push,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, BuildError> {
        debug!("$ {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError::new(format!("failed to run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            let log = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return Err(BuildError::new(format!(
                "`{} {}` exited with {}: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                output.status,
                tail_lines(log, 20)
            )));
        }
        Ok(stdout.trim().to_string())
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(&self, spec: &ImageSpec) -> Result<BuildArtifact, BuildError> {
        info!(
            "Building image {} from {} (context {})",
            spec.image_name, spec.dockerfile_path, spec.build_context
        );
        let image_id = self
            .run(&[
                "build",
                "--quiet",
                "-t",
                spec.image_name.as_str(),
                "-f",
                spec.dockerfile_path.as_str(),
                spec.build_context.as_str(),
            ])
            .await?;

        if self.push {
            info!("Pushing image {}", spec.image_name);
            self.run(&["push", "--quiet", spec.image_name.as_str()]).await?;
        }

        info!("Image {} built ({})", spec.image_name, image_id);
        Ok(BuildArtifact {
            image_name: spec.image_name.clone(),
            image_id: (!image_id.is_empty()).then_some(image_id),
            pushed: self.push,
        })
    }
}

/// Reuses an image that is assumed to exist already
#[derive(Debug, Clone, Default)]
pub struct SkipBuild;

#[async_trait]
impl ImageBuilder for SkipBuild {
    async fn build(&self, spec: &ImageSpec) -> Result<BuildArtifact, BuildError> {
        info!("Skipping build, deploying existing image {}", spec.image_name);
        Ok(BuildArtifact::existing(spec.image_name.clone()))
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<BuildArtifact, BuildError>>>;

/// Coalesces concurrent builds of the same image into one
///
/// The first request for an image name starts the build; every later request
/// in the same run awaits that in-flight future and shares its result,
/// success or failure.
pub struct SingleFlightBuilder {
    inner: Arc<dyn ImageBuilder>,
    timeout: Duration,
    in_flight: Mutex<HashMap<String, SharedBuild>>,
    started: AtomicUsize,
}

impl SingleFlightBuilder {
    pub fn new(inner: Arc<dyn ImageBuilder>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
        }
    }

    pub async fn build(&self, spec: &ImageSpec) -> Result<BuildArtifact, BuildError> {
        let build = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight
                .entry(spec.image_name.clone())
                .or_insert_with(|| self.start(spec))
                .clone()
        };
        build.await
    }

    /// Number of builds actually started
    pub fn builds_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn start(&self, spec: &ImageSpec) -> SharedBuild {
        self.started.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let spec = spec.clone();
        let timeout = self.timeout;
        async move {
            match tokio::time::timeout(timeout, inner.build(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(BuildError::new(format!(
                    "build of {} did not finish within {:?}",
                    spec.image_name, timeout
                ))),
            }
        }
        .boxed()
        .shared()
    }
}
