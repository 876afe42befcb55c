//! Container runtime over the Docker Engine HTTP API

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::deploy::runtime::{ContainerRequest, ContainerRuntime, StopOutcome};
use crate::errors::RuntimeError;

/// Engine API client bound to one daemon
#[derive(Debug, Clone)]
pub struct EngineApiRuntime {
    base_url: Url,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = "Names", default)]
    names: Vec<String>,
}

impl EngineApiRuntime {
    pub fn new(mut base_url: Url, request_timeout: Duration) -> Result<Self, RuntimeError> {
        // Keep a versioned prefix such as `/v1.43` when joining paths
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RuntimeError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> Result<Url, RuntimeError> {
        self.base_url
            .join(path)
            .map_err(|e| RuntimeError(format!("invalid engine path {}: {}", path, e)))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Response, RuntimeError> {
        let url = self.url(path)?;
        debug!("{} {}", method, url);
        let mut request = self.client.request(method, url).query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|e| RuntimeError(format!("engine request failed: {}", e)))
    }
}

async fn unexpected(what: &str, response: Response) -> RuntimeError {
    let status = response.status();
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or_default();
    RuntimeError(format!("{} returned HTTP {}: {}", what, status.as_u16(), message))
}

/// First `error` reported in a `POST /images/create` progress stream
fn pull_error(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|progress| progress.get("error").and_then(Value::as_str).map(String::from))
}

/// Engine API body for `POST /containers/create`
pub fn create_body(request: &ContainerRequest) -> Value {
    let mut exposed = serde_json::Map::new();
    let mut bindings: HashMap<String, Vec<Value>> = HashMap::new();
    for mapping in &request.ports {
        let (ports, proto) = mapping.split_once('/').unwrap_or((mapping, "tcp"));
        if let Some((host, container)) = ports.split_once(':') {
            let key = format!("{}/{}", container, proto);
            exposed.insert(key.clone(), json!({}));
            bindings
                .entry(key)
                .or_default()
                .push(json!({ "HostPort": host }));
        }
    }

    let mut host_config = json!({ "PortBindings": bindings });
    if let Some(policy) = &request.restart_policy {
        host_config["RestartPolicy"] = json!({ "Name": policy });
    }

    json!({
        "Image": request.image,
        "ExposedPorts": exposed,
        "HostConfig": host_config,
    })
}

#[async_trait]
impl ContainerRuntime for EngineApiRuntime {
    async fn status(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let response = self
            .send(Method::GET, &format!("containers/{}/json", name), &[], None)
            .await?;
        match response.status() {
            StatusCode::OK => {
                let inspect: InspectResponse = response
                    .json()
                    .await
                    .map_err(|e| RuntimeError(format!("invalid inspect response: {}", e)))?;
                Ok(Some(inspect.state.status))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(unexpected("inspect", response).await),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let (repo, tag) = match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (image, "latest"),
        };
        let response = self
            .send(Method::POST, "images/create", &[("fromImage", repo), ("tag", tag)], None)
            .await?;
        if !response.status().is_success() {
            return Err(unexpected("pull", response).await);
        }

        // The pull streams progress lines; a failure arrives as one of them
        let body = response
            .text()
            .await
            .map_err(|e| RuntimeError(format!("pull of {} interrupted: {}", image, e)))?;
        match pull_error(&body) {
            Some(message) => Err(RuntimeError(format!("pull of {} failed: {}", image, message))),
            None => Ok(()),
        }
    }

    async fn stop(&self, name: &str) -> Result<StopOutcome, RuntimeError> {
        let response = self
            .send(Method::POST, &format!("containers/{}/stop", name), &[], None)
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(StopOutcome::Stopped),
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(StopOutcome::AlreadyStopped),
            _ => Err(unexpected("stop", response).await),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let response = self
            .send(Method::DELETE, &format!("containers/{}", name), &[], None)
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(unexpected("remove", response).await),
        }
    }

    async fn create(&self, request: &ContainerRequest) -> Result<(), RuntimeError> {
        let response = self
            .send(
                Method::POST,
                "containers/create",
                &[("name", request.name.as_str())],
                Some(create_body(request)),
            )
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            _ => Err(unexpected("create", response).await),
        }
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let response = self
            .send(Method::POST, &format!("containers/{}/start", name), &[], None)
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            _ => Err(unexpected("start", response).await),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let filters = json!({ "name": [format!("^/?{}", prefix)] }).to_string();
        let response = self
            .send(
                Method::GET,
                "containers/json",
                &[("all", "true"), ("filters", filters.as_str())],
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(unexpected("list", response).await);
        }
        let entries: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|e| RuntimeError(format!("invalid list response: {}", e)))?;
        Ok(entries
            .into_iter()
            .flat_map(|entry| entry.names)
            .map(|name| name.trim_start_matches('/').to_string())
            .filter(|name| name.starts_with(prefix))
            .collect())
    }
}
