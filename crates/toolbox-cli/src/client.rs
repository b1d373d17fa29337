//! Container engine client.
//!
//! Provides an HTTP client for the Docker-compatible engine API reachable via
//! a Unix socket.

use crate::engine::{
    ApiVersion, Engine, EngineError, EngineEvent, EventReceiver, HijackedStream, PendingWait,
    WaitCondition,
};
use crate::terminal::TerminalSize;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Default socket path for the container engine.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Environment variable naming the engine endpoint.
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";

/// Environment variable pinning the API version.
pub const ENV_API_VERSION: &str = "DOCKER_API_VERSION";

/// Engine client speaking the Docker-compatible API.
#[derive(Debug, Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
    version: ApiVersion,
}

impl EngineClient {
    /// Creates a client for a socket with a fixed API version.
    pub fn new(socket_path: impl AsRef<Path>, version: ApiVersion) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            version,
        }
    }

    /// Connects to the engine and negotiates the API version.
    ///
    /// `pinned` skips negotiation, like `DOCKER_API_VERSION` does for the
    /// docker CLI.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        pinned: Option<ApiVersion>,
    ) -> Result<Self, EngineError> {
        let mut client = Self::new(socket_path, ApiVersion::MAX_SUPPORTED);

        if let Some(version) = pinned {
            client.version = version;
            tracing::debug!("Using pinned API version {}", version);
            return Ok(client);
        }

        let info: VersionResponse = client.get("/version").await?;
        let remote: ApiVersion = info.api_version.parse()?;
        client.version = remote.min(ApiVersion::MAX_SUPPORTED);
        tracing::debug!(
            "Engine {} speaks API {}, using {}",
            info.version,
            remote,
            client.version
        );

        Ok(client)
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Builds a versioned endpoint path.
    fn versioned(&self, path: &str) -> String {
        format!("{}{}", self.version.path_prefix(), path)
    }

    /// Performs a GET request.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let body = self.request(Method::GET, path, None::<()>).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Performs a POST request with a JSON body.
    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: Option<B>,
    ) -> Result<T, EngineError> {
        let body = self.request(Method::POST, path, body).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Performs a POST request without expecting a response body.
    async fn post_empty(&self, path: &str) -> Result<(), EngineError> {
        self.request(Method::POST, path, None::<()>).await?;
        Ok(())
    }

    /// Performs an HTTP request and collects the response body.
    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
    ) -> Result<Bytes, EngineError> {
        let response = self.send(method, path, body, false).await?;
        let status = response.status();

        // Read response body
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        Ok(body)
    }

    /// Opens a connection and sends one request.
    ///
    /// With `upgrade` set the connection is driven with upgrade support and
    /// the request asks for a raw stream.
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
        upgrade: bool,
    ) -> Result<Response<Incoming>, EngineError> {
        // Connect to Unix socket
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| EngineError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;

        let io = TokioIo::new(stream);

        // Create HTTP connection
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Spawn connection handler
        tokio::spawn(async move {
            let result = if upgrade {
                conn.with_upgrades().await
            } else {
                conn.await
            };
            if let Err(e) = result {
                tracing::debug!("Engine connection closed: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://localhost{}", path))
            .header("Host", "localhost");

        if upgrade {
            builder = builder
                .header("Connection", "Upgrade")
                .header("Upgrade", "tcp");
        }

        let request = match body {
            Some(body) => {
                let body_bytes = serde_json::to_vec(&body)?;
                builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", body_bytes.len())
                    .body(Full::new(Bytes::from(body_bytes)))
            }
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| EngineError::Stream(format!("failed to build request: {e}")))?;

        Ok(sender.send_request(request).await?)
    }
}

#[async_trait]
impl Engine for EngineClient {
    fn api_version(&self) -> ApiVersion {
        self.version
    }

    async fn create_container(
        &self,
        name: &str,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError> {
        let path = self.versioned(&format!(
            "/containers/create?name={}",
            urlencoding::encode(name)
        ));
        self.post(&path, Some(request)).await
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let (repository, tag) = split_image_reference(image);
        let path = self.versioned(&format!(
            "/images/create?fromImage={}&tag={}",
            urlencoding::encode(repository),
            urlencoding::encode(tag)
        ));

        let response = self.send(Method::POST, &path, None::<()>, false).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(api_error(status, &body));
        }

        // Progress is drained, only failures matter.
        let mut failure = None;
        read_records(response, CancellationToken::new(), |record: PullProgress| {
            if let Some(error) = record.error {
                failure = Some(error);
                return false;
            }
            if let Some(status) = record.status {
                tracing::debug!("pull: {}", status);
            }
            true
        })
        .await?;

        match failure {
            Some(error) => Err(EngineError::Stream(error)),
            None => Ok(()),
        }
    }

    async fn attach(&self, id: &str) -> Result<HijackedStream, EngineError> {
        let path = self.versioned(&format!(
            "/containers/{}/attach?stream=1&stdin=1&stdout=1&stderr=1",
            id
        ));

        let mut response = self.send(Method::POST, &path, None::<()>, true).await?;
        let status = response.status();

        // Check for successful upgrade (101 Switching Protocols) or 200 OK
        if !status.is_success() && status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(api_error(status, &body));
        }

        let upgraded = hyper::upgrade::on(&mut response)
            .await
            .map_err(|e| EngineError::Upgrade(e.to_string()))?;

        Ok(Box::new(TokioIo::new(upgraded)))
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        let path = self.versioned(&format!("/containers/{}/start", id));
        self.post_empty(&path).await
    }

    async fn resize(&self, id: &str, size: TerminalSize) -> Result<(), EngineError> {
        let path = self.versioned(&format!(
            "/containers/{}/resize?h={}&w={}",
            id, size.rows, size.cols
        ));
        self.post_empty(&path).await
    }

    async fn wait(&self, id: &str, condition: WaitCondition) -> Result<PendingWait, EngineError> {
        let path = self.versioned(&format!(
            "/containers/{}/wait?condition={}",
            id,
            condition.as_str()
        ));

        // The engine sends headers once the wait is registered and the body
        // when the condition is met.
        let response = self.send(Method::POST, &path, None::<()>, false).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(api_error(status, &body));
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(read_json(response).await);
        });

        Ok(rx)
    }

    async fn events(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<EventReceiver, EngineError> {
        let filters = encode_filters(&[
            ("type", vec!["container".to_string()]),
            ("container", vec![id.to_string()]),
        ])?;
        let path = self.versioned(&format!("/events?filters={}", filters));

        let response = self.send(Method::GET, &path, None::<()>, false).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(api_error(status, &body));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let result = read_records(response, cancel, |event: EngineEvent| {
                // Stop once the subscriber is gone.
                tx.send(Ok(event)).is_ok()
            })
            .await;
            if let Err(e) = result {
                let _ = tx.send(Err(e));
            }
        });

        Ok(rx)
    }

    async fn remove(&self, id: &str, force: bool, volumes: bool) -> Result<(), EngineError> {
        let path = self.versioned(&format!(
            "/containers/{}?force={}&v={}",
            id, force, volumes
        ));
        self.request(Method::DELETE, &path, None::<()>).await?;
        Ok(())
    }

    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let labels = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let filters = encode_filters(&[("label", labels)])?;
        let path = self.versioned(&format!("/containers/json?all=1&filters={}", filters));
        self.get(&path).await
    }
}

// =============================================================================
// Engine API Types
// =============================================================================

/// Version endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    #[serde(default)]
    pub version: String,
    pub api_version: String,
}

/// Container summary from list containers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

/// Create container request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

/// Host configuration for container.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    pub auto_remove: bool,
}

/// Mount entry of a host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    #[serde(rename = "Type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl Mount {
    /// Creates a read-write bind mount.
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: "bind".to_string(),
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Create container response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerResponse {
    pub id: String,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Container wait response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerWaitResponse {
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub error: Option<WaitError>,
}

/// Error reported inside a wait response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitError {
    #[serde(default)]
    pub message: String,
}

/// One record of the image pull progress stream.
#[derive(Debug, Clone, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Engine error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Resolves the engine socket path.
///
/// Precedence: explicit path, then `DOCKER_HOST` when it names a Unix
/// socket, then [`DEFAULT_SOCKET_PATH`].
pub fn resolve_socket_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(host) = std::env::var(ENV_DOCKER_HOST) {
        match host.strip_prefix("unix://") {
            Some(path) => return PathBuf::from(path),
            None => tracing::warn!(
                "Ignoring {}={}: only unix:// endpoints are supported",
                ENV_DOCKER_HOST,
                host
            ),
        }
    }

    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Reads a pinned API version from the environment.
pub fn pinned_api_version() -> Result<Option<ApiVersion>, EngineError> {
    match std::env::var(ENV_API_VERSION) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value.parse()?)),
        _ => Ok(None),
    }
}

/// Formats a container ID (first 12 characters).
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 { &id[..12] } else { id }
}

/// Splits `repository[:tag]` into repository and tag (default `latest`).
///
/// A colon inside the registry host (`host:5000/image`) is not a tag
/// separator.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        // Digest references are pulled as-is.
        return (image, "");
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Reads a streaming response as newline-delimited JSON records.
///
/// Each decoded record is passed to `on_record`; returning `false` stops
/// the stream. The stream also stops when `cancel` fires.
async fn read_records<T, F>(
    response: Response<Incoming>,
    cancel: CancellationToken,
    mut on_record: F,
) -> Result<(), EngineError>
where
    T: DeserializeOwned,
    F: FnMut(T) -> bool,
{
    let mut body = response.into_body();
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Engine stream cancelled");
                return Ok(());
            }

            frame = body.frame() => {
                let Some(frame) = frame else {
                    // Stream ended
                    return Ok(());
                };
                let frame = frame?;
                let Some(data) = frame.data_ref() else {
                    continue;
                };
                buffer.extend_from_slice(data);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    let record: T = serde_json::from_slice(line)?;
                    if !on_record(record) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Collects a successful response body and decodes it.
async fn read_json<T: DeserializeOwned>(response: Response<Incoming>) -> Result<T, EngineError> {
    let body = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

/// Builds the error for a non-success response.
fn api_error(status: StatusCode, body: &[u8]) -> EngineError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    EngineError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Serializes a filter map and encodes it for a query string.
fn encode_filters(filters: &[(&str, Vec<String>)]) -> Result<String, EngineError> {
    let map: HashMap<&str, &Vec<String>> = filters.iter().map(|(k, v)| (*k, v)).collect();
    let json = serde_json::to_string(&map)?;
    Ok(urlencoding::encode(&json).into_owned())
}
