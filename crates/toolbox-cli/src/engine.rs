//! Container engine abstraction.
//!
//! The session talks to the engine only through the [`Engine`] trait so the
//! HTTP client in [`crate::client`] and in-memory test engines are
//! interchangeable.

use crate::client::{
    ContainerSummary, ContainerWaitResponse, CreateContainerRequest, CreateContainerResponse,
};
use crate::terminal::TerminalSize;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Exit code reported for generic engine or lifecycle failures.
pub const EXIT_ENGINE_FAILURE: i32 = 125;
/// Exit code reported when the container command cannot be invoked.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit code reported when the container command does not exist.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Shared engine trait object.
pub type DynEngine = Arc<dyn Engine>;

/// Bidirectional byte stream obtained by attaching to a container.
pub trait AttachIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AttachIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Hijacked attach stream (combined stdin/stdout/stderr in TTY mode).
pub type HijackedStream = Box<dyn AttachIo>;

/// Outcome of a registered wait, delivered once the condition is met.
pub type PendingWait = oneshot::Receiver<Result<ContainerWaitResponse, EngineError>>;

/// Receiver side of a container event subscription.
pub type EventReceiver = mpsc::UnboundedReceiver<Result<EngineEvent, EngineError>>;

/// Container engine operations used by a session.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Negotiated remote API version.
    fn api_version(&self) -> ApiVersion;

    /// Creates a container with the given name.
    async fn create_container(
        &self,
        name: &str,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError>;

    /// Pulls an image, draining the progress stream.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Attaches to the container's standard streams.
    async fn attach(&self, id: &str) -> Result<HijackedStream, EngineError>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Resizes the container's pseudo-terminal.
    async fn resize(&self, id: &str, size: TerminalSize) -> Result<(), EngineError>;

    /// Registers a wait for `condition`.
    ///
    /// Returns once the engine has accepted the wait, so transitions after
    /// this call are observed. The status arrives on the returned receiver.
    async fn wait(&self, id: &str, condition: WaitCondition) -> Result<PendingWait, EngineError>;

    /// Subscribes to lifecycle events of one container.
    ///
    /// Returns once the engine has accepted the subscription. It ends when
    /// `cancel` fires or the engine closes it.
    async fn events(&self, id: &str, cancel: CancellationToken)
    -> Result<EventReceiver, EngineError>;

    /// Removes a container.
    async fn remove(&self, id: &str, force: bool, volumes: bool) -> Result<(), EngineError>;

    /// Lists containers (including stopped ones) carrying all `labels`.
    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerSummary>, EngineError>;
}

/// Condition accepted by the wait endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Wait for the next exit of the container.
    NextExit,
    /// Wait until the container has been removed.
    Removed,
}

impl WaitCondition {
    /// Query string value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NextExit => "next-exit",
            Self::Removed => "removed",
        }
    }
}

// =============================================================================
// API version
// =============================================================================

/// Remote API version (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// Highest version this client speaks.
    pub const MAX_SUPPORTED: Self = Self::new(1, 43);
    /// Below this version the wait endpoint lacks conditions and exit
    /// detection goes through the event stream.
    pub const WAIT_CONDITIONS: Self = Self::new(1, 30);
    /// Below this version the engine cannot auto-remove containers.
    pub const SERVER_AUTO_REMOVE: Self = Self::new(1, 25);

    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Path prefix for versioned endpoints, e.g. `/v1.43`.
    #[must_use]
    pub fn path_prefix(self) -> String {
        format!("/v{self}")
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidVersion(s.to_string());
        let trimmed = s.trim().trim_start_matches('v');
        let (major, minor) = trimmed.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

// =============================================================================
// Events
// =============================================================================

/// Container lifecycle event as reported by the events endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineEvent {
    /// Legacy action field.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "Type")]
    pub kind: Option<String>,
    #[serde(default, rename = "Action")]
    pub action: Option<String>,
    #[serde(default, rename = "Actor")]
    pub actor: EventActor,
}

/// Object an event refers to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventActor {
    #[serde(default, rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl EngineEvent {
    /// Event action (`die`, `destroy`, ...), whichever field carries it.
    #[must_use]
    pub fn action(&self) -> &str {
        self.action
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or_default()
    }

    /// Raw `exitCode` attribute, if present.
    #[must_use]
    pub fn exit_code_attribute(&self) -> Option<&str> {
        self.actor.attributes.get("exitCode").map(String::as_str)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine socket could not be reached.
    #[error("cannot connect to the container engine at {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP transport failure.
    #[error("engine transport error: {0}")]
    Transport(#[from] hyper::Error),

    /// The engine answered with an error status.
    #[error("error response from engine ({status}): {message}")]
    Api { status: u16, message: String },

    /// The engine answered with a body we could not decode.
    #[error("malformed engine response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Connection upgrade for the attach stream failed.
    #[error("stream upgrade failed: {0}")]
    Upgrade(String),

    /// Unparseable API version string.
    #[error("invalid API version: {0}")]
    InvalidVersion(String),

    /// A streamed operation reported an error record.
    #[error("{0}")]
    Stream(String),
}

impl EngineError {
    /// Message carried by the error, without transport decoration.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Api { message, .. } | Self::Stream(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Returns true if the engine reported a missing object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// Returns true if creation failed because the image is not present locally.
    #[must_use]
    pub fn is_image_missing(&self) -> bool {
        match self {
            Self::Api { status, message } => {
                *status == 404 && message.to_ascii_lowercase().contains("no such image")
            }
            _ => false,
        }
    }

    /// Returns true if a removal failed only because the container is
    /// already gone or already being removed.
    #[must_use]
    pub fn is_already_removed(&self) -> bool {
        match self {
            Self::Api { status: 404, .. } => true,
            Self::Api {
                status: 409,
                message,
            } => message.contains("already in progress"),
            _ => false,
        }
    }
}

/// Maps a container start failure to a process exit code.
///
/// Missing executables map to 127, permission problems to 126 and anything
/// else to 125.
#[must_use]
pub fn start_failure_exit_code(message: &str) -> i32 {
    let message = message
        .strip_prefix("Error response from daemon: ")
        .unwrap_or(message);

    if message.contains("executable file not found")
        || message.contains("no such file or directory")
        || message.contains("system cannot find the file specified")
    {
        EXIT_NOT_FOUND
    } else if message.contains("permission denied") || message.contains("is a directory") {
        EXIT_NOT_EXECUTABLE
    } else {
        EXIT_ENGINE_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_parse_and_order() {
        let v: ApiVersion = "1.43".parse().unwrap();
        assert_eq!(v, ApiVersion::new(1, 43));
        assert_eq!(v.path_prefix(), "/v1.43");

        let old: ApiVersion = "v1.24".parse().unwrap();
        assert!(old < ApiVersion::SERVER_AUTO_REMOVE);
        assert!(old < ApiVersion::WAIT_CONDITIONS);
        assert!(ApiVersion::new(1, 30) >= ApiVersion::WAIT_CONDITIONS);
        assert!(ApiVersion::new(2, 0) > ApiVersion::MAX_SUPPORTED);

        assert!("1".parse::<ApiVersion>().is_err());
        assert!("1.x".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn test_start_failure_exit_codes() {
        assert_eq!(
            start_failure_exit_code(
                "Error response from daemon: failed to create task: exec: \"zsh\": \
                 executable file not found in $PATH: unknown"
            ),
            127
        );
        assert_eq!(
            start_failure_exit_code("exec /entry.sh: no such file or directory"),
            127
        );
        assert_eq!(
            start_failure_exit_code("exec: \"/etc\": permission denied: unknown"),
            126
        );
        assert_eq!(start_failure_exit_code("read /bin: is a directory"), 126);
        assert_eq!(start_failure_exit_code("cgroup setup failed"), 125);
    }

    #[test]
    fn test_error_classification() {
        let missing = EngineError::Api {
            status: 404,
            message: "No such image: alpine:3.20".to_string(),
        };
        assert!(missing.is_image_missing());
        assert!(missing.is_not_found());

        let gone = EngineError::Api {
            status: 404,
            message: "No such container: abc".to_string(),
        };
        assert!(!gone.is_image_missing());
        assert!(gone.is_already_removed());

        let in_progress = EngineError::Api {
            status: 409,
            message: "removal of container abc is already in progress".to_string(),
        };
        assert!(in_progress.is_already_removed());

        let conflict = EngineError::Api {
            status: 409,
            message: "name already in use".to_string(),
        };
        assert!(!conflict.is_already_removed());
    }

    #[test]
    fn test_event_action_and_exit_code() {
        let event: EngineEvent = serde_json::from_str(
            r#"{"status":"die","Type":"container","Action":"die",
                "Actor":{"ID":"abc","Attributes":{"exitCode":"3","name":"x"}}}"#,
        )
        .unwrap();
        assert_eq!(event.action(), "die");
        assert_eq!(event.exit_code_attribute(), Some("3"));

        let legacy: EngineEvent = serde_json::from_str(r#"{"status":"destroy"}"#).unwrap();
        assert_eq!(legacy.action(), "destroy");
        assert_eq!(legacy.exit_code_attribute(), None);
    }
}
