//! Interactive container session.
//!
//! A [`Session`] owns one container from creation to removal:
//!
//! 1. create (pulling the image once if the engine does not have it)
//! 2. attach the hijacked stream, start the output pump and register the
//!    exit wait
//! 3. start the container
//! 4. run the input pump and resize loop until the container exits
//! 5. restore the terminal and force-remove the container
//!
//! Teardown runs on every path once a container exists.

mod input;
mod output;
mod resize;

pub use input::{Control, ControlFilter, FORCE_EXIT_WARNING, InputOutcome, forward_input};
pub use output::pump_output;
pub use resize::resize_loop;

use crate::client::{CreateContainerRequest, short_id};
use crate::config::ConfigError;
use crate::engine::{
    DynEngine, EXIT_ENGINE_FAILURE, EngineError, start_failure_exit_code,
};
use crate::identity::IdentityError;
use crate::lifecycle::LifecycleResolver;
use crate::mounts::MountError;
use crate::terminal::{Console, RawModeGuard};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Session progress. Transitions are linear and never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Attached,
    Started,
    Running,
    Exiting,
    Removed,
}

/// Errors ending a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The image is not available and could not be pulled.
    #[error("unable to find image '{image}': {source}")]
    ImageMissing {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to create container: {0}")]
    CreateFailed(#[source] EngineError),

    #[error("failed to attach to container {id}: {source}")]
    AttachFailed {
        id: String,
        #[source]
        source: EngineError,
    },

    /// The engine refused to start the container.
    #[error("failed to start container {id}: {message}")]
    StartFailed { id: String, message: String, code: i32 },

    /// The container exited unsuccessfully.
    #[error("container exited with code {code}")]
    NonZeroExit { code: i32 },
}

impl SessionError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Mount(_) | Self::Identity(_) => 1,
            Self::ImageMissing { .. } | Self::CreateFailed(_) | Self::AttachFailed { .. } => {
                EXIT_ENGINE_FAILURE
            }
            Self::StartFailed { code, .. } | Self::NonZeroExit { code } => *code,
        }
    }
}

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Container name.
    pub name: String,
    /// Pull the image before the first create attempt.
    pub pull: bool,
    /// Interval between terminal size samples.
    pub resize_interval: Duration,
    /// How long a failed start waits for the container to settle.
    pub start_failure_grace: Duration,
}

impl SessionOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pull: false,
            resize_interval: Duration::from_millis(250),
            start_failure_grace: Duration::from_secs(5),
        }
    }
}

/// One interactive container session.
pub struct Session {
    engine: DynEngine,
    console: Arc<dyn Console>,
    options: SessionOptions,
    state: Option<SessionState>,
    container_id: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new(engine: DynEngine, console: Arc<dyn Console>, options: SessionOptions) -> Self {
        Self {
            engine,
            console,
            options,
            state: None,
            container_id: None,
        }
    }

    /// Last state reached, `None` before creation.
    #[must_use]
    pub const fn state(&self) -> Option<SessionState> {
        self.state
    }

    /// Engine id of the session container, once created.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Runs the session to completion.
    ///
    /// `stdin` feeds the container, container output is copied to `stdout`.
    /// Returns `Ok(())` only when the container exits with code 0.
    pub async fn run<R, W>(
        &mut self,
        request: &CreateContainerRequest,
        stdin: R,
        stdout: W,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.create(request).await?;
        self.container_id = Some(id.clone());

        let cancel = CancellationToken::new();
        let result = self.drive(&id, &cancel, stdin, stdout).await;

        cancel.cancel();
        self.transition(SessionState::Exiting);
        self.remove(&id).await;
        self.transition(SessionState::Removed);

        match result? {
            0 => Ok(()),
            code => Err(SessionError::NonZeroExit { code }),
        }
    }

    async fn create(&mut self, request: &CreateContainerRequest) -> Result<String, SessionError> {
        if self.options.pull {
            self.pull(&request.image).await?;
        }

        let response = match self
            .engine
            .create_container(&self.options.name, request)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_image_missing() => {
                tracing::info!("Unable to find image '{}' locally", request.image);
                self.pull(&request.image).await?;
                self.engine
                    .create_container(&self.options.name, request)
                    .await
                    .map_err(|e| {
                        if e.is_image_missing() {
                            SessionError::ImageMissing {
                                image: request.image.clone(),
                                source: e,
                            }
                        } else {
                            SessionError::CreateFailed(e)
                        }
                    })?
            }
            Err(e) => return Err(SessionError::CreateFailed(e)),
        };

        for warning in response.warnings.iter().flatten() {
            tracing::warn!("{}", warning);
        }
        tracing::debug!(
            "Created container {} ({})",
            self.options.name,
            short_id(&response.id)
        );

        self.transition(SessionState::Created);
        Ok(response.id)
    }

    async fn pull(&self, image: &str) -> Result<(), SessionError> {
        tracing::debug!("Pulling image {}", image);
        self.engine
            .pull_image(image)
            .await
            .map_err(|source| SessionError::ImageMissing {
                image: image.to_string(),
                source,
            })
    }

    /// Attach, start and wait. Returns the container's exit code.
    ///
    /// The raw-mode guard lives in this frame, so the terminal is restored
    /// before the caller removes the container.
    async fn drive<R, W>(
        &mut self,
        id: &str,
        cancel: &CancellationToken,
        stdin: R,
        stdout: W,
    ) -> Result<i32, SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stream = self
            .engine
            .attach(id)
            .await
            .map_err(|source| SessionError::AttachFailed {
                id: short_id(id).to_string(),
                source,
            })?;
        self.transition(SessionState::Attached);

        let (remote_out, remote_in) = tokio::io::split(stream);

        // Output must flow before start so nothing is lost.
        let output_token = cancel.child_token();
        let (output_done_tx, output_done) = oneshot::channel();
        tokio::spawn({
            let token = output_token.clone();
            async move {
                if let Err(e) = pump_output(remote_out, stdout, token).await {
                    tracing::debug!("Output pump stopped: {}", e);
                }
                let _ = output_done_tx.send(());
            }
        });

        // The wait must be registered before start, or an immediate exit
        // is never reported.
        let lifecycle = LifecycleResolver::new(Arc::clone(&self.engine));
        let mut status = lifecycle.spawn(id, false, cancel.child_token()).await;

        if let Err(e) = self.engine.start(id).await {
            output_token.cancel();
            let _ = output_done.await;

            let message = e.message();
            let code = start_failure_exit_code(&message);
            match tokio::time::timeout(self.options.start_failure_grace, &mut status).await {
                Ok(Ok(exit)) => tracing::debug!("Container settled with code {}", exit),
                _ => tracing::debug!("Container did not settle after failed start"),
            }

            return Err(SessionError::StartFailed {
                id: short_id(id).to_string(),
                message,
                code,
            });
        }
        self.transition(SessionState::Started);

        let interactive = self.console.is_terminal();
        let _raw_mode = if interactive {
            match RawModeGuard::new(Arc::clone(&self.console)) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::warn!("Failed to enable raw mode: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if interactive {
            tokio::spawn(resize_loop(
                Arc::clone(&self.engine),
                Arc::clone(&self.console),
                id.to_string(),
                self.options.resize_interval,
                cancel.child_token(),
            ));
        }

        let (pump_tx, mut pump_rx) = mpsc::channel(1);
        tokio::spawn({
            let engine = Arc::clone(&self.engine);
            let id = id.to_string();
            let token = cancel.child_token();
            async move {
                let outcome = forward_input(stdin, remote_in, engine, id, token).await;
                let _ = pump_tx.send(outcome).await;
            }
        });
        self.transition(SessionState::Running);

        let code = loop {
            tokio::select! {
                code = &mut status => break code.unwrap_or(EXIT_ENGINE_FAILURE),
                Some(outcome) = pump_rx.recv() => match outcome {
                    Ok(InputOutcome::ForceExit) => tracing::debug!("Force exit requested"),
                    Ok(outcome) => tracing::debug!("Input pump finished: {:?}", outcome),
                    Err(e) => tracing::debug!("Input pump failed: {}", e),
                },
            }
        };

        tracing::debug!("Container {} exited with code {}", short_id(id), code);
        Ok(code)
    }

    /// Force-removes the container. Never fails the session.
    async fn remove(&self, id: &str) {
        match self.engine.remove(id, true, true).await {
            Ok(()) => tracing::debug!("Removed container {}", short_id(id)),
            Err(e) if e.is_already_removed() => {
                tracing::debug!("Container {} already removed", short_id(id));
            }
            Err(e) => tracing::warn!("Failed to remove container {}: {}", short_id(id), e),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(self.state.is_none_or(|current| current < next));
        tracing::trace!("Session state {:?} -> {:?}", self.state, next);
        self.state = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let api = || EngineError::Api {
            status: 500,
            message: "boom".to_string(),
        };

        assert_eq!(SessionError::CreateFailed(api()).exit_code(), 125);
        assert_eq!(
            SessionError::AttachFailed {
                id: "abc".into(),
                source: api()
            }
            .exit_code(),
            125
        );
        assert_eq!(
            SessionError::ImageMissing {
                image: "alpine".into(),
                source: api()
            }
            .exit_code(),
            125
        );
        assert_eq!(
            SessionError::StartFailed {
                id: "abc".into(),
                message: "permission denied".into(),
                code: 126
            }
            .exit_code(),
            126
        );
        assert_eq!(SessionError::NonZeroExit { code: 3 }.exit_code(), 3);
        assert_eq!(
            SessionError::Mount(MountError::Malformed { spec: "x".into() }).exit_code(),
            1
        );
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(SessionState::Created < SessionState::Attached);
        assert!(SessionState::Running < SessionState::Exiting);
        assert!(SessionState::Exiting < SessionState::Removed);
    }
}
