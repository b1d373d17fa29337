//! Container exit detection.
//!
//! Engines at API 1.30 or newer can block on a wait condition; older ones
//! only report exits through the event stream. [`LifecycleResolver`] picks
//! the matching [`ExitWatcher`] once, from the negotiated API version.

use crate::engine::{
    ApiVersion, DynEngine, EXIT_ENGINE_FAILURE, EventReceiver, PendingWait, WaitCondition,
};
use async_trait::async_trait;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Exit code of a registered wait. Always resolves; failures and
/// cancellation yield the best code known, defaulting to 125.
pub type ExitFuture = Pin<Box<dyn Future<Output = i32> + Send>>;

fn settled(code: i32) -> ExitFuture {
    Box::pin(future::ready(code))
}

/// Strategy resolving a container's final exit code.
#[async_trait]
pub trait ExitWatcher: Send + Sync {
    /// Registers interest in the container's exit (or removal) with the
    /// engine. Exits happening after this returns are observed by the
    /// returned future.
    async fn register(
        &self,
        id: &str,
        wait_for_removal: bool,
        cancel: CancellationToken,
    ) -> ExitFuture;
}

/// Waits with the engine's wait endpoint.
pub struct ConditionWait {
    engine: DynEngine,
}

impl ConditionWait {
    #[must_use]
    pub fn new(engine: DynEngine) -> Self {
        Self { engine }
    }

    async fn resolve(pending: PendingWait, cancel: CancellationToken) -> i32 {
        let result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Wait for container cancelled");
                return EXIT_ENGINE_FAILURE;
            }
            result = pending => result,
        };

        match result {
            Ok(Ok(response)) => match response.error {
                Some(error) => {
                    tracing::error!("Error waiting for container: {}", error.message);
                    EXIT_ENGINE_FAILURE
                }
                None => i32::try_from(response.status_code).unwrap_or(EXIT_ENGINE_FAILURE),
            },
            Ok(Err(e)) => {
                tracing::error!("Error waiting for container: {}", e);
                EXIT_ENGINE_FAILURE
            }
            Err(_) => {
                tracing::error!("Error waiting for container: wait dropped by engine client");
                EXIT_ENGINE_FAILURE
            }
        }
    }
}

#[async_trait]
impl ExitWatcher for ConditionWait {
    async fn register(
        &self,
        id: &str,
        wait_for_removal: bool,
        cancel: CancellationToken,
    ) -> ExitFuture {
        let condition = if wait_for_removal {
            WaitCondition::Removed
        } else {
            WaitCondition::NextExit
        };

        let registered = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Wait for container cancelled");
                return settled(EXIT_ENGINE_FAILURE);
            }
            result = self.engine.wait(id, condition) => result,
        };

        let pending = match registered {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!("Error waiting for container: {}", e);
                return settled(EXIT_ENGINE_FAILURE);
            }
        };
        Box::pin(Self::resolve(pending, cancel))
    }
}

/// Follows the container's event stream (API < 1.30).
pub struct EventStreamWait {
    engine: DynEngine,
}

impl EventStreamWait {
    #[must_use]
    pub fn new(engine: DynEngine) -> Self {
        Self { engine }
    }
}

/// Removes the container client-side; engines before 1.25 cannot.
fn spawn_remove(engine: &DynEngine, id: &str, events: CancellationToken) {
    let engine = Arc::clone(engine);
    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = engine.remove(&id, false, true).await {
            tracing::error!("Error removing container: {}", e);
            events.cancel();
        }
    });
}

async fn follow_events(
    engine: DynEngine,
    id: String,
    mut events: EventReceiver,
    wait_for_removal: bool,
    token: CancellationToken,
) -> i32 {
    let mut exit_code = EXIT_ENGINE_FAILURE;
    let remove_client_side =
        wait_for_removal && engine.api_version() < ApiVersion::SERVER_AUTO_REMOVE;

    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = events.recv() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                tracing::error!("Error getting events from engine: {}", e);
                break;
            }
            None => {
                tracing::debug!("Event stream closed");
                break;
            }
        };

        match event.action() {
            "die" => {
                if let Some(raw) = event.exit_code_attribute() {
                    match raw.parse::<i32>() {
                        Ok(code) => exit_code = code,
                        Err(e) => {
                            tracing::error!("Failed to convert exit code {:?}: {}", raw, e);
                        }
                    }
                }
                if !wait_for_removal {
                    break;
                }
                if remove_client_side {
                    spawn_remove(&engine, &id, token.clone());
                }
            }
            "detach" => {
                exit_code = 0;
                break;
            }
            "destroy" => break,
            other => tracing::debug!("Ignoring container event {}", other),
        }
    }

    token.cancel();
    exit_code
}

#[async_trait]
impl ExitWatcher for EventStreamWait {
    async fn register(
        &self,
        id: &str,
        wait_for_removal: bool,
        cancel: CancellationToken,
    ) -> ExitFuture {
        let token = cancel.child_token();

        let events = match self.engine.events(id, token.clone()).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("Error getting events from engine: {}", e);
                return settled(EXIT_ENGINE_FAILURE);
            }
        };
        Box::pin(follow_events(
            Arc::clone(&self.engine),
            id.to_string(),
            events,
            wait_for_removal,
            token,
        ))
    }
}

/// Resolves the final exit code of a session container.
#[derive(Clone)]
pub struct LifecycleResolver {
    watcher: Arc<dyn ExitWatcher>,
    legacy: bool,
}

impl LifecycleResolver {
    /// Selects the strategy matching the engine's API version.
    #[must_use]
    pub fn new(engine: DynEngine) -> Self {
        let version = engine.api_version();
        let legacy = version < ApiVersion::WAIT_CONDITIONS;
        tracing::debug!(
            "Engine API {}: waiting via {}",
            version,
            if legacy { "event stream" } else { "wait condition" }
        );

        let watcher: Arc<dyn ExitWatcher> = if legacy {
            Arc::new(EventStreamWait::new(engine))
        } else {
            Arc::new(ConditionWait::new(engine))
        };
        Self { watcher, legacy }
    }

    /// Returns true when exits are detected through the event stream.
    #[must_use]
    pub const fn uses_event_stream(&self) -> bool {
        self.legacy
    }

    /// Registers the wait and resolves it in place.
    pub async fn wait_for_exit(
        &self,
        id: &str,
        wait_for_removal: bool,
        cancel: CancellationToken,
    ) -> i32 {
        self.watcher
            .register(id, wait_for_removal, cancel)
            .await
            .await
    }

    /// Registers the wait, then resolves it in the background.
    ///
    /// The engine is watching once this returns, so the container may be
    /// started right after. The receiver yields exactly one exit code.
    pub async fn spawn(
        &self,
        id: &str,
        wait_for_removal: bool,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<i32> {
        let exit = self.watcher.register(id, wait_for_removal, cancel).await;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(exit.await);
        });
        rx
    }
}
