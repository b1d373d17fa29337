//! Shared fixtures: an in-memory engine and a scriptable console.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use toolbox_cli::client::{
    ContainerSummary, ContainerWaitResponse, CreateContainerRequest, CreateContainerResponse,
    WaitError,
};
use toolbox_cli::engine::{
    ApiVersion, Engine, EngineError, EngineEvent, EventActor, EventReceiver, HijackedStream,
    PendingWait, WaitCondition, start_failure_exit_code,
};
use toolbox_cli::session::SessionOptions;
use toolbox_cli::terminal::{Console, TerminalSize};

pub const CONTAINER_ID: &str = "4f1c9e2ab07d5c3e8a9b0c1d2e3f40516273849a5b6c7d8e9f0a1b2c3d4e5f60";

/// Exit code the engine reports for a container killed by forced removal.
pub const KILLED: i32 = 137;

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    image_present: bool,
    pull_error: Option<String>,
    start_error: Option<String>,
    exit_on_start: Option<i32>,
    wait_error: Option<String>,
    auto_remove: bool,
    client_side: Option<DuplexStream>,
    container_side: Option<DuplexStream>,
    last_request: Option<CreateContainerRequest>,
    history: Vec<EngineEvent>,
    exited: bool,
    removed: bool,
}

/// In-memory container engine holding a single container.
///
/// The test plays the container through [`MockEngine::take_container_side`]
/// and [`MockEngine::exit`].
pub struct MockEngine {
    version: ApiVersion,
    inner: Mutex<Inner>,
    exit: watch::Sender<Option<i32>>,
    removed: watch::Sender<bool>,
    events: broadcast::Sender<EngineEvent>,
    calls_changed: Notify,
}

impl MockEngine {
    pub fn new(version: ApiVersion) -> Self {
        let (client_side, container_side) = tokio::io::duplex(64 * 1024);
        let (exit, _) = watch::channel(None);
        let (removed, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);

        Self {
            version,
            inner: Mutex::new(Inner {
                image_present: true,
                client_side: Some(client_side),
                container_side: Some(container_side),
                ..Inner::default()
            }),
            exit,
            removed,
            events,
            calls_changed: Notify::new(),
        }
    }

    /// Engine speaking the current API.
    pub fn modern() -> Self {
        Self::new(ApiVersion::new(1, 43))
    }

    /// Engine below the wait-condition threshold.
    pub fn legacy() -> Self {
        Self::new(ApiVersion::new(1, 24))
    }

    pub fn without_image(self) -> Self {
        self.lock().image_present = false;
        self
    }

    pub fn with_pull_error(self, message: &str) -> Self {
        self.lock().pull_error = Some(message.to_string());
        self
    }

    pub fn with_start_error(self, message: &str) -> Self {
        self.lock().start_error = Some(message.to_string());
        self
    }

    /// The container exits with `code` while the start call is running.
    pub fn with_exit_on_start(self, code: i32) -> Self {
        self.lock().exit_on_start = Some(code);
        self
    }

    pub fn with_wait_error(self, message: &str) -> Self {
        self.lock().wait_error = Some(message.to_string());
        self
    }

    /// Removes the container as soon as it exits, like `--rm`.
    pub fn with_auto_remove(self) -> Self {
        self.lock().auto_remove = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The container's end of the attach stream.
    pub fn take_container_side(&self) -> DuplexStream {
        self.lock()
            .container_side
            .take()
            .expect("container side already taken")
    }

    /// Lets the container exit with `code`.
    pub fn exit(&self, code: i32) {
        let mut inner = self.lock();
        if inner.exited {
            return;
        }
        inner.exited = true;
        self.emit_locked(&mut inner, die(code));
        self.exit.send_replace(Some(code));

        if inner.auto_remove {
            inner.removed = true;
            self.emit_locked(&mut inner, event("destroy"));
            self.removed.send_replace(true);
        }
    }

    /// Publishes an arbitrary container event.
    pub fn emit(&self, action: &str) {
        let mut inner = self.lock();
        self.emit_locked(&mut inner, event(action));
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn is_removed(&self) -> bool {
        self.lock().removed
    }

    pub fn last_request(&self) -> Option<CreateContainerRequest> {
        self.lock().last_request.clone()
    }

    /// Waits until a call starting with `prefix` has been made.
    pub async fn wait_for_call(&self, prefix: &str) {
        loop {
            let notified = self.calls_changed.notified();
            if self.count(prefix) > 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn started(&self) {
        self.wait_for_call("start").await;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock engine poisoned")
    }

    fn record(&self, call: impl Into<String>) {
        self.lock().calls.push(call.into());
        self.calls_changed.notify_waiters();
    }

    fn emit_locked(&self, inner: &mut Inner, event: EngineEvent) {
        inner.history.push(event.clone());
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn api_version(&self) -> ApiVersion {
        self.version
    }

    async fn create_container(
        &self,
        name: &str,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError> {
        self.record(format!("create {name}"));
        let mut inner = self.lock();
        if !inner.image_present {
            return Err(EngineError::Api {
                status: 404,
                message: format!("No such image: {}", request.image),
            });
        }
        inner.last_request = Some(request.clone());
        Ok(CreateContainerResponse {
            id: CONTAINER_ID.to_string(),
            warnings: None,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(format!("pull {image}"));
        let mut inner = self.lock();
        if let Some(message) = inner.pull_error.clone() {
            return Err(EngineError::Stream(message));
        }
        inner.image_present = true;
        Ok(())
    }

    async fn attach(&self, _id: &str) -> Result<HijackedStream, EngineError> {
        self.record("attach");
        let stream = self
            .lock()
            .client_side
            .take()
            .ok_or_else(|| EngineError::Upgrade("already attached".to_string()))?;
        Ok(Box::new(stream))
    }

    async fn start(&self, _id: &str) -> Result<(), EngineError> {
        let (error, exit_on_start) = {
            let inner = self.lock();
            (inner.start_error.clone(), inner.exit_on_start)
        };
        self.record("start");

        if let Some(message) = error {
            // A failed start leaves the container exited, like a real engine.
            self.exit(start_failure_exit_code(&message));
            return Err(EngineError::Api {
                status: 400,
                message,
            });
        }
        if let Some(code) = exit_on_start {
            self.exit(code);
        }
        Ok(())
    }

    async fn resize(&self, _id: &str, size: TerminalSize) -> Result<(), EngineError> {
        self.record(format!("resize {}x{}", size.cols, size.rows));
        Ok(())
    }

    async fn wait(&self, _id: &str, condition: WaitCondition) -> Result<PendingWait, EngineError> {
        self.record(format!("wait {}", condition.as_str()));
        let (tx, rx) = oneshot::channel();

        if let Some(message) = self.lock().wait_error.clone() {
            let _ = tx.send(Ok(ContainerWaitResponse {
                status_code: 0,
                error: Some(WaitError { message }),
            }));
            return Ok(rx);
        }

        // next-exit only reports exits after registration.
        let mut exit = self.exit.subscribe();
        exit.borrow_and_update();
        let mut removed = self.removed.subscribe();

        tokio::spawn(async move {
            let reached = match condition {
                WaitCondition::NextExit => exit.changed().await,
                WaitCondition::Removed => removed.wait_for(|removed| *removed).await.map(drop),
            };
            let code = *exit.borrow();
            let result = match reached {
                Ok(()) => Ok(ContainerWaitResponse {
                    status_code: i64::from(code.unwrap_or_default()),
                    error: None,
                }),
                Err(e) => Err(EngineError::Stream(e.to_string())),
            };
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    async fn events(
        &self,
        _id: &str,
        cancel: CancellationToken,
    ) -> Result<EventReceiver, EngineError> {
        self.record("events");
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay and subscribe under one lock so nothing is missed.
        let mut live = {
            let inner = self.lock();
            for event in &inner.history {
                let _ = tx.send(Ok(event.clone()));
            }
            self.events.subscribe()
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = live.recv() => match event {
                        Ok(event) => {
                            if tx.send(Ok(event)).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn remove(&self, id: &str, force: bool, _volumes: bool) -> Result<(), EngineError> {
        self.record(if force { "remove force" } else { "remove" });
        let mut inner = self.lock();
        if inner.removed {
            return Err(EngineError::Api {
                status: 404,
                message: format!("No such container: {id}"),
            });
        }

        inner.removed = true;
        if !inner.exited {
            inner.exited = true;
            self.emit_locked(&mut inner, die(KILLED));
            self.exit.send_replace(Some(KILLED));
        }
        self.emit_locked(&mut inner, event("destroy"));
        self.removed.send_replace(true);
        Ok(())
    }

    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record(format!("list {}", labels.len()));
        Ok(Vec::new())
    }
}

fn event(action: &str) -> EngineEvent {
    EngineEvent {
        status: Some(action.to_string()),
        kind: Some("container".to_string()),
        action: Some(action.to_string()),
        actor: EventActor {
            id: CONTAINER_ID.to_string(),
            attributes: HashMap::new(),
        },
    }
}

fn die(code: i32) -> EngineEvent {
    let mut event = event("die");
    event
        .actor
        .attributes
        .insert("exitCode".to_string(), code.to_string());
    event
}

/// Console with a fixed size that counts raw-mode switches.
pub struct FakeConsole {
    terminal: bool,
    size: TerminalSize,
    raw_enabled: AtomicUsize,
    raw_disabled: AtomicUsize,
}

impl FakeConsole {
    pub fn tty(cols: u16, rows: u16) -> Arc<Self> {
        Arc::new(Self {
            terminal: true,
            size: TerminalSize { cols, rows },
            raw_enabled: AtomicUsize::new(0),
            raw_disabled: AtomicUsize::new(0),
        })
    }

    pub fn pipe() -> Arc<Self> {
        Arc::new(Self {
            terminal: false,
            size: TerminalSize { cols: 80, rows: 24 },
            raw_enabled: AtomicUsize::new(0),
            raw_disabled: AtomicUsize::new(0),
        })
    }

    pub fn raw_enabled(&self) -> usize {
        self.raw_enabled.load(Ordering::SeqCst)
    }

    pub fn raw_disabled(&self) -> usize {
        self.raw_disabled.load(Ordering::SeqCst)
    }

    /// True when every raw-mode switch has been undone.
    pub fn restored(&self) -> bool {
        self.raw_enabled() == self.raw_disabled()
    }
}

impl Console for FakeConsole {
    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn size(&self) -> io::Result<TerminalSize> {
        Ok(self.size)
    }

    fn enable_raw_mode(&self) -> io::Result<()> {
        self.raw_enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_raw_mode(&self) -> io::Result<()> {
        self.raw_disabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Session options with short timings.
pub fn options() -> SessionOptions {
    SessionOptions {
        name: "admbox-alice-dev-test".to_string(),
        pull: false,
        resize_interval: Duration::from_millis(10),
        start_failure_grace: Duration::from_millis(50),
    }
}

pub fn request() -> CreateContainerRequest {
    CreateContainerRequest {
        image: "alpine:3.20".to_string(),
        tty: true,
        open_stdin: true,
        attach_stdin: true,
        attach_stdout: true,
        attach_stderr: true,
        ..CreateContainerRequest::default()
    }
}
