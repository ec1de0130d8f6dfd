//! Session Manager
//!
//! Owns the single tunnel session of the process and sequences start/stop
//! against the engine and the platform bridge.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bridge = Arc::new(NetworkBridge::new(LinuxStack::new()));
//! let session = SessionManager::new(
//!     Arc::new(ProcessEngineFactory::new("sing-box")),
//!     bridge,
//!     ConfigStore::new(data_dir),
//! );
//!
//! session.add_observer(Arc::new(|running: bool| println!("running: {running}")));
//! session.start(TunnelConfig::build(&server, Some(&data_dir)))?;
//! session.wait_until_settled().await;
//!
//! session.stop_and_wait().await?;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Running ──stop──▶ Stopping ──▶ Idle
//!                    │                │
//!                    └──error/fault───┴──▶ Failed ──cleanup──▶ Idle
//!
//! A fault is a socket that could not be protected or an engine that
//! exited on its own.
//! ```
//!
//! All transitions run on one worker task fed by a command channel, so a
//! stop issued while starting is applied once the start has finished.

use crate::bridge::{BridgeFault, SessionBridge};
use crate::config::{Outbound, TunnelConfig};
use crate::engine::{EngineError, EngineFactory, TunnelEngine};
use crate::lock;
use crate::store::{ConfigStore, StoreError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tunnel session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Engine is being started
    Starting,
    /// Tunnel is up
    Running,
    /// Engine is being closed
    Stopping,
    /// Start or run failed, cleanup pending
    Failed,
}

impl SessionState {
    /// Check if the tunnel is up
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if a transition is in progress
    pub fn is_transitioning(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping | SessionState::Failed)
    }

    /// Human-readable state
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "disconnected",
            SessionState::Starting => "connecting",
            SessionState::Running => "connected",
            SessionState::Stopping => "disconnecting",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session worker is no longer running")]
    WorkerGone,

    #[error("Failed to persist configuration: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Receives the running flag on every Running ⇄ not-running transition.
///
/// Delivery happens on the session worker; an observer must not call back
/// into [`SessionManager::remove_observer`] from inside the callback.
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, running: bool);
}

impl<F> StateObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_state_changed(&self, running: bool) {
        self(running)
    }
}

/// Handle returned by [`SessionManager::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

enum Command {
    Start(Box<TunnelConfig>),
    Stop(Option<oneshot::Sender<()>>),
}

struct Inner {
    state: SessionState,
    /// A start command is in the channel
    start_queued: bool,
    /// Stop commands in the channel
    stops_pending: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn StateObserver>)>>,
    next_observer: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    fn set_state(&self, state: SessionState) {
        let mut inner = lock(&self.inner);
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Leave a transitional state: Starting if another start is queued, else Idle
    fn settle(&self) {
        let mut inner = lock(&self.inner);
        inner.state = if inner.start_queued {
            SessionState::Starting
        } else {
            SessionState::Idle
        };
        self.state_tx.send_replace(inner.state);
    }

    fn notify(&self, running: bool) {
        let observers = lock(&self.observers);
        debug!("Notifying {} observer(s): running={}", observers.len(), running);
        for (_, observer) in observers.iter() {
            observer.on_state_changed(running);
        }
    }
}

/// Single-session tunnel manager
///
/// - Rejects duplicate starts synchronously
/// - Serializes start/stop on a worker task
/// - Turns bridge faults into session failures
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl SessionManager {
    /// Create the manager and spawn its worker. Must be called inside a
    /// tokio runtime.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        bridge: Arc<dyn SessionBridge>,
        store: ConfigStore,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        bridge.attach_faults(fault_tx);

        let (state_tx, _) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                start_queued: false,
                stops_pending: 0,
            }),
            state_tx,
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        let worker = Worker {
            factory,
            bridge,
            store,
            shared: shared.clone(),
            engine: None,
            exited: None,
        };
        let worker = tokio::spawn(worker.run(command_rx, fault_rx));

        Self {
            commands,
            shared,
            worker,
        }
    }

    /// Start a session with `config`.
    ///
    /// Ignored when a session is already starting or running, unless a stop
    /// is queued ahead of it.
    pub fn start(&self, config: TunnelConfig) -> Result<(), SessionError> {
        let mut inner = lock(&self.shared.inner);

        let busy = matches!(inner.state, SessionState::Starting | SessionState::Running);
        if inner.start_queued || (busy && inner.stops_pending == 0) {
            debug!("Start ignored, session is {}", inner.state);
            return Ok(());
        }

        self.commands
            .send(Command::Start(Box::new(config)))
            .map_err(|_| SessionError::WorkerGone)?;

        inner.start_queued = true;
        if matches!(inner.state, SessionState::Idle | SessionState::Failed) {
            inner.state = SessionState::Starting;
            self.shared.state_tx.send_replace(SessionState::Starting);
        }
        Ok(())
    }

    /// Request a stop; idempotent
    pub fn stop(&self) -> Result<(), SessionError> {
        self.enqueue_stop(None)
    }

    /// Request a stop and wait until the worker has applied it
    pub async fn stop_and_wait(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_stop(Some(tx))?;
        rx.await.map_err(|_| SessionError::WorkerGone)
    }

    fn enqueue_stop(&self, ack: Option<oneshot::Sender<()>>) -> Result<(), SessionError> {
        let mut inner = lock(&self.shared.inner);
        self.commands
            .send(Command::Stop(ack))
            .map_err(|_| SessionError::WorkerGone)?;
        inner.stops_pending += 1;
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Check if the tunnel is up
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Watch every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the session is Running or Idle
    pub async fn wait_until_settled(&self) -> SessionState {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| matches!(s, SessionState::Running | SessionState::Idle))
            .await
            .map(|s| *s);
        match settled {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Register an observer
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.observers).push((id, observer));
        id
    }

    /// Remove an observer. Once this returns the observer receives nothing
    /// further.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.shared.observers);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Reason of the most recent failure, cleared by a successful start
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Stop the worker, tearing down any active session
    pub async fn shutdown(self) {
        let Self {
            commands, worker, ..
        } = self;
        drop(commands);
        if let Err(e) = worker.await {
            error!("Session worker panicked: {}", e);
        }
    }
}

struct Worker {
    factory: Arc<dyn EngineFactory>,
    bridge: Arc<dyn SessionBridge>,
    store: ConfigStore,
    shared: Arc<Shared>,
    engine: Option<Box<dyn TunnelEngine>>,
    /// Exit notice of the running engine
    exited: Option<oneshot::Receiver<String>>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut faults: mpsc::UnboundedReceiver<BridgeFault>,
    ) {
        debug!("Session worker started");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Start(config)) => {
                        while faults.try_recv().is_ok() {}
                        self.handle_start(*config).await;
                    }
                    Some(Command::Stop(ack)) => {
                        self.handle_stop().await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => break,
                },

                Some(fault) = faults.recv() => self.handle_fault(fault).await,

                reason = engine_exit(&mut self.exited) => self.handle_engine_exit(reason).await,
            }
        }

        if self.engine.is_some() || self.bridge.has_tun() {
            info!("Session manager dropped, tearing down active session");
            let was_running = self.shared.state().is_running();
            self.teardown().await;
            self.shared.set_state(SessionState::Idle);
            if was_running {
                self.shared.notify(false);
            }
        }
        debug!("Session worker finished");
    }

    async fn handle_start(&mut self, config: TunnelConfig) {
        lock(&self.shared.inner).start_queued = false;

        if self.engine.is_some() {
            warn!("Start received while an engine is active, ignoring");
            return;
        }

        match config.proxy_outbound() {
            Some(Outbound::Hysteria2 {
                server, server_port, ..
            }) => info!("Starting tunnel session to {}:{}", server, server_port),
            _ => info!("Starting tunnel session"),
        }
        self.shared.set_state(SessionState::Starting);

        match self.launch(&config).await {
            Ok(mut engine) => {
                self.exited = engine.exit_notice();
                self.engine = Some(engine);
                *lock(&self.shared.last_error) = None;
                self.shared.set_state(SessionState::Running);
                info!("Tunnel session running");
                self.shared.notify(true);
            }
            Err(e) => self.fail(e.to_string()).await,
        }
    }

    async fn launch(
        &mut self,
        config: &TunnelConfig,
    ) -> Result<Box<dyn TunnelEngine>, SessionError> {
        let path = self.store.write(config)?;
        let mut engine = self.factory.create(&path, self.bridge.clone().platform())?;

        if let Err(e) = engine.start().await {
            if let Err(close_err) = engine.close().await {
                warn!("Engine close after failed start failed: {}", close_err);
            }
            return Err(e.into());
        }
        Ok(engine)
    }

    async fn handle_stop(&mut self) {
        {
            let mut inner = lock(&self.shared.inner);
            inner.stops_pending = inner.stops_pending.saturating_sub(1);
        }

        if self.engine.is_none() && !self.bridge.has_tun() {
            debug!("Stop ignored, no active session");
            return;
        }

        let was_running = self.shared.state().is_running();
        info!("Stopping tunnel session");
        self.shared.set_state(SessionState::Stopping);
        self.teardown().await;

        if was_running {
            self.shared.notify(false);
        }
        self.shared.settle();
        info!("Tunnel session stopped");
    }

    async fn handle_fault(&mut self, fault: BridgeFault) {
        if self.shared.state().is_running() {
            self.fail(fault.to_string()).await;
        } else {
            warn!("Bridge fault outside a running session: {}", fault);
        }
    }

    async fn handle_engine_exit(&mut self, reason: String) {
        if self.engine.is_some() {
            self.fail(reason).await;
        } else {
            debug!("Exit notice without an engine: {}", reason);
        }
    }

    async fn fail(&mut self, reason: String) {
        error!("Tunnel session failed: {}", reason);
        *lock(&self.shared.last_error) = Some(reason);
        self.shared.set_state(SessionState::Failed);

        self.teardown().await;
        self.shared.notify(false);
        self.shared.settle();
    }

    /// Close the engine and the virtual interface; errors are logged only
    async fn teardown(&mut self) {
        self.exited = None;
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.close().await {
                warn!("Engine close failed: {}", e);
            }
        }
        if self.bridge.release_tun() {
            debug!("Virtual interface released");
        }
    }
}

/// Reason the running engine stopped on its own. Pending when there is no
/// engine or the notice was withdrawn by a regular close.
async fn engine_exit(exited: &mut Option<oneshot::Receiver<String>>) -> String {
    if let Some(notice) = exited.as_mut() {
        let outcome = notice.await;
        *exited = None;
        if let Ok(reason) = outcome {
            return reason;
        }
    }
    std::future::pending().await
}
