//! Tunnel Engine
//!
//! The engine is a black box with a `start()`/`close()` lifecycle. It is
//! built from a configuration document on disk plus the platform bridge it
//! calls back into.
//!
//! [`ProcessEngine`] runs an external sing-box binary:
//!
//! ```text
//! <command> [args...] run -c <config path>
//! ```
//!
//! The external process manages its own interface, so it never calls back
//! into the bridge. A supervisor task watches the process after start and
//! reports an unexpected exit through [`TunnelEngine::exit_notice`].

use crate::platform::{BridgeError, PlatformBridge};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a freshly spawned engine must stay alive to count as started
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Engine lifecycle
#[async_trait]
pub trait TunnelEngine: Send {
    /// Bring the tunnel up
    async fn start(&mut self) -> Result<(), EngineError>;

    /// Tear the tunnel down
    async fn close(&mut self) -> Result<(), EngineError>;

    /// Taken once after a successful start. Resolves with a reason if the
    /// engine stops on its own; the sender is dropped on a regular close.
    fn exit_notice(&mut self) -> Option<oneshot::Receiver<String>> {
        None
    }
}

/// Builds one engine per session attempt
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        config_path: &Path,
        bridge: Arc<dyn PlatformBridge>,
    ) -> Result<Box<dyn TunnelEngine>, EngineError>;
}

/// External engine process factory
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    /// Program to run
    program: PathBuf,
    /// Arguments placed before `run -c <path>`
    args: Vec<String>,
    /// Startup grace period
    grace: Duration,
}

impl ProcessEngineFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            grace: DEFAULT_STARTUP_GRACE,
        }
    }

    /// Add leading arguments
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override the startup grace period
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(
        &self,
        config_path: &Path,
        _bridge: Arc<dyn PlatformBridge>,
    ) -> Result<Box<dyn TunnelEngine>, EngineError> {
        if !config_path.is_file() {
            return Err(EngineError::Construction(format!(
                "configuration {} does not exist",
                config_path.display()
            )));
        }

        Ok(Box::new(ProcessEngine {
            program: self.program.clone(),
            args: self.args.clone(),
            config_path: config_path.to_path_buf(),
            grace: self.grace,
            running: None,
            exited: None,
        }))
    }
}

/// Engine backed by an external process
#[derive(Debug)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    config_path: PathBuf,
    grace: Duration,
    /// Supervisor of the running process, if started
    running: Option<Supervised>,
    /// Fires if the process exits without being closed
    exited: Option<oneshot::Receiver<String>>,
}

#[derive(Debug)]
struct Supervised {
    pid: Option<u32>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl ProcessEngine {
    /// OS process id while running
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }
}

/// Wait for the child to exit or for a stop request, whichever comes first.
/// A dropped stop sender counts as a stop request.
async fn supervise(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    exited: oneshot::Sender<String>,
) -> io::Result<()> {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("engine exited unexpectedly ({})", status),
                Err(e) => format!("lost track of engine process: {}", e),
            };
            warn!("{}", reason);
            let _ = exited.send(reason);
            Ok(())
        }
        _ = stop => child.kill().await,
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::Start("engine already started".into()));
        }

        info!("Starting engine {}", self.program.display());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Start(format!("failed to launch {}: {}", self.program.display(), e))
            })?;

        tokio::time::sleep(self.grace).await;

        if let Some(status) = child.try_wait()? {
            return Err(EngineError::Start(format!(
                "engine exited during startup ({})",
                status
            )));
        }

        let pid = child.id();
        info!("Engine running (pid {:?})", pid);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.running = Some(Supervised {
            pid,
            stop: stop_tx,
            task: tokio::spawn(supervise(child, stop_rx, exit_tx)),
        });
        self.exited = Some(exit_rx);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.exited = None;
        let Some(running) = self.running.take() else {
            debug!("Engine close requested but nothing is running");
            return Ok(());
        };

        // Fails when the supervisor already saw the process exit
        let _ = running.stop.send(());
        match running.task.await {
            Ok(result) => result.map_err(|e| EngineError::Close(e.to_string()))?,
            Err(e) => return Err(EngineError::Close(format!("engine supervisor failed: {}", e))),
        }

        info!("Engine stopped");
        Ok(())
    }

    fn exit_notice(&mut self) -> Option<oneshot::Receiver<String>> {
        self.exited.take()
    }
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine construction failed: {0}")]
    Construction(String),

    #[error("Engine start failed: {0}")]
    Start(String),

    #[error("Engine close failed: {0}")]
    Close(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NetworkBridge;
    use crate::testing::FakeStack;

    fn bridge() -> Arc<dyn PlatformBridge> {
        Arc::new(NetworkBridge::new(FakeStack::new()))
    }

    fn config_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{}").unwrap();
        file
    }

    #[tokio::test]
    async fn test_missing_config_is_rejected() {
        let factory = ProcessEngineFactory::new("true");
        let err = factory
            .create(Path::new("/nonexistent/config.json"), bridge())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Construction(_)));
    }

    #[tokio::test]
    async fn test_early_exit_fails_start() {
        let config = config_file();
        let factory = ProcessEngineFactory::new("true").with_grace(Duration::from_millis(200));
        let mut engine = factory.create(config.path(), bridge()).unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Start(_)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_fails_start() {
        let config = config_file();
        let factory = ProcessEngineFactory::new("/nonexistent/sing-box");
        let mut engine = factory.create(config.path(), bridge()).unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }

    #[tokio::test]
    async fn test_long_running_engine() {
        let config = config_file();
        let factory = ProcessEngineFactory::new("sh")
            .with_args(["-c", "sleep 30"])
            .with_grace(Duration::from_millis(100));
        let mut engine = factory.create(config.path(), bridge()).unwrap();

        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        let notice = engine.exit_notice().unwrap();
        assert!(engine.exit_notice().is_none());

        engine.close().await.unwrap();
        engine.close().await.unwrap();
        // a regular close is not an exit
        assert!(notice.await.is_err());
    }

    #[tokio::test]
    async fn test_exit_after_start_is_reported() {
        let config = config_file();
        let factory = ProcessEngineFactory::new("sh")
            .with_args(["-c", "sleep 0.3"])
            .with_grace(Duration::from_millis(50));
        let mut engine = factory.create(config.path(), bridge()).unwrap();

        engine.start().await.unwrap();
        assert!(engine.pid().is_some());
        let notice = engine.exit_notice().unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), notice)
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("exited unexpectedly"));
        engine.close().await.unwrap();
    }
}
