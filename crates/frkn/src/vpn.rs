//! VPN Manager
//!
//! Ties the registration backend to the tunnel session:
//!
//! 1. Registers the device once and keeps the token
//! 2. Fetches the server list with the token
//! 3. Builds the engine configuration for the chosen server
//! 4. Starts the session and reports the outcome
//!
//! While connected, default route changes are logged through the platform
//! bridge the engine uses.

use crate::config::AppConfig;
use frkn_api::{ApiClient, ApiError, CredentialError, CredentialStore, Credentials};
use frkn_tunnel::{
    ConfigStore, DefaultInterfaceEvent, EngineFactory, InterfaceSnapshot, InterfaceUpdateListener,
    PlatformBridge, SessionBridge, SessionError, SessionManager, SessionState, ServerDescriptor,
    TunnelConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// VPN Manager errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("No servers available")]
    NoServers,

    #[error("Server {index} does not exist ({available} available)")]
    NoSuchServer { index: usize, available: usize },

    #[error("Tunnel failed to start: {0}")]
    StartFailed(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

/// Network state as the tunnel engine sees it
#[derive(Debug, Clone)]
pub struct NetworkReport {
    pub interfaces: Vec<InterfaceSnapshot>,
    pub default_interface: DefaultInterfaceEvent,
}

pub struct VpnManager {
    api: ApiClient,
    credentials: CredentialStore,
    session: SessionManager,
    platform: Arc<dyn PlatformBridge>,
    route_logger: Mutex<Option<Arc<dyn InterfaceUpdateListener>>>,
    data_dir: PathBuf,
    device_id: String,
    device_name: String,
}

impl VpnManager {
    /// Create a manager on top of the Linux network stack
    #[cfg(target_os = "linux")]
    pub fn new(config: &AppConfig) -> Result<Self, VpnError> {
        let bridge = Arc::new(frkn_tunnel::NetworkBridge::new(
            frkn_tunnel::LinuxStack::new(),
        ));
        Self::with_parts(
            config,
            Arc::new(config.engine_factory()),
            bridge,
            frkn_api::device_id(),
        )
    }

    pub fn with_parts(
        config: &AppConfig,
        factory: Arc<dyn EngineFactory>,
        bridge: Arc<dyn SessionBridge>,
        device_id: String,
    ) -> Result<Self, VpnError> {
        let platform = bridge.clone().platform();
        let session = SessionManager::new(factory, bridge, ConfigStore::new(&config.data_dir));
        session.add_observer(Arc::new(|running: bool| {
            if running {
                info!("VPN connected");
            } else {
                info!("VPN disconnected");
            }
        }));

        Ok(Self {
            api: ApiClient::new(config.api_config())?,
            credentials: CredentialStore::new(&config.data_dir),
            session,
            platform,
            route_logger: Mutex::new(None),
            data_dir: config.data_dir.clone(),
            device_id,
            device_name: config.device_name(),
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Stored credentials, if registered
    pub fn credentials(&self) -> Result<Option<Credentials>, VpnError> {
        Ok(self.credentials.load()?)
    }

    /// Stored credentials, registering first if there are none
    pub async fn ensure_registered(&self) -> Result<Credentials, VpnError> {
        match self.credentials.load()? {
            Some(credentials) => Ok(credentials),
            None => self.register().await,
        }
    }

    /// Register the device and replace stored credentials
    pub async fn register(&self) -> Result<Credentials, VpnError> {
        info!("Registering device {}", self.device_id);
        let response = self.api.register(&self.device_id, &self.device_name).await?;

        let credentials = Credentials {
            device_id: response.device_id,
            device_token: response.device_token,
            referral_code: response.referral_code,
            user_id: response.user_id,
        };
        self.credentials.save(&credentials)?;
        Ok(credentials)
    }

    /// Servers available to this device
    pub async fn servers(&self) -> Result<Vec<ServerDescriptor>, VpnError> {
        let credentials = self.ensure_registered().await?;
        Ok(self.api.fetch_config(&credentials.device_token).await?)
    }

    /// Engine configuration for `server`, using the data directory as cache
    pub fn build_config(&self, server: &ServerDescriptor) -> TunnelConfig {
        TunnelConfig::build(server, Some(&self.data_dir))
    }

    /// Connect through server `index` of the fetched list
    pub async fn connect(&self, index: usize) -> Result<ServerDescriptor, VpnError> {
        let servers = self.servers().await?;
        if servers.is_empty() {
            return Err(VpnError::NoServers);
        }
        let available = servers.len();
        let server = servers
            .into_iter()
            .nth(index)
            .ok_or(VpnError::NoSuchServer { index, available })?;

        info!("Connecting to {}", server);
        self.session.start(self.build_config(&server))?;

        match self.session.wait_until_settled().await {
            SessionState::Running => {
                self.watch_routes().await;
                Ok(server)
            }
            state => {
                let reason = self
                    .session
                    .last_error()
                    .unwrap_or_else(|| format!("session ended {}", state));
                Err(VpnError::StartFailed(reason))
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), VpnError> {
        if !self.session.state().is_running() {
            warn!("Disconnect requested while {}", self.session.state());
        }
        self.unwatch_routes().await;
        self.session.stop_and_wait().await?;
        Ok(())
    }

    /// Interfaces plus the current default interface
    pub async fn network_report(&self) -> NetworkReport {
        let interfaces = self.platform.interfaces().await.collect();

        // Registration delivers the current default interface right away
        let (tx, rx) = watch::channel(DefaultInterfaceEvent::none());
        let listener: Arc<dyn InterfaceUpdateListener> =
            Arc::new(move |event: DefaultInterfaceEvent| {
                let _ = tx.send(event);
            });
        self.platform
            .start_default_interface_monitor(listener.clone())
            .await;
        self.platform.close_default_interface_monitor(&listener);

        let default_interface = rx.borrow().clone();
        NetworkReport {
            interfaces,
            default_interface,
        }
    }

    /// Whether default route changes are being logged
    pub async fn watching_routes(&self) -> bool {
        self.route_logger.lock().await.is_some()
    }

    async fn watch_routes(&self) {
        let mut slot = self.route_logger.lock().await;
        if slot.is_some() {
            return;
        }
        let listener: Arc<dyn InterfaceUpdateListener> = Arc::new(log_default_interface);
        self.platform
            .start_default_interface_monitor(listener.clone())
            .await;
        *slot = Some(listener);
    }

    async fn unwatch_routes(&self) {
        if let Some(listener) = self.route_logger.lock().await.take() {
            self.platform.close_default_interface_monitor(&listener);
        }
    }

    /// Tear everything down
    pub async fn shutdown(self) {
        self.unwatch_routes().await;
        self.session.shutdown().await;
    }
}

fn log_default_interface(event: DefaultInterfaceEvent) {
    if event.is_none() {
        warn!("No default interface");
    } else {
        info!(
            "Default interface {} (index {}{})",
            event.name,
            event.index,
            if event.expensive { ", metered" } else { "" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use frkn_tunnel::{EngineError, LinuxStack, NetworkBridge, PlatformBridge, TunnelEngine};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct StubFactory {
        created: AtomicUsize,
        fail: bool,
    }

    struct StubEngine {
        fail: bool,
    }

    #[async_trait]
    impl TunnelEngine for StubEngine {
        async fn start(&mut self) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::Start("refused".into()));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl EngineFactory for StubFactory {
        fn create(
            &self,
            _config_path: &Path,
            _bridge: Arc<dyn PlatformBridge>,
        ) -> Result<Box<dyn TunnelEngine>, EngineError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubEngine { fail: self.fail }))
        }
    }

    /// Answer each connection with the next canned JSON body
    async fn backend(bodies: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap();
                requests.push(String::from_utf8_lossy(&buf[..n]).into_owned());

                let response = format!(
                    "HTTP/1.1 200 OK\r\n\
                     content-type: application/json\r\n\
                     content-length: {}\r\n\
                     connection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            requests
        });

        (format!("http://{}", addr), handle)
    }

    const REGISTERED: &str = r#"{"user_id":"u1","device_id":"d1","device_token":"tok",
        "referral_code":"REF42","is_new_user":true}"#;
    const ONE_SERVER: &str = r#"{"servers":[{"server_ip":"203.0.113.5","port":443,
        "auth_password":"s3cr3t","insecure":false,"connection_uri":""}]}"#;
    const NO_SERVERS: &str = r#"{"servers":[]}"#;

    fn manager(base_url: String, dir: &Path, factory: Arc<StubFactory>) -> VpnManager {
        let config = AppConfig {
            api_base_url: base_url,
            data_dir: dir.to_path_buf(),
            request_timeout_secs: 5,
            device_name: Some("test-box".into()),
            ..AppConfig::default()
        };
        let bridge = Arc::new(NetworkBridge::new(LinuxStack::new()));
        VpnManager::with_parts(&config, factory, bridge, "machine-1".into()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_registers_once() {
        let dir = tempfile::tempdir().unwrap();
        let (base, server) = backend(vec![REGISTERED, ONE_SERVER, ONE_SERVER]).await;
        let factory = Arc::new(StubFactory::default());
        let vpn = manager(base, dir.path(), factory.clone());
        assert!(!vpn.watching_routes().await);

        let server_used = vpn.connect(0).await.unwrap();
        assert_eq!(server_used.address, "203.0.113.5");
        assert!(vpn.session().is_running());
        assert!(vpn.watching_routes().await);
        assert_eq!(vpn.credentials().unwrap().unwrap().referral_code, "REF42");
        assert!(dir.path().join("config.json").is_file());

        assert_eq!(vpn.servers().await.unwrap().len(), 1);

        vpn.disconnect().await.unwrap();
        assert!(!vpn.session().is_running());
        assert!(!vpn.watching_routes().await);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /api/v1/devices/register"));
        assert!(requests[0].contains(r#""device_id":"machine-1""#));
        assert!(requests[0].contains(r#""name":"test-box""#));
        assert!(requests[1].starts_with("GET /api/v1/devices/config"));
        assert!(requests[2].starts_with("GET /api/v1/devices/config"));
    }

    #[tokio::test]
    async fn test_no_servers() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = backend(vec![REGISTERED, NO_SERVERS]).await;
        let factory = Arc::new(StubFactory::default());
        let vpn = manager(base, dir.path(), factory.clone());

        assert!(matches!(vpn.connect(0).await, Err(VpnError::NoServers)));
        assert_eq!(vpn.session().state(), SessionState::Idle);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_index_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = backend(vec![REGISTERED, ONE_SERVER]).await;
        let vpn = manager(base, dir.path(), Arc::new(StubFactory::default()));

        assert!(matches!(
            vpn.connect(3).await,
            Err(VpnError::NoSuchServer {
                index: 3,
                available: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = backend(vec![REGISTERED, ONE_SERVER]).await;
        let factory = Arc::new(StubFactory {
            fail: true,
            ..StubFactory::default()
        });
        let vpn = manager(base, dir.path(), factory);

        match vpn.connect(0).await {
            Err(VpnError::StartFailed(reason)) => assert!(reason.contains("refused")),
            other => panic!("unexpected result: {:?}", other.map(|s| s.address)),
        }
        assert_eq!(vpn.session().state(), SessionState::Idle);
        assert!(!vpn.watching_routes().await);
    }

    #[tokio::test]
    async fn test_network_report_lists_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let vpn = manager(
            "http://127.0.0.1:9".into(),
            dir.path(),
            Arc::new(StubFactory::default()),
        );

        let report = vpn.network_report().await;
        let lo = report
            .interfaces
            .iter()
            .find(|iface| iface.name == "lo")
            .unwrap();
        assert!(lo.addresses.iter().any(|a| a.starts_with("127.")));
        assert_ne!(report.default_interface.name, "lo");
        assert!(!vpn.watching_routes().await);
    }

    #[tokio::test]
    async fn test_build_config_uses_data_dir_cache() {
        let dir = tempfile::tempdir().unwrap();
        let vpn = manager(
            "http://127.0.0.1:9".into(),
            dir.path(),
            Arc::new(StubFactory::default()),
        );

        let config = vpn.build_config(&ServerDescriptor::new("203.0.113.5", 443, "s3cr3t"));
        let json = config.to_json().unwrap();
        assert!(json.contains(&dir.path().join("cache.db").display().to_string()));
    }
}
