//! In-memory fakes for the OS stack and the engine.

use crate::config::TunnelConfig;
use crate::descriptor::ServerDescriptor;
use crate::engine::{EngineError, EngineFactory, TunnelEngine};
use crate::platform::{BridgeError, InterfaceFlags, PlatformBridge, TunOptions};
use crate::stack::{
    DefaultNetwork, NetworkCapabilities, NetworkStack, RawInterface, RouteEvent, RouteWatch,
    VirtualInterface,
};
use async_trait::async_trait;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The interface options the built document requests
pub(crate) fn options() -> TunOptions {
    TunnelConfig::build(&ServerDescriptor::new("203.0.113.5", 443, "s3cr3t"), None)
        .tun_options()
        .unwrap()
}

#[derive(Default)]
struct StackState {
    network: Mutex<Option<DefaultNetwork>>,
    interfaces: Mutex<Vec<RawInterface>>,
    dns: Mutex<Vec<IpAddr>>,
    tun_delay: Mutex<Duration>,
    deny_tun: AtomicBool,
    live: Arc<AtomicUsize>,
    created: AtomicUsize,
    bound: Mutex<Vec<(RawFd, String)>>,
    last_exclusion: Mutex<Option<u32>>,
    routes: Mutex<Vec<mpsc::UnboundedSender<RouteEvent>>>,
    watchers: Arc<AtomicUsize>,
}

/// Counts live route watcher tasks
struct WatcherGuard(Arc<AtomicUsize>);

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable network stack
#[derive(Clone, Default)]
pub(crate) struct FakeStack {
    state: Arc<StackState>,
}

impl FakeStack {
    pub(crate) const TUN_INDEX: u32 = 99;

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn network(name: &str, index: u32, not_metered: bool) -> DefaultNetwork {
        DefaultNetwork {
            name: name.into(),
            index,
            capabilities: Some(NetworkCapabilities {
                not_metered,
                not_restricted: true,
            }),
        }
    }

    pub(crate) fn set_network(&self, network: Option<DefaultNetwork>) {
        *self.state.network.lock().unwrap() = network;
    }

    pub(crate) fn set_dns(&self, servers: Vec<IpAddr>) {
        *self.state.dns.lock().unwrap() = servers;
    }

    pub(crate) fn set_tun_delay(&self, delay: Duration) {
        *self.state.tun_delay.lock().unwrap() = delay;
    }

    pub(crate) fn deny_tun(&self) {
        self.state.deny_tun.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_interface(
        &self,
        name: &str,
        index: Option<u32>,
        flags: InterfaceFlags,
        addresses: &[&str],
    ) {
        self.state.interfaces.lock().unwrap().push(RawInterface {
            name: name.into(),
            index,
            mtu: 1500,
            flags,
            addresses: addresses.iter().map(|a| a.parse::<IpNet>().unwrap()).collect(),
        });
    }

    pub(crate) fn trigger_route_change(&self) {
        for tx in self.state.routes.lock().unwrap().iter() {
            let _ = tx.send(RouteEvent);
        }
    }

    /// Interfaces created so far
    pub(crate) fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Interfaces created and not yet dropped
    pub(crate) fn live_interfaces(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub(crate) fn bound(&self) -> Vec<(RawFd, String)> {
        self.state.bound.lock().unwrap().clone()
    }

    pub(crate) fn last_exclusion(&self) -> Option<u32> {
        *self.state.last_exclusion.lock().unwrap()
    }

    /// Route watcher tasks still running
    pub(crate) fn live_watchers(&self) -> usize {
        self.state.watchers.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct FakeInterface {
    fd: RawFd,
    name: String,
    live: Arc<AtomicUsize>,
}

impl VirtualInterface for FakeInterface {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u32 {
        FakeStack::TUN_INDEX
    }
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkStack for FakeStack {
    async fn create_tun(
        &self,
        _options: &TunOptions,
    ) -> Result<Box<dyn VirtualInterface>, BridgeError> {
        let delay = *self.state.tun_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.deny_tun.load(Ordering::SeqCst) {
            return Err(BridgeError::PermissionDenied("CAP_NET_ADMIN required".into()));
        }

        let n = self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInterface {
            fd: 100 + n as RawFd,
            name: format!("tun{}", n),
            live: self.state.live.clone(),
        }))
    }

    fn bind_to_interface(&self, fd: RawFd, network: &DefaultNetwork) -> io::Result<()> {
        self.state.bound.lock().unwrap().push((fd, network.name.clone()));
        Ok(())
    }

    async fn default_network(&self, exclude: Option<u32>) -> io::Result<Option<DefaultNetwork>> {
        *self.state.last_exclusion.lock().unwrap() = exclude;
        Ok(self.state.network.lock().unwrap().clone())
    }

    fn interfaces(&self) -> io::Result<Vec<RawInterface>> {
        Ok(self.state.interfaces.lock().unwrap().clone())
    }

    fn dns_servers(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.state.dns.lock().unwrap().clone())
    }

    fn watch_routes(&self) -> io::Result<RouteWatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.routes.lock().unwrap().push(tx);

        let guard = WatcherGuard(self.state.watchers.clone());
        guard.0.fetch_add(1, Ordering::SeqCst);
        let watcher = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await
        });
        Ok(RouteWatch::new(rx).with_watcher(watcher))
    }
}

/// What the fake engine does and what happened to it
#[derive(Default)]
pub(crate) struct EngineScript {
    pub open_tun: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_close: AtomicBool,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub configs: Mutex<Vec<PathBuf>>,
    /// Exit notice of the running engine
    pub exit: Mutex<Option<oneshot::Sender<String>>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngineFactory {
    pub script: Arc<EngineScript>,
}

impl FakeEngineFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Engines built by this factory open the virtual interface on start
    pub(crate) fn opening_tun(self) -> Self {
        self.script.open_tun.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn created(&self) -> usize {
        self.script.created.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.script.closed.load(Ordering::SeqCst)
    }

    /// Make the running engine stop on its own
    pub(crate) fn exit(&self, reason: &str) -> bool {
        match self.script.exit.lock().unwrap().take() {
            Some(tx) => tx.send(reason.to_string()).is_ok(),
            None => false,
        }
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(
        &self,
        config_path: &Path,
        bridge: Arc<dyn PlatformBridge>,
    ) -> Result<Box<dyn TunnelEngine>, EngineError> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        self.script.configs.lock().unwrap().push(config_path.to_path_buf());
        Ok(Box::new(FakeEngine {
            script: self.script.clone(),
            bridge,
        }))
    }
}

struct FakeEngine {
    script: Arc<EngineScript>,
    bridge: Arc<dyn PlatformBridge>,
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        if self.script.open_tun.load(Ordering::SeqCst) {
            self.bridge.open_tun(&options()).await?;
        }
        if self.script.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("scripted failure".into()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.script.exit.lock().unwrap().take();
        self.script.closed.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::Close("scripted failure".into()));
        }
        Ok(())
    }

    fn exit_notice(&mut self) -> Option<oneshot::Receiver<String>> {
        let (tx, rx) = oneshot::channel();
        *self.script.exit.lock().unwrap() = Some(tx);
        Some(rx)
    }
}
