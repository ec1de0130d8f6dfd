//! Platform Network Bridge
//!
//! [`NetworkBridge`] implements the engine callback surface on top of a
//! [`NetworkStack`]. It owns the single virtual interface of the process:
//! opening a new one closes the previous one first, and the session layer
//! releases it on every teardown path.

use crate::lock;
use crate::monitor::{self, DefaultInterfaceMonitor};
use crate::platform::{
    BridgeError, InterfaceSnapshot, InterfaceUpdateListener, PlatformBridge, Sequence, TunOptions,
    WifiState,
};
use crate::stack::{DefaultNetwork, NetworkStack, VirtualInterface};
use async_trait::async_trait;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A bridge operation failed while the engine was running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFault {
    pub fd: RawFd,
    pub reason: String,
}

impl fmt::Display for BridgeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {} could not be protected: {}", self.fd, self.reason)
    }
}

/// What the session layer needs from a bridge besides the engine surface
pub trait SessionBridge: Send + Sync {
    /// The callback surface handed to the engine
    fn platform(self: Arc<Self>) -> Arc<dyn PlatformBridge>;

    /// Close the virtual interface, returning whether one was open
    fn release_tun(&self) -> bool;

    /// Whether a virtual interface is currently open
    fn has_tun(&self) -> bool;

    /// Route bridge faults to the session
    fn attach_faults(&self, sink: mpsc::UnboundedSender<BridgeFault>);
}

/// Bridge between the tunnel engine and the OS network stack
pub struct NetworkBridge<S: NetworkStack> {
    stack: Arc<S>,
    tun: Mutex<Option<Box<dyn VirtualInterface>>>,
    /// Index of the open TUN, 0 when closed
    tun_index: Arc<AtomicU32>,
    monitor: DefaultInterfaceMonitor,
    faults: Mutex<Option<mpsc::UnboundedSender<BridgeFault>>>,
}

impl<S: NetworkStack> NetworkBridge<S> {
    pub fn new(stack: S) -> Self {
        Self {
            stack: Arc::new(stack),
            tun: Mutex::new(None),
            tun_index: Arc::new(AtomicU32::new(0)),
            monitor: DefaultInterfaceMonitor::new(),
            faults: Mutex::new(None),
        }
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    /// Number of registered default interface listeners
    pub fn listener_count(&self) -> usize {
        self.monitor.listener_count()
    }

    async fn physical_network(&self) -> Result<DefaultNetwork, BridgeError> {
        self.stack
            .default_network(monitor::exclusion(&self.tun_index))
            .await?
            .ok_or(BridgeError::NoDefaultInterface)
    }

    fn report_fault(&self, fd: RawFd, reason: String) {
        if let Some(sink) = lock(&self.faults).as_ref() {
            let _ = sink.send(BridgeFault { fd, reason });
        }
    }
}

impl<S: NetworkStack> fmt::Debug for NetworkBridge<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkBridge")
            .field("tun", &*lock(&self.tun))
            .field("listeners", &self.monitor.listener_count())
            .finish()
    }
}

#[async_trait]
impl<S: NetworkStack> PlatformBridge for NetworkBridge<S> {
    async fn protect(&self, fd: RawFd) -> Result<(), BridgeError> {
        let result = match self.physical_network().await {
            Ok(network) => self
                .stack
                .bind_to_interface(fd, &network)
                .map(|()| network)
                .map_err(|e| BridgeError::Protect {
                    fd,
                    reason: e.to_string(),
                }),
            Err(e) => Err(e),
        };

        match result {
            Ok(network) => {
                debug!("Protected socket {} via {}", fd, network.name);
                Ok(())
            }
            Err(e) => {
                error!("Socket protection failed: {}", e);
                self.report_fault(fd, e.to_string());
                Err(e)
            }
        }
    }

    async fn open_tun(&self, options: &TunOptions) -> Result<RawFd, BridgeError> {
        if options.inet4_address.is_none() && options.inet6_address.is_none() {
            return Err(BridgeError::InvalidOptions("no interface address requested".into()));
        }

        if self.release_tun() {
            info!("Closed previous virtual interface");
        }

        let iface = self.stack.create_tun(options).await.inspect_err(|e| {
            error!("Virtual interface creation failed: {}", e);
        })?;

        let fd = iface.fd();
        info!(
            "Opened virtual interface {} (index {}, MTU {})",
            iface.name(),
            iface.index(),
            options.mtu
        );
        self.tun_index.store(iface.index(), Ordering::SeqCst);

        if let Some(previous) = lock(&self.tun).replace(iface) {
            warn!("Replaced concurrently opened interface {}", previous.name());
        }
        Ok(fd)
    }

    fn uses_platform_default_interface_monitor(&self) -> bool {
        true
    }

    async fn start_default_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        self.monitor
            .register(&self.stack, &self.tun_index, listener)
            .await;
    }

    fn close_default_interface_monitor(&self, listener: &Arc<dyn InterfaceUpdateListener>) {
        self.monitor.unregister(listener);
    }

    fn uses_platform_interface_getter(&self) -> bool {
        true
    }

    async fn interfaces(&self) -> Sequence<InterfaceSnapshot> {
        let raw = match self.stack.interfaces() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Interface enumeration failed: {}", e);
                return Sequence::empty();
            }
        };

        let default = match self.physical_network().await {
            Ok(network) => Some(network),
            Err(e) => {
                debug!("No default interface during enumeration: {}", e);
                None
            }
        };

        let dns: Option<Vec<String>> = default.as_ref().map(|_| match self.stack.dns_servers() {
            Ok(servers) => servers.iter().map(ToString::to_string).collect(),
            Err(e) => {
                warn!("Failed to read DNS servers: {}", e);
                Vec::new()
            }
        });

        raw.into_iter()
            .map(|iface| {
                let is_default = default.as_ref().is_some_and(|d| d.name == iface.name);
                InterfaceSnapshot {
                    index: iface.index.unwrap_or(0),
                    mtu: iface.mtu,
                    flags: iface.flags,
                    addresses: iface.addresses.iter().map(ToString::to_string).collect(),
                    dns_servers: if is_default { dns.clone() } else { None },
                    metered: is_default && default.as_ref().is_some_and(|d| d.is_expensive()),
                    name: iface.name,
                }
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn use_procfs(&self) -> bool {
        false
    }

    fn find_connection_owner(
        &self,
        _ip_protocol: i32,
        _source_address: &str,
        _source_port: u16,
        _destination_address: &str,
        _destination_port: u16,
    ) -> i32 {
        -1
    }

    fn package_name_by_uid(&self, _uid: i32) -> String {
        String::new()
    }

    fn uid_by_package_name(&self, _package_name: &str) -> i32 {
        -1
    }

    fn under_network_extension(&self) -> bool {
        false
    }

    fn include_all_networks(&self) -> bool {
        false
    }

    fn read_wifi_state(&self) -> Option<WifiState> {
        None
    }

    fn clear_dns_cache(&self) {}
}

impl<S: NetworkStack> SessionBridge for NetworkBridge<S> {
    fn platform(self: Arc<Self>) -> Arc<dyn PlatformBridge> {
        self
    }

    fn release_tun(&self) -> bool {
        let previous = lock(&self.tun).take();
        match previous {
            Some(iface) => {
                info!("Closing virtual interface {}", iface.name());
                self.tun_index.store(0, Ordering::SeqCst);
                drop(iface);
                true
            }
            None => false,
        }
    }

    fn has_tun(&self) -> bool {
        lock(&self.tun).is_some()
    }

    fn attach_faults(&self, sink: mpsc::UnboundedSender<BridgeFault>) {
        *lock(&self.faults) = Some(sink);
    }
}
