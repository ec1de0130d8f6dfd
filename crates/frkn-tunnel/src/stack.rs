//! OS network stack seam.
//!
//! Everything the bridge needs from the operating system goes through
//! [`NetworkStack`]; the Linux implementation lives in `linux.rs`.

use crate::platform::{BridgeError, DefaultInterfaceEvent, InterfaceFlags, TunOptions};
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capability bits of the active network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub not_metered: bool,
    pub not_restricted: bool,
}

/// The interface currently carrying the default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultNetwork {
    pub name: String,
    pub index: u32,
    /// `None` when the OS offers no capability information
    pub capabilities: Option<NetworkCapabilities>,
}

impl DefaultNetwork {
    pub fn is_expensive(&self) -> bool {
        self.capabilities.is_some_and(|c| !c.not_metered)
    }

    pub fn is_constrained(&self) -> bool {
        self.capabilities.is_some_and(|c| !c.not_restricted)
    }

    pub fn to_event(&self) -> DefaultInterfaceEvent {
        DefaultInterfaceEvent {
            name: self.name.clone(),
            index: i32::try_from(self.index).unwrap_or(i32::MAX),
            expensive: self.is_expensive(),
            constrained: self.is_constrained(),
        }
    }
}

/// Interface as read from the OS, before tagging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInterface {
    pub name: String,
    /// `None` when the index cannot be resolved
    pub index: Option<u32>,
    pub mtu: u32,
    pub flags: InterfaceFlags,
    pub addresses: Vec<IpNet>,
}

/// A live virtual interface. Dropping it closes the descriptor.
pub trait VirtualInterface: Send + Sync + fmt::Debug {
    fn fd(&self) -> RawFd;
    fn name(&self) -> &str;
    fn index(&self) -> u32;
}

/// Route table change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEvent;

/// Route change subscription. Dropping it stops the OS watcher task.
#[derive(Debug)]
pub struct RouteWatch {
    events: mpsc::UnboundedReceiver<RouteEvent>,
    watcher: Option<JoinHandle<()>>,
}

impl RouteWatch {
    pub fn new(events: mpsc::UnboundedReceiver<RouteEvent>) -> Self {
        Self {
            events,
            watcher: None,
        }
    }

    /// Tie the task feeding `events` to this subscription
    pub fn with_watcher(mut self, watcher: JoinHandle<()>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Next change, `None` once the watcher is gone
    pub async fn recv(&mut self) -> Option<RouteEvent> {
        self.events.recv().await
    }

    /// Discard changes already queued
    pub fn drain(&mut self) {
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for RouteWatch {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Operating system network access
#[async_trait]
pub trait NetworkStack: Send + Sync + 'static {
    /// Allocate and configure a TUN interface with default routes through it
    async fn create_tun(
        &self,
        options: &TunOptions,
    ) -> Result<Box<dyn VirtualInterface>, BridgeError>;

    /// Pin a socket to a physical interface
    fn bind_to_interface(&self, fd: RawFd, network: &DefaultNetwork) -> io::Result<()>;

    /// Current default-route interface, ignoring `exclude` (our own TUN)
    async fn default_network(&self, exclude: Option<u32>) -> io::Result<Option<DefaultNetwork>>;

    /// Every interface on the system
    fn interfaces(&self) -> io::Result<Vec<RawInterface>>;

    /// System DNS servers
    fn dns_servers(&self) -> io::Result<Vec<IpAddr>>;

    /// Subscribe to route table changes
    fn watch_routes(&self) -> io::Result<RouteWatch>;
}
