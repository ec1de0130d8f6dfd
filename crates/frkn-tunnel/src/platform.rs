//! Platform Interface
//!
//! The callback surface the tunnel engine drives to operate without its own
//! OS privileges: socket protection, virtual interface creation, default
//! interface monitoring and interface enumeration. Hooks the platform does
//! not support are still part of the surface and answer with neutral values.

use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use std::io;
use std::iter::FusedIterator;
use std::net::IpAddr;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Virtual interface request issued by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunOptions {
    /// IPv4 address and prefix
    pub inet4_address: Option<Ipv4Net>,
    /// IPv6 address and prefix
    pub inet6_address: Option<Ipv6Net>,
    /// DNS servers reachable through the interface
    pub dns_servers: Vec<IpAddr>,
    /// Interface MTU
    pub mtu: u32,
}

impl TunOptions {
    /// DNS servers as a single-pass sequence
    pub fn dns_server_addresses(&self) -> Sequence<IpAddr> {
        self.dns_servers.clone().into()
    }
}

/// Interface flag bits as reported to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterfaceFlags(u32);

impl InterfaceFlags {
    pub const UP: Self = Self(1 << 0);
    pub const BROADCAST: Self = Self(1 << 1);
    pub const LOOPBACK: Self = Self(1 << 2);
    pub const POINT_TO_POINT: Self = Self(1 << 3);
    pub const MULTICAST: Self = Self(1 << 4);
    pub const RUNNING: Self = Self(1 << 5);

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for InterfaceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One network interface as seen at enumeration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    /// Interface name
    pub name: String,
    /// OS interface index (0 when unresolvable)
    pub index: u32,
    /// MTU
    pub mtu: u32,
    /// Flag bits
    pub flags: InterfaceFlags,
    /// Addresses in CIDR notation
    pub addresses: Vec<String>,
    /// DNS servers, only for the default-route interface
    pub dns_servers: Option<Vec<String>>,
    /// Metered, only meaningful for the default-route interface
    pub metered: bool,
}

impl InterfaceSnapshot {
    /// DNS servers as a single-pass sequence (empty when not attached)
    pub fn dns_server_sequence(&self) -> Sequence<String> {
        self.dns_servers.clone().unwrap_or_default().into()
    }
}

/// Default route change pushed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultInterfaceEvent {
    /// Interface name, empty when there is no default interface
    pub name: String,
    /// Interface index, -1 when there is no default interface
    pub index: i32,
    /// Network lacks an explicit not-metered capability
    pub expensive: bool,
    /// Network lacks an explicit not-restricted capability
    pub constrained: bool,
}

impl DefaultInterfaceEvent {
    /// The "no network" event
    pub fn none() -> Self {
        Self {
            name: String::new(),
            index: -1,
            expensive: false,
            constrained: false,
        }
    }

    /// Check if this is the "no network" event
    pub fn is_none(&self) -> bool {
        self.index < 0
    }
}

/// Receiver of default interface updates
pub trait InterfaceUpdateListener: Send + Sync {
    fn update_default_interface(&self, event: DefaultInterfaceEvent);
}

impl<F> InterfaceUpdateListener for F
where
    F: Fn(DefaultInterfaceEvent) + Send + Sync,
{
    fn update_default_interface(&self, event: DefaultInterfaceEvent) {
        self(event)
    }
}

/// Wi-Fi association details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiState {
    pub ssid: String,
    pub bssid: String,
}

/// Finite, single-pass sequence handed across the engine boundary
#[derive(Debug)]
pub struct Sequence<T> {
    inner: std::vec::IntoIter<T>,
}

impl<T> Sequence<T> {
    /// An empty sequence
    pub fn empty() -> Self {
        Vec::new().into()
    }

    /// Whether another item is available
    pub fn has_next(&self) -> bool {
        self.inner.len() > 0
    }
}

impl<T> From<Vec<T>> for Sequence<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }
}

impl<T> Iterator for Sequence<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ExactSizeIterator for Sequence<T> {}

impl<T> FusedIterator for Sequence<T> {}

/// Platform bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to protect socket {fd}: {reason}")]
    Protect { fd: RawFd, reason: String },

    #[error("No default interface available")]
    NoDefaultInterface,

    #[error("Virtual interface creation failed: {0}")]
    InterfaceCreation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid interface options: {0}")]
    InvalidOptions(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Check if the OS refused the operation for lack of permission
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, BridgeError::PermissionDenied(_))
            || matches!(self, BridgeError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}

/// Callback surface consumed by the tunnel engine
#[async_trait]
pub trait PlatformBridge: Send + Sync {
    /// Exempt `fd` from the virtual interface's routes
    async fn protect(&self, fd: RawFd) -> Result<(), BridgeError>;

    /// Create the virtual interface and return its descriptor
    async fn open_tun(&self, options: &TunOptions) -> Result<RawFd, BridgeError>;

    /// Whether default interface changes are reported by the platform
    fn uses_platform_default_interface_monitor(&self) -> bool;

    /// Start pushing default interface events to `listener`
    async fn start_default_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>);

    /// Stop pushing events to `listener`
    fn close_default_interface_monitor(&self, listener: &Arc<dyn InterfaceUpdateListener>);

    /// Whether interfaces are enumerated by the platform
    fn uses_platform_interface_getter(&self) -> bool;

    /// Snapshot of every network interface
    async fn interfaces(&self) -> Sequence<InterfaceSnapshot>;

    fn use_procfs(&self) -> bool;

    fn find_connection_owner(
        &self,
        ip_protocol: i32,
        source_address: &str,
        source_port: u16,
        destination_address: &str,
        destination_port: u16,
    ) -> i32;

    fn package_name_by_uid(&self, uid: i32) -> String;

    fn uid_by_package_name(&self, package_name: &str) -> i32;

    fn under_network_extension(&self) -> bool;

    fn include_all_networks(&self) -> bool;

    fn read_wifi_state(&self) -> Option<WifiState>;

    fn clear_dns_cache(&self);
}
