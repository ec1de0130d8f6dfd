//! Linux network stack
//!
//! - TUN devices via `tun-rs`
//! - Route table reads, writes and change notifications via `net-route`
//! - Interface enumeration and socket binding via libc
//! - System DNS servers via the `hickory-resolver` system configuration
//!
//! Creating the interface and installing routes requires root or
//! `CAP_NET_ADMIN`. Routes through the TUN disappear with the interface.

use crate::platform::{BridgeError, InterfaceFlags, TunOptions};
use crate::stack::{
    DefaultNetwork, NetworkCapabilities, NetworkStack, RawInterface, RouteEvent, RouteWatch,
    VirtualInterface,
};
use async_trait::async_trait;
use futures::StreamExt;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::system_conf;
use ipnet::IpNet;
use std::ffi::{CStr, CString};
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Interface name prefixes of cellular modems
const CELLULAR_PREFIXES: &[&str] = &["wwan", "rmnet", "ccmni"];

/// Network stack backed by the Linux kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxStack;

impl LinuxStack {
    pub fn new() -> Self {
        Self
    }
}

/// TUN device owned by the bridge
pub struct LinuxTun {
    device: tun_rs::SyncDevice,
    name: String,
    index: u32,
}

impl fmt::Debug for LinuxTun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxTun")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("fd", &self.device.as_raw_fd())
            .finish()
    }
}

impl VirtualInterface for LinuxTun {
    fn fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u32 {
        self.index
    }
}

#[async_trait]
impl NetworkStack for LinuxStack {
    async fn create_tun(
        &self,
        options: &TunOptions,
    ) -> Result<Box<dyn VirtualInterface>, BridgeError> {
        let mtu = u16::try_from(options.mtu)
            .map_err(|_| BridgeError::InvalidOptions(format!("MTU {} out of range", options.mtu)))?;

        let mut builder = tun_rs::DeviceBuilder::new().mtu(mtu);
        if let Some(v4) = options.inet4_address {
            builder = builder.ipv4(v4.addr(), v4.prefix_len(), None);
        }
        if let Some(v6) = options.inet6_address {
            builder = builder.ipv6(v6.addr(), v6.prefix_len());
        }

        let device = builder.build_sync().map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                BridgeError::PermissionDenied(format!(
                    "TUN creation requires CAP_NET_ADMIN ({})",
                    e
                ))
            } else {
                BridgeError::InterfaceCreation(e.to_string())
            }
        })?;
        device.set_nonblocking(true)?;

        let name = device
            .name()
            .map_err(|e| BridgeError::InterfaceCreation(e.to_string()))?;
        let index = interface_index(&name).ok_or_else(|| {
            BridgeError::InterfaceCreation(format!("interface {} has no index", name))
        })?;

        info!("Created TUN device: {} (MTU: {})", name, mtu);
        if !options.dns_servers.is_empty() {
            debug!("DNS servers through {}: {:?}", name, options.dns_servers);
        }

        install_default_routes(index).await?;

        Ok(Box::new(LinuxTun {
            device,
            name,
            index,
        }))
    }

    fn bind_to_interface(&self, fd: RawFd, network: &DefaultNetwork) -> io::Result<()> {
        let name = CString::new(network.name.as_str()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL")
        })?;
        let bytes = name.as_bytes_with_nul();

        // SAFETY: the option value points at a NUL-terminated name of the given length
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    async fn default_network(&self, exclude: Option<u32>) -> io::Result<Option<DefaultNetwork>> {
        let handle = net_route::Handle::new()?;
        let routes = handle.list().await?;

        let Some(index) = default_route_index(&routes, exclude) else {
            return Ok(None);
        };
        let Some(name) = interface_name(index) else {
            debug!("Default route interface {} vanished", index);
            return Ok(None);
        };

        Ok(Some(DefaultNetwork {
            capabilities: Some(NetworkCapabilities {
                not_metered: !is_cellular(&name),
                not_restricted: true,
            }),
            name,
            index,
        }))
    }

    fn interfaces(&self) -> io::Result<Vec<RawInterface>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

        // SAFETY: on success `head` owns a list released by freeifaddrs below
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut result: Vec<RawInterface> = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: cursor is a live node of the getifaddrs list
            let entry = unsafe { &*cursor };
            cursor = entry.ifa_next;

            if entry.ifa_name.is_null() {
                continue;
            }
            // SAFETY: ifa_name is a NUL-terminated string owned by the list
            let name = unsafe { CStr::from_ptr(entry.ifa_name) }
                .to_string_lossy()
                .into_owned();

            let position = match result.iter().position(|i| i.name == name) {
                Some(position) => position,
                None => {
                    result.push(RawInterface {
                        index: interface_index(&name),
                        mtu: read_mtu(&name),
                        flags: map_flags(entry.ifa_flags),
                        addresses: Vec::new(),
                        name,
                    });
                    result.len() - 1
                }
            };

            // SAFETY: both pointers come from the same list node
            let address = unsafe { interface_address(entry.ifa_addr, entry.ifa_netmask) };
            if let Some(address) = address {
                result[position].addresses.push(address);
            }
        }

        // SAFETY: head was returned by getifaddrs and is freed once
        unsafe { libc::freeifaddrs(head) };
        Ok(result)
    }

    fn dns_servers(&self) -> io::Result<Vec<IpAddr>> {
        let (config, _) = system_conf::read_system_conf().map_err(io::Error::other)?;
        Ok(name_server_ips(&config))
    }

    fn watch_routes(&self) -> io::Result<RouteWatch> {
        let handle = net_route::Handle::new()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = tokio::spawn(async move {
            let stream = handle.route_listen_stream();
            futures::pin_mut!(stream);

            while stream.next().await.is_some() {
                if tx.send(RouteEvent).is_err() {
                    break;
                }
            }
            debug!("Route listener finished");
        });

        Ok(RouteWatch::new(rx).with_watcher(watcher))
    }
}

async fn install_default_routes(index: u32) -> Result<(), BridgeError> {
    let handle = net_route::Handle::new()
        .map_err(|e| BridgeError::Route(format!("failed to create route handle: {}", e)))?;

    for destination in [IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)] {
        let route = net_route::Route::new(destination, 0).with_ifindex(index);
        match handle.add(&route).await {
            Ok(()) => info!("Added route: {}/0 dev {}", destination, index),
            Err(e)
                if e.kind() == io::ErrorKind::AlreadyExists
                    || e.raw_os_error() == Some(libc::EEXIST) =>
            {
                debug!("Route already exists: {}/0 dev {}", destination, index);
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(BridgeError::PermissionDenied(format!(
                    "adding {}/0 requires CAP_NET_ADMIN ({})",
                    destination, e
                )));
            }
            Err(e) => {
                return Err(BridgeError::Route(format!(
                    "failed to add {}/0: {}",
                    destination, e
                )));
            }
        }
    }
    Ok(())
}

/// Interface index of the preferred default route, IPv4 first
fn default_route_index(routes: &[net_route::Route], exclude: Option<u32>) -> Option<u32> {
    let candidates = || {
        routes.iter().filter(move |r| {
            r.prefix == 0
                && r.destination.is_unspecified()
                && r.ifindex.is_some()
                && r.ifindex != exclude
        })
    };

    candidates()
        .find(|r| r.destination.is_ipv4())
        .or_else(|| candidates().next())
        .and_then(|r| r.ifindex)
}

fn is_cellular(name: &str) -> bool {
    CELLULAR_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn interface_index(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    (index != 0).then_some(index)
}

fn interface_name(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];

    // SAFETY: buf holds IF_NAMESIZE bytes as if_indextoname requires
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }

    // SAFETY: on success buf holds a NUL-terminated name
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

fn read_mtu(name: &str) -> u32 {
    let path = format!("/sys/class/net/{}/mtu", name);
    match fs::read_to_string(&path) {
        Ok(value) => value.trim().parse().unwrap_or(0),
        Err(e) => {
            warn!("Failed to read MTU of {}: {}", name, e);
            0
        }
    }
}

fn map_flags(raw: libc::c_uint) -> InterfaceFlags {
    let mapping = [
        (libc::IFF_UP, InterfaceFlags::UP),
        (libc::IFF_BROADCAST, InterfaceFlags::BROADCAST),
        (libc::IFF_LOOPBACK, InterfaceFlags::LOOPBACK),
        (libc::IFF_POINTOPOINT, InterfaceFlags::POINT_TO_POINT),
        (libc::IFF_MULTICAST, InterfaceFlags::MULTICAST),
        (libc::IFF_RUNNING, InterfaceFlags::RUNNING),
    ];

    let mut flags = InterfaceFlags::empty();
    for (bit, flag) in mapping {
        if raw & bit as libc::c_uint != 0 {
            flags.insert(flag);
        }
    }
    flags
}

/// Address and prefix of one getifaddrs entry
///
/// # Safety
///
/// Both pointers must be null or point at valid sockaddr structures.
unsafe fn interface_address(
    addr: *const libc::sockaddr,
    netmask: *const libc::sockaddr,
) -> Option<IpNet> {
    // SAFETY: forwarded from the caller
    let address = unsafe { socket_ip(addr) }?;
    // SAFETY: forwarded from the caller
    let prefix = match unsafe { socket_ip(netmask) } {
        Some(IpAddr::V4(mask)) => u32::from(mask).leading_ones() as u8,
        Some(IpAddr::V6(mask)) => u128::from(mask).leading_ones() as u8,
        None if address.is_ipv4() => 32,
        None => 128,
    };
    IpNet::new(address, prefix).ok()
}

/// # Safety
///
/// `addr` must be null or point at a valid sockaddr structure.
unsafe fn socket_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    if addr.is_null() {
        return None;
    }

    // SAFETY: the family tag tells which sockaddr variant addr points at
    unsafe {
        match i32::from((*addr).sa_family) {
            libc::AF_INET => {
                let sin = &*(addr as *const libc::sockaddr_in);
                Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
            }
            libc::AF_INET6 => {
                let sin6 = &*(addr as *const libc::sockaddr_in6);
                Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
            }
            _ => None,
        }
    }
}

/// Distinct name server addresses, in configuration order
fn name_server_ips(config: &ResolverConfig) -> Vec<IpAddr> {
    let mut servers: Vec<IpAddr> = Vec::new();
    for name_server in config.name_servers() {
        let ip = name_server.socket_addr.ip();
        if !servers.contains(&ip) {
            servers.push(ip);
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::config::NameServerConfigGroup;

    fn route(destination: &str, prefix: u8, ifindex: Option<u32>) -> net_route::Route {
        let route = net_route::Route::new(destination.parse().unwrap(), prefix);
        match ifindex {
            Some(index) => route.with_ifindex(index),
            None => route,
        }
    }

    #[test]
    fn test_default_route_prefers_ipv4() {
        let routes = vec![
            route("192.168.1.0", 24, Some(2)),
            route("::", 0, Some(4)),
            route("0.0.0.0", 0, Some(3)),
        ];
        assert_eq!(default_route_index(&routes, None), Some(3));
    }

    #[test]
    fn test_default_route_excludes_tun() {
        let routes = vec![route("0.0.0.0", 0, Some(9)), route("0.0.0.0", 0, Some(3))];
        assert_eq!(default_route_index(&routes, Some(9)), Some(3));

        let only_tun = vec![route("0.0.0.0", 0, Some(9)), route("::", 0, Some(9))];
        assert_eq!(default_route_index(&only_tun, Some(9)), None);
    }

    #[test]
    fn test_default_route_falls_back_to_ipv6() {
        let routes = vec![route("0.0.0.0", 0, None), route("::", 0, Some(5))];
        assert_eq!(default_route_index(&routes, None), Some(5));
        assert_eq!(default_route_index(&[], None), None);
    }

    #[test]
    fn test_name_servers_are_deduplicated() {
        let ips: Vec<IpAddr> = vec!["192.168.1.1".parse().unwrap(), "fe80::1".parse().unwrap()];
        // one UDP and one TCP entry per address
        let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);

        assert_eq!(config.name_servers().len(), 4);
        assert_eq!(name_server_ips(&config), ips);
        let empty = ResolverConfig::from_parts(None, Vec::new(), NameServerConfigGroup::new());
        assert!(name_server_ips(&empty).is_empty());
    }

    #[test]
    fn test_cellular_names() {
        assert!(is_cellular("rmnet_data0"));
        assert!(is_cellular("wwan0"));
        assert!(!is_cellular("wlan0"));
        assert!(!is_cellular("eth0"));
    }

    #[test]
    fn test_flag_mapping() {
        let raw = (libc::IFF_UP | libc::IFF_RUNNING | libc::IFF_LOOPBACK) as libc::c_uint;
        let flags = map_flags(raw);
        assert!(flags.contains(
            InterfaceFlags::UP | InterfaceFlags::RUNNING | InterfaceFlags::LOOPBACK
        ));
        assert!(!flags.contains(InterfaceFlags::MULTICAST));
    }

    #[test]
    fn test_loopback_is_enumerated() {
        let interfaces = LinuxStack::new().interfaces().unwrap();
        let lo = interfaces.iter().find(|i| i.name == "lo").unwrap();
        assert!(lo.flags.contains(InterfaceFlags::LOOPBACK));
        assert_eq!(lo.index, interface_index("lo"));
        assert!(lo.addresses.iter().any(|a| a.to_string() == "127.0.0.1/8"));
    }
}
