//! Tunnel Configuration
//!
//! Builds the engine configuration document (sing-box JSON) from a
//! [`ServerDescriptor`]. The document is a typed tree so that field order,
//! and therefore the serialized bytes, only depend on the inputs.
//!
//! # Layout
//!
//! ```text
//! dns        cloudflare (DoH via proxy) + local; engine lookups -> local
//! inbounds   tun-in (172.19.0.1/30, fdfe:dcba:9876::1/126, auto/strict route, sniff)
//! outbounds  proxy (hysteria2) | direct | dns-out
//! route      dns -> dns-out, private ip -> direct, rest -> proxy
//! ```

use crate::descriptor::ServerDescriptor;
use crate::platform::TunOptions;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Virtual interface IPv4 address
pub const TUN_INET4_ADDRESS: &str = "172.19.0.1/30";
/// Virtual interface IPv6 address
pub const TUN_INET6_ADDRESS: &str = "fdfe:dcba:9876::1/126";
/// Virtual interface MTU
pub const TUN_MTU: u32 = 9000;
/// Encrypted upstream resolver, reached through the proxy
pub const REMOTE_DNS_ADDRESS: &str = "https://1.1.1.1/dns-query";
/// Cache file name inside the cache directory
pub const CACHE_FILE_NAME: &str = "cache.db";

/// Outbound tags
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const DNS_OUT_TAG: &str = "dns-out";

const TUN_TAG: &str = "tun-in";
const REMOTE_DNS_TAG: &str = "cloudflare";
const LOCAL_DNS_TAG: &str = "local";

/// Complete engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
    pub experimental: Experimental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRule {
    pub outbound: Vec<String>,
    pub server: String,
}

/// Inbound definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun {
        tag: String,
        address: Vec<String>,
        mtu: u32,
        auto_route: bool,
        strict_route: bool,
        sniff: bool,
        sniff_override_destination: bool,
    },
}

/// Outbound definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Hysteria2 {
        tag: String,
        server: String,
        server_port: u16,
        password: String,
        tls: TlsOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        obfs: Option<ObfsOptions>,
    },
    Direct {
        tag: String,
    },
    Dns {
        tag: String,
    },
}

impl Outbound {
    /// Outbound tag
    pub fn tag(&self) -> &str {
        match self {
            Outbound::Hysteria2 { tag, .. }
            | Outbound::Direct { tag }
            | Outbound::Dns { tag } => tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub enabled: bool,
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfsOptions {
    #[serde(rename = "type")]
    pub kind: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSection {
    pub auto_detect_interface: bool,
    pub rules: Vec<RouteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    pub outbound: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experimental {
    pub cache_file: CacheFile,
}

/// Cache file settings. `enabled` is always written out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFile {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TunnelConfig {
    /// Build the document for one session attempt
    pub fn build(server: &ServerDescriptor, cache_dir: Option<&Path>) -> Self {
        let obfs = server.obfuscation().map(|o| ObfsOptions {
            kind: o.kind.to_string(),
            password: o.secret.to_string(),
        });

        let cache_file = match cache_dir {
            Some(dir) => CacheFile {
                enabled: true,
                path: Some(dir.join(CACHE_FILE_NAME).to_string_lossy().into_owned()),
            },
            None => CacheFile {
                enabled: false,
                path: None,
            },
        };

        Self {
            log: LogSection {
                level: "info".into(),
            },
            dns: DnsSection {
                servers: vec![
                    DnsServer {
                        tag: REMOTE_DNS_TAG.into(),
                        address: REMOTE_DNS_ADDRESS.into(),
                        detour: Some(PROXY_TAG.into()),
                    },
                    DnsServer {
                        tag: LOCAL_DNS_TAG.into(),
                        address: "local".into(),
                        detour: None,
                    },
                ],
                // Lookups issued by the engine itself (server hostname etc.)
                // must not go through the tunnel they are setting up
                rules: vec![DnsRule {
                    outbound: vec!["any".into()],
                    server: LOCAL_DNS_TAG.into(),
                }],
            },
            inbounds: vec![Inbound::Tun {
                tag: TUN_TAG.into(),
                address: vec![TUN_INET4_ADDRESS.into(), TUN_INET6_ADDRESS.into()],
                mtu: TUN_MTU,
                auto_route: true,
                strict_route: true,
                sniff: true,
                sniff_override_destination: true,
            }],
            outbounds: vec![
                Outbound::Hysteria2 {
                    tag: PROXY_TAG.into(),
                    server: server.address.clone(),
                    server_port: server.port,
                    password: server.secret.clone(),
                    tls: TlsOptions {
                        enabled: true,
                        insecure: server.insecure,
                    },
                    obfs,
                },
                Outbound::Direct {
                    tag: DIRECT_TAG.into(),
                },
                Outbound::Dns {
                    tag: DNS_OUT_TAG.into(),
                },
            ],
            route: RouteSection {
                auto_detect_interface: true,
                rules: vec![
                    RouteRule {
                        protocol: Some("dns".into()),
                        ip_is_private: None,
                        outbound: DNS_OUT_TAG.into(),
                    },
                    RouteRule {
                        protocol: None,
                        ip_is_private: Some(true),
                        outbound: DIRECT_TAG.into(),
                    },
                ],
            },
            experimental: Experimental { cache_file },
        }
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a previously written document
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The proxy outbound, if present
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag() == PROXY_TAG)
    }

    /// Virtual interface request the engine derives from the tun inbound.
    ///
    /// The DNS server handed to the interface is the host right after the
    /// IPv4 interface address, where the engine answers DNS.
    pub fn tun_options(&self) -> Option<TunOptions> {
        let Inbound::Tun { address, mtu, .. } = self.inbounds.first()?;

        let mut options = TunOptions {
            inet4_address: None,
            inet6_address: None,
            dns_servers: Vec::new(),
            mtu: *mtu,
        };

        for cidr in address {
            match cidr.parse::<IpNet>() {
                Ok(IpNet::V4(net)) if options.inet4_address.is_none() => {
                    options.inet4_address = Some(net);
                    if let Some(dns) = u32::from(net.addr()).checked_add(1) {
                        options.dns_servers.push(IpAddr::V4(Ipv4Addr::from(dns)));
                    }
                }
                Ok(IpNet::V6(net)) if options.inet6_address.is_none() => {
                    options.inet6_address = Some(net);
                }
                _ => {}
            }
        }

        Some(options)
    }
}
