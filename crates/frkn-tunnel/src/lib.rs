//! FRKN Tunnel - Session Orchestration for a sing-box Engine
//!
//! Turns a proxy server descriptor into an engine configuration document,
//! runs a single tunnel session, and gives the engine the network
//! capabilities it cannot obtain itself.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   build    ┌───────────────┐
//! │ServerDescriptor│──────────▶│ TunnelConfig  │
//! └───────────────┘            └───────┬───────┘
//!                                      │ start
//!                                      ▼
//!                              ┌───────────────┐   create/start/close   ┌──────────────┐
//!                              │SessionManager │───────────────────────▶│ TunnelEngine │
//!                              └───────┬───────┘                        └──────┬───────┘
//!                                      │ release / faults                      │ callbacks
//!                                      ▼                                       ▼
//!                              ┌─────────────────────────────────────────────────────┐
//!                              │            NetworkBridge (PlatformBridge)           │
//!                              └──────────────────────────┬──────────────────────────┘
//!                                                         │
//!                                                         ▼
//!                                               NetworkStack (LinuxStack)
//! ```
//!
//! # Features
//!
//! - **Deterministic configuration**: equal descriptors give byte-identical documents
//! - **Single session**: duplicate starts are dropped, start/stop are serialized
//! - **Socket protection**: engine sockets are pinned to the physical interface
//! - **Route monitoring**: default interface changes are pushed to the engine

mod bridge;
mod config;
mod descriptor;
mod engine;
mod monitor;
mod platform;
mod session;
mod stack;
mod store;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(test)]
mod testing;

pub use bridge::{BridgeFault, NetworkBridge, SessionBridge};
pub use config::{
    CacheFile, DnsRule, DnsSection, DnsServer, Experimental, Inbound, LogSection, ObfsOptions,
    Outbound, RouteRule, RouteSection, TlsOptions, TunnelConfig, CACHE_FILE_NAME, DIRECT_TAG,
    DNS_OUT_TAG, PROXY_TAG, REMOTE_DNS_ADDRESS, TUN_INET4_ADDRESS, TUN_INET6_ADDRESS, TUN_MTU,
};
pub use descriptor::{DescriptorError, Obfuscation, ServerDescriptor};
pub use engine::{
    EngineError, EngineFactory, ProcessEngine, ProcessEngineFactory, TunnelEngine,
    DEFAULT_STARTUP_GRACE,
};
pub use platform::{
    BridgeError, DefaultInterfaceEvent, InterfaceFlags, InterfaceSnapshot,
    InterfaceUpdateListener, PlatformBridge, Sequence, TunOptions, WifiState,
};
pub use session::{ObserverId, SessionError, SessionManager, SessionState, StateObserver};
pub use stack::{
    DefaultNetwork, NetworkCapabilities, NetworkStack, RawInterface, RouteEvent, RouteWatch,
    VirtualInterface,
};
pub use store::{ConfigStore, StoreError, CONFIG_FILE_NAME};

#[cfg(target_os = "linux")]
pub use linux::{LinuxStack, LinuxTun};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
