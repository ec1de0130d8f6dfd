//! Default interface monitor.
//!
//! Listeners get the current default interface as soon as they register,
//! then one event per route table change. Route changes arrive on a channel
//! fed by the OS watcher; a forwarding task resolves the new default
//! interface and fans it out, so the OS side never waits on a listener.

use crate::lock;
use crate::platform::{DefaultInterfaceEvent, InterfaceUpdateListener};
use crate::stack::NetworkStack;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Listeners = Arc<Mutex<Vec<Arc<dyn InterfaceUpdateListener>>>>;

pub(crate) struct DefaultInterfaceMonitor {
    listeners: Listeners,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultInterfaceMonitor {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            forwarder: Mutex::new(None),
        }
    }

    /// Number of registered listeners
    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Register a listener; registering the same listener twice is a no-op
    pub(crate) async fn register<S: NetworkStack>(
        &self,
        stack: &Arc<S>,
        tun_index: &Arc<AtomicU32>,
        listener: Arc<dyn InterfaceUpdateListener>,
    ) {
        if contains(&lock(&self.listeners), &listener) {
            debug!("Default interface listener already registered");
            return;
        }

        let event = current_event(stack.as_ref(), tun_index).await;
        debug!("Initial default interface: {:?}", event);
        listener.update_default_interface(event);

        let first = {
            let mut listeners = lock(&self.listeners);
            if contains(&listeners, &listener) {
                return;
            }
            listeners.push(listener);
            listeners.len() == 1
        };

        if first {
            self.spawn_forwarder(stack.clone(), tun_index.clone());
        }
    }

    /// Remove a listener; unknown listeners are ignored. Once this returns
    /// the listener receives nothing further, so it must not be called from
    /// inside a listener.
    pub(crate) fn unregister(&self, listener: &Arc<dyn InterfaceUpdateListener>) {
        let now_empty = {
            let mut listeners = lock(&self.listeners);
            let before = listeners.len();
            listeners.retain(|l| !same_listener(l, listener));
            if listeners.len() == before {
                return;
            }
            listeners.is_empty()
        };

        if now_empty {
            if let Some(task) = lock(&self.forwarder).take() {
                task.abort();
                info!("Default interface monitor stopped");
            }
        }
    }

    fn spawn_forwarder<S: NetworkStack>(&self, stack: Arc<S>, tun_index: Arc<AtomicU32>) {
        let mut routes = match stack.watch_routes() {
            Ok(routes) => routes,
            Err(e) => {
                warn!(
                    "Route monitoring unavailable, default interface updates disabled: {}",
                    e
                );
                return;
            }
        };

        let listeners = self.listeners.clone();
        let task = tokio::spawn(async move {
            while routes.recv().await.is_some() {
                // Route changes come in bursts; one lookup covers the burst
                routes.drain();

                let event = current_event(stack.as_ref(), &tun_index).await;
                debug!("Default interface changed: {:?}", event);

                // Delivered under the lock so unregister waits for the fan-out
                for listener in lock(&listeners).iter() {
                    listener.update_default_interface(event.clone());
                }
            }
            debug!("Route watcher closed");
        });

        if let Some(previous) = lock(&self.forwarder).replace(task) {
            previous.abort();
        }
        info!("Default interface monitor started");
    }
}

impl Drop for DefaultInterfaceMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.forwarder).take() {
            task.abort();
        }
    }
}

/// Resolve the default interface, answering "no network" on lookup errors
pub(crate) async fn current_event<S: NetworkStack>(
    stack: &S,
    tun_index: &AtomicU32,
) -> DefaultInterfaceEvent {
    match stack.default_network(exclusion(tun_index)).await {
        Ok(Some(network)) => network.to_event(),
        Ok(None) => DefaultInterfaceEvent::none(),
        Err(e) => {
            warn!("Default route lookup failed: {}", e);
            DefaultInterfaceEvent::none()
        }
    }
}

/// Our own TUN index, if one is open
pub(crate) fn exclusion(tun_index: &AtomicU32) -> Option<u32> {
    match tun_index.load(Ordering::SeqCst) {
        0 => None,
        index => Some(index),
    }
}

fn contains(
    listeners: &[Arc<dyn InterfaceUpdateListener>],
    listener: &Arc<dyn InterfaceUpdateListener>,
) -> bool {
    listeners.iter().any(|l| same_listener(l, listener))
}

fn same_listener(
    a: &Arc<dyn InterfaceUpdateListener>,
    b: &Arc<dyn InterfaceUpdateListener>,
) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
