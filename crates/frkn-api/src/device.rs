//! Device identity.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const MACHINE_ID: &str = "/etc/machine-id";
const HOSTNAME_SOURCES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Stable identifier of this machine
pub fn device_id() -> String {
    device_id_from(Path::new(MACHINE_ID))
}

/// Read the id from `path`, falling back to `unknown-<unix millis>`
pub fn device_id_from(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        Ok(_) => fallback_id(),
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("unknown-{}", millis)
}

/// Human-readable device name reported at registration
pub fn device_name() -> String {
    HOSTNAME_SOURCES
        .iter()
        .find_map(|path| {
            fs::read_to_string(path)
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "linux".to_string())
}
