//! Persisted settings
//!
//! The only state that survives a reboot is the address the client endpoint
//! was last bound to, stored as text under `homelink/ip` or `homelink/ip6`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};
use crate::network::ClientEndpoint;

pub const SETTINGS_PREFIX: &str = "homelink/";
pub const KEY_IPV4: &str = "homelink/ip";
pub const KEY_IPV6: &str = "homelink/ip6";

/// Longest textual IPv6 address plus terminator
const MAX_ADDR_VALUE: usize = 46;

/// Key-value collaborator holding persisted settings
pub trait SettingsStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;
    fn erase(&self, key: &str) -> Result<()>;
    /// Visits every entry whose key starts with `prefix`
    fn for_each(&self, prefix: &str, visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn erase(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn for_each(&self, prefix: &str, visit: &mut dyn FnMut(&str, &[u8]) -> Result<()>) -> Result<()> {
        // snapshot so the visitor may touch the store
        let entries: Vec<(String, Vec<u8>)> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in entries {
            visit(&key, &value)?;
        }
        Ok(())
    }
}

/// Saves the endpoint address under the key matching its family
pub fn persist_endpoint(store: &dyn SettingsStore, endpoint: &ClientEndpoint) -> Result<()> {
    let addr = match endpoint.addr() {
        Some(addr) => addr,
        None => {
            debug!("No endpoint address to persist");
            return Ok(());
        }
    };

    let (key, stale) = match addr {
        SocketAddr::V4(_) => (KEY_IPV4, KEY_IPV6),
        SocketAddr::V6(_) => (KEY_IPV6, KEY_IPV4),
    };
    let mut value = addr.ip().to_string().into_bytes();
    value.push(0);

    store.save(key, &value).map_err(|e| {
        error!("Failed to save {}: {}", key, e);
        e
    })?;
    store.erase(stale)?;
    info!("Persisted endpoint address {}", addr.ip());
    Ok(())
}

/// Binds the endpoint to a previously persisted address, if any
pub fn restore_endpoint(store: &dyn SettingsStore, endpoint: &ClientEndpoint) -> Result<Option<SocketAddr>> {
    store.for_each(SETTINGS_PREFIX, &mut |key, value| {
        if key != KEY_IPV4 && key != KEY_IPV6 {
            debug!("Ignoring unknown setting {}", key);
            return Ok(());
        }
        if value.len() > MAX_ADDR_VALUE {
            warn!("Stored value for {} is {} bytes", key, value.len());
            return Err(Error::invalid_argument(format!("{} value too long", key)));
        }
        let text = std::str::from_utf8(value)
            .map_err(|_| Error::invalid_argument(format!("{} is not text", key)))?;
        endpoint.set_ip_str(text).map_err(|e| {
            warn!("Failed to restore {}: {}", key, e);
            e
        })
    })?;

    let restored = endpoint.addr();
    if let Some(addr) = restored {
        info!("Restored endpoint address {}", addr);
    }
    Ok(restored)
}
