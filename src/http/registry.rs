//! Per-connection streaming client registry. Each `/stream` task registers
//! an entry here for the life of its connection so `/state` can report
//! `clients_stat` and the orchestrator can ask "does anyone care" without
//! reaching into axum at all.

use crate::fps::FpsInstrument;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One streaming client's identity, option flags and per-client fps
/// instrument, owned by the registry for as long as the connection lives.
pub struct ClientEntry {
    pub id: u64,
    pub key: Option<String>,
    pub hostport: String,
    pub extra_headers: bool,
    pub advance_headers: bool,
    pub dual_final_frames: bool,
    pub zero_data: bool,
    pub fps: Arc<FpsInstrument>,
}

pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the stable 64-bit id a new connection registers under.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, entry: ClientEntry) {
        self.clients.lock().insert(entry.id, entry);
    }

    pub fn remove(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Builds the `/state` `stream.clients_stat` map: `{<id_hex>: {fps,
    /// extra_headers, advance_headers, dual_final_frames, zero_data, key}}`.
    pub fn stats_json(&self) -> serde_json::Value {
        let clients = self.clients.lock();
        let map: serde_json::Map<String, serde_json::Value> = clients
            .values()
            .map(|c| {
                let snap = c.fps.snapshot();
                (
                    format!("{:x}", c.id),
                    serde_json::json!({
                        "fps": snap.fps,
                        "extra_headers": c.extra_headers,
                        "advance_headers": c.advance_headers,
                        "dual_final_frames": c.dual_final_frames,
                        "zero_data": c.zero_data,
                        "key": c.key,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a client's entry from the registry when its `/stream` response
/// body is dropped, whether by client disconnect or server shutdown.
pub struct RegistrationGuard {
    registry: Arc<ClientRegistry>,
    id: u64,
}

impl RegistrationGuard {
    pub fn new(registry: Arc<ClientRegistry>, id: u64) -> Self {
        Self { registry, id }
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> ClientEntry {
        ClientEntry {
            id,
            key: None,
            hostport: "127.0.0.1:1".into(),
            extra_headers: false,
            advance_headers: false,
            dual_final_frames: false,
            zero_data: false,
            fps: Arc::new(FpsInstrument::new()),
        }
    }

    #[test]
    fn register_and_remove_tracks_count() {
        let registry = ClientRegistry::new();
        registry.register(entry(1));
        registry.register(entry(2));
        assert_eq!(registry.count(), 2);
        registry.remove(1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn guard_removes_entry_on_drop() {
        let registry = Arc::new(ClientRegistry::new());
        registry.register(entry(7));
        {
            let _guard = RegistrationGuard::new(Arc::clone(&registry), 7);
            assert_eq!(registry.count(), 1);
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn stats_json_keys_clients_by_hex_id() {
        let registry = ClientRegistry::new();
        registry.register(entry(0x2a));
        let stats = registry.stats_json();
        assert!(stats.get("2a").is_some());
    }
}
