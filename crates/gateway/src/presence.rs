//! In-memory presence roster: clients connected to the gateway, plus the
//! gateway itself (`reason = self`, never evicted).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const TTL_MS: u64 = 5 * 60 * 1000;
const MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub instance_id: String,
    /// Last update, epoch ms.
    pub ts: u64,
    /// self | connect | periodic
    pub reason: String,
    /// ui | webchat | cli | backend | node
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_input_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip)]
    connection_key: Option<String>,
}

/// Fields a presence update may carry; unset fields keep prior values.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub reason: String,
    pub mode: String,
    pub last_input_seconds: Option<u64>,
    pub ip: Option<String>,
    pub host: Option<String>,
    pub version: Option<String>,
    pub connection_key: Option<String>,
}

/// TTL- and cap-bounded roster. Keys are case-insensitive instance ids.
#[derive(Default)]
pub struct PresenceStore {
    entries: HashMap<String, PresenceEntry>,
    /// connection_key → roster key, for removal on disconnect.
    by_connection: HashMap<String, String>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: u64) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.reason != "self" && now.saturating_sub(e.ts) > TTL_MS)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(entry) = self.entries.remove(&key)
                && let Some(conn) = entry.connection_key
            {
                self.by_connection.remove(&conn);
            }
        }
        while self.entries.len() > MAX_ENTRIES {
            // LRU eviction by ts; the self entry is pinned.
            let Some(oldest) = self
                .entries
                .iter()
                .filter(|(_, e)| e.reason != "self")
                .min_by_key(|(_, e)| e.ts)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest)
                && let Some(conn) = entry.connection_key
            {
                self.by_connection.remove(&conn);
            }
        }
    }

    pub fn upsert(&mut self, instance_id: &str, update: PresenceUpdate, now: u64) -> PresenceEntry {
        let key = instance_id.trim().to_lowercase();
        if let Some(conn) = &update.connection_key {
            if let Some(old_key) = self.by_connection.get(conn).cloned()
                && old_key != key
            {
                self.entries.remove(&old_key);
            }
            self.by_connection.insert(conn.clone(), key.clone());
        }
        let existing = self.entries.get(&key);
        let entry = PresenceEntry {
            instance_id: instance_id.trim().to_string(),
            ts: now,
            reason: update.reason,
            mode: update.mode,
            last_input_seconds: update
                .last_input_seconds
                .or_else(|| existing.and_then(|e| e.last_input_seconds)),
            ip: update.ip.or_else(|| existing.and_then(|e| e.ip.clone())),
            host: update.host.or_else(|| existing.and_then(|e| e.host.clone())),
            version: update
                .version
                .or_else(|| existing.and_then(|e| e.version.clone())),
            connection_key: update
                .connection_key
                .or_else(|| existing.and_then(|e| e.connection_key.clone())),
        };
        self.entries.insert(key, entry.clone());
        self.prune(now);
        entry
    }

    /// Remove the entry bound to a connection (disconnect path).
    pub fn remove_by_connection(&mut self, connection_key: &str) -> bool {
        let Some(key) = self.by_connection.remove(connection_key) else {
            return false;
        };
        self.entries.remove(&key).is_some()
    }

    /// Register the gateway itself. Pinned against TTL and LRU eviction.
    pub fn register_gateway(&mut self, host: &str, port: u16, now: u64) -> PresenceEntry {
        self.upsert(
            &format!("gateway:{host}:{port}"),
            PresenceUpdate {
                reason: "self".into(),
                mode: "backend".into(),
                host: Some(host.to_string()),
                ..PresenceUpdate::default()
            },
            now,
        )
    }

    /// Current roster after pruning, most recent first.
    pub fn list(&mut self, now: u64) -> Vec<PresenceEntry> {
        self.prune(now);
        let mut out: Vec<_> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| b.ts.cmp(&a.ts));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(reason: &str) -> PresenceUpdate {
        PresenceUpdate {
            reason: reason.into(),
            mode: "ui".into(),
            ..PresenceUpdate::default()
        }
    }

    #[test]
    fn ttl_evicts_stale_entries() {
        let mut store = PresenceStore::new();
        store.upsert("a", update("connect"), 0);
        let entries = store.list(TTL_MS + 1);
        assert!(entries.is_empty());
    }

    #[test]
    fn self_entry_survives_ttl_and_cap() {
        let mut store = PresenceStore::new();
        store.register_gateway("127.0.0.1", 18790, 0);
        for i in 0..(MAX_ENTRIES + 20) {
            store.upsert(&format!("client-{i}"), update("connect"), 10);
        }
        assert!(store.len() <= MAX_ENTRIES);
        let entries = store.list(TTL_MS + 100);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "self");
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let mut store = PresenceStore::new();
        for i in 0..(MAX_ENTRIES + 1) {
            store.upsert(&format!("client-{i}"), update("connect"), i as u64);
        }
        assert_eq!(store.len(), MAX_ENTRIES);
        let entries = store.list(MAX_ENTRIES as u64);
        assert!(!entries.iter().any(|e| e.instance_id == "client-0"));
    }

    #[test]
    fn remove_by_connection_drops_entry() {
        let mut store = PresenceStore::new();
        store.upsert(
            "web-1",
            PresenceUpdate {
                reason: "connect".into(),
                mode: "ui".into(),
                connection_key: Some("rpc_x".into()),
                ..PresenceUpdate::default()
            },
            0,
        );
        assert!(store.remove_by_connection("rpc_x"));
        assert!(store.list(1).is_empty());
    }

    #[test]
    fn upsert_preserves_prior_fields() {
        let mut store = PresenceStore::new();
        store.upsert(
            "web-1",
            PresenceUpdate {
                reason: "connect".into(),
                mode: "ui".into(),
                host: Some("mac".into()),
                ..PresenceUpdate::default()
            },
            0,
        );
        let entry = store.upsert("web-1", update("periodic"), 5);
        assert_eq!(entry.host.as_deref(), Some("mac"));
        assert_eq!(entry.reason, "periodic");
    }
}
