//! Named-slot JSON persistence.
//!
//! The gateway treats durable state as opaque named slots (`slot → JSON`).
//! Reads that fail fall back to the caller's default; writes that fail are
//! logged and swallowed. No slot failure may propagate into a handler.

use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    tokio::fs,
    tracing::warn,
};

/// Well-known slot names. Values are opaque to the gateway.
pub mod slots {
    pub const DEVICE_PAIRS: &str = "rpc.device_pairs";
    pub const NODE_TOKENS: &str = "rpc.node_tokens";
    pub const EXEC_APPROVALS: &str = "rpc.exec_approvals";
    pub const NODE_EXEC_APPROVALS: &str = "rpc.node_exec_approvals";
    pub const CRON_RUNS: &str = "rpc.cron_runs";
    pub const UPDATE_STATUS: &str = "rpc.update_status";
    pub const LAST_HEARTBEAT: &str = "rpc.last_heartbeat";
    pub const WHATSAPP_LOGIN: &str = "rpc.whatsapp_login";
    pub const TTS: &str = "rpc.tts";
    pub const VOICEWAKE: &str = "rpc.voicewake";
    pub const TALK_CONFIG: &str = "rpc.talk_config";
    pub const WIZARD: &str = "rpc.wizard";
    pub const ALERTS_LIFECYCLE: &str = "rpc.alerts_lifecycle";
    pub const WORKER_STATUS: &str = "control_plane.worker_status";
    pub const AUTH_PROFILE_USAGE: &str = "auth.profile_usage";
}

/// Slot-keyed JSON store.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Read a slot. Missing or unreadable slots return `default`.
    async fn load(&self, slot: &str, default: serde_json::Value) -> serde_json::Value;

    /// Write a slot. Best-effort: failures are logged, never returned.
    async fn save(&self, slot: &str, value: &serde_json::Value);
}

// ── File-backed store ────────────────────────────────────────────────────────

/// One JSON file per slot under `<root>/state/`, written atomically
/// (tmp + rename, previous file kept as `.bak`).
pub struct FileSlotStore {
    root: PathBuf,
}

impl FileSlotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Store rooted at `~/.tether`.
    pub fn default_path() -> Result<Self> {
        let home = dirs_next::home_dir().context("cannot determine home directory")?;
        Ok(Self::new(home.join(".tether")))
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        // Slot names contain dots, not path separators; sanitize anyway.
        let safe: String = slot
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join("state").join(format!("{safe}.json"))
    }

    async fn write_atomic(&self, slot: &str, json: &str) -> Result<()> {
        let path = self.slot_path(slot);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            let bak = path.with_extension("json.bak");
            let _ = fs::rename(&path, &bak).await;
        }
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SlotStore for FileSlotStore {
    async fn load(&self, slot: &str, default: serde_json::Value) -> serde_json::Value {
        let path = self.slot_path(slot);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return default,
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(slot, error = %e, "slot contains invalid JSON, using default");
                default
            },
        }
    }

    async fn save(&self, slot: &str, value: &serde_json::Value) {
        let json = match serde_json::to_string_pretty(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(slot, error = %e, "slot value not serializable");
                return;
            },
        };
        if let Err(e) = self.write_atomic(slot, &json).await {
            warn!(slot, error = %e, "slot write failed");
        }
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Volatile store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: tokio::sync::RwLock<std::collections::HashMap<String, serde_json::Value>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn load(&self, slot: &str, default: serde_json::Value) -> serde_json::Value {
        self.slots.read().await.get(slot).cloned().unwrap_or(default)
    }

    async fn save(&self, slot: &str, value: &serde_json::Value) {
        self.slots
            .write()
            .await
            .insert(slot.to_string(), value.clone());
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_slot_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSlotStore::new(dir.path().to_path_buf());
        let value = store
            .load(slots::LAST_HEARTBEAT, serde_json::json!({"ts": null}))
            .await;
        assert_eq!(value, serde_json::json!({"ts": null}));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSlotStore::new(dir.path().to_path_buf());
        let payload = serde_json::json!({"pending": [], "paired": [{"deviceId": "d1"}]});
        store.save(slots::DEVICE_PAIRS, &payload).await;
        let value = store.load(slots::DEVICE_PAIRS, serde_json::json!({})).await;
        assert_eq!(value, payload);
    }

    #[tokio::test]
    async fn rewrite_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSlotStore::new(dir.path().to_path_buf());
        store.save("rpc.tts", &serde_json::json!({"enabled": false})).await;
        store.save("rpc.tts", &serde_json::json!({"enabled": true})).await;
        let value = store.load("rpc.tts", serde_json::json!({})).await;
        assert_eq!(value["enabled"], serde_json::json!(true));
        assert!(dir.path().join("state/rpc.tts.json.bak").exists());
    }

    #[tokio::test]
    async fn corrupt_slot_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSlotStore::new(dir.path().to_path_buf());
        let path = dir.path().join("state");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("rpc.wizard.json"), b"{not json").unwrap();
        let value = store.load(slots::WIZARD, serde_json::json!({"step": 0})).await;
        assert_eq!(value, serde_json::json!({"step": 0}));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemorySlotStore::new();
        store.save("rpc.voicewake", &serde_json::json!({"enabled": true})).await;
        let value = store.load("rpc.voicewake", serde_json::json!({})).await;
        assert_eq!(value["enabled"], serde_json::json!(true));
    }
}
