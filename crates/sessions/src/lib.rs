//! Session store: per-session message history, metadata, usage counters.
//!
//! Sessions are keyed by an opaque `sessionKey` (`main`, `telegram:1234`,
//! `node:mac-1`, …). The store is process-local; the gateway only reaches
//! it through [`SessionStore`].

use std::collections::{BTreeMap, HashMap};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub ts_ms: u64,
}

/// One usage sample, recorded per completed agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub ts_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Aggregated usage totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub runs: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    fn add(&mut self, sample: &UsageSample) {
        self.runs += 1;
        self.input_tokens += sample.input_tokens;
        self.output_tokens += sample.output_tokens;
        self.cost_usd += sample.cost_usd;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub key: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub messages: Vec<SessionMessage>,
    pub usage: Vec<UsageSample>,
}

impl Session {
    fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "sessionKey": self.key,
            "createdAtMs": self.created_at_ms,
            "updatedAtMs": self.updated_at_ms,
            "messageCount": self.messages.len(),
            "metadata": self.metadata,
        })
    }
}

/// Outcome of a metadata patch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub changed: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Keep this many trailing messages when compacting.
const COMPACT_KEEP_TAIL: usize = 20;

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, key: &str, now_ms: u64) -> Session {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session {
                key: key.to_string(),
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
                ..Session::default()
            })
            .clone()
    }

    pub async fn list(&self) -> Vec<serde_json::Value> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<_> = sessions.values().collect();
        out.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        out.iter().map(|s| s.summary()).collect()
    }

    /// Resolve a caller-supplied key: exact match wins, else a unique
    /// prefix match, else the key names a fresh session.
    pub async fn resolve(&self, key: &str) -> (String, bool) {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(key) {
            return (key.to_string(), true);
        }
        let matches: Vec<_> = sessions
            .keys()
            .filter(|k| k.starts_with(key))
            .cloned()
            .collect();
        if matches.len() == 1 {
            return (matches.into_iter().next().unwrap_or_default(), true);
        }
        (key.to_string(), false)
    }

    pub async fn append_message(
        &self,
        key: &str,
        role: &str,
        content: &str,
        now_ms: u64,
    ) -> Session {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.to_string()).or_insert_with(|| Session {
            key: key.to_string(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            ..Session::default()
        });
        session.messages.push(SessionMessage {
            role: role.to_string(),
            content: content.to_string(),
            ts_ms: now_ms,
        });
        session.updated_at_ms = now_ms;
        session.clone()
    }

    /// Last `limit` messages, oldest first.
    pub async fn history(&self, key: &str, limit: usize) -> Vec<SessionMessage> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(key) else {
            return Vec::new();
        };
        let skip = session.messages.len().saturating_sub(limit);
        session.messages[skip..].to_vec()
    }

    /// Metadata patch with the fixed field set plus a free-form merge.
    pub async fn patch(
        &self,
        key: &str,
        params: &serde_json::Value,
        now_ms: u64,
    ) -> Result<PatchOutcome> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| Error::SessionNotFound(key.into()))?;
        let mut changed = false;
        for field in [
            "label",
            "thinkingLevel",
            "verboseLevel",
            "reasoningLevel",
            "sendPolicy",
            "model",
        ] {
            if let Some(value) = params.get(field) {
                session.metadata.insert(field.into(), value.clone());
                changed = true;
            }
        }
        if let Some(labels) = params.get("labels").and_then(|v| v.as_array()) {
            session
                .metadata
                .insert("labels".into(), serde_json::Value::Array(labels.clone()));
            changed = true;
        }
        if let Some(custom) = params.get("metadata").and_then(|v| v.as_object()) {
            for (k, v) in custom {
                session.metadata.insert(k.clone(), v.clone());
            }
            changed = true;
        }
        if changed {
            session.updated_at_ms = now_ms;
        }
        Ok(PatchOutcome {
            changed,
            metadata: session.metadata.clone(),
        })
    }

    /// Drop history, keep metadata and usage.
    pub async fn reset(&self, key: &str, now_ms: u64) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| Error::SessionNotFound(key.into()))?;
        session.messages.clear();
        session.updated_at_ms = now_ms;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::SessionNotFound(key.into()))
    }

    /// Collapse everything but the tail into a single summary message.
    /// Returns the number of messages dropped.
    pub async fn compact(&self, key: &str, now_ms: u64) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| Error::SessionNotFound(key.into()))?;
        if session.messages.len() <= COMPACT_KEEP_TAIL {
            return Ok(0);
        }
        let dropped = session.messages.len() - COMPACT_KEEP_TAIL;
        let tail = session.messages.split_off(dropped);
        session.messages = vec![SessionMessage {
            role: "system".into(),
            content: format!("[compacted {dropped} earlier messages]"),
            ts_ms: now_ms,
        }];
        session.messages.extend(tail);
        session.updated_at_ms = now_ms;
        Ok(dropped)
    }

    pub async fn record_usage(&self, key: &str, sample: UsageSample) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.to_string()).or_insert_with(|| Session {
            key: key.to_string(),
            created_at_ms: sample.ts_ms,
            updated_at_ms: sample.ts_ms,
            ..Session::default()
        });
        session.usage.push(sample);
    }

    pub async fn usage_totals(&self, key: Option<&str>) -> UsageTotals {
        let sessions = self.sessions.read().await;
        let mut totals = UsageTotals::default();
        for session in sessions.values() {
            if let Some(key) = key
                && session.key != key
            {
                continue;
            }
            for sample in &session.usage {
                totals.add(sample);
            }
        }
        totals
    }

    /// Usage bucketed by hour (bucket start ms → totals), oldest first.
    pub async fn usage_timeseries(&self, key: Option<&str>) -> Vec<serde_json::Value> {
        const HOUR_MS: u64 = 3_600_000;
        let sessions = self.sessions.read().await;
        let mut buckets: BTreeMap<u64, UsageTotals> = BTreeMap::new();
        for session in sessions.values() {
            if let Some(key) = key
                && session.key != key
            {
                continue;
            }
            for sample in &session.usage {
                let bucket = (sample.ts_ms / HOUR_MS) * HOUR_MS;
                buckets.entry(bucket).or_default().add(sample);
            }
        }
        buckets
            .into_iter()
            .map(|(bucket, totals)| {
                serde_json::json!({
                    "bucketStartMs": bucket,
                    "runs": totals.runs,
                    "inputTokens": totals.input_tokens,
                    "outputTokens": totals.output_tokens,
                    "costUsd": totals.cost_usd,
                })
            })
            .collect()
    }

    /// Most recent usage samples across sessions, newest first.
    pub async fn usage_logs(&self, limit: usize) -> Vec<serde_json::Value> {
        let sessions = self.sessions.read().await;
        let mut samples: Vec<(String, UsageSample)> = Vec::new();
        for session in sessions.values() {
            for sample in &session.usage {
                samples.push((session.key.clone(), sample.clone()));
            }
        }
        samples.sort_by(|a, b| b.1.ts_ms.cmp(&a.1.ts_ms));
        samples.truncate(limit);
        samples
            .into_iter()
            .map(|(key, s)| {
                serde_json::json!({
                    "sessionKey": key,
                    "tsMs": s.ts_ms,
                    "inputTokens": s.input_tokens,
                    "outputTokens": s.output_tokens,
                    "costUsd": s.cost_usd,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_returns_tail_oldest_first() {
        let store = SessionStore::new();
        for i in 0..5 {
            store
                .append_message("main", "user", &format!("m{i}"), i as u64)
                .await;
        }
        let tail = store.history("main", 2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }

    #[tokio::test]
    async fn patch_merges_metadata() {
        let store = SessionStore::new();
        store.get_or_create("main", 1).await;
        let outcome = store
            .patch(
                "main",
                &serde_json::json!({"label": "primary", "metadata": {"pinned": true}}),
                2,
            )
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.metadata["label"], serde_json::json!("primary"));
        assert_eq!(outcome.metadata["pinned"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn patch_unknown_session_errors() {
        let store = SessionStore::new();
        assert!(matches!(
            store.patch("ghost", &serde_json::json!({}), 0).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn compact_keeps_tail_and_adds_marker() {
        let store = SessionStore::new();
        for i in 0..30 {
            store
                .append_message("main", "user", &format!("m{i}"), i as u64)
                .await;
        }
        let dropped = store.compact("main", 100).await.unwrap();
        assert_eq!(dropped, 10);
        let history = store.history("main", 100).await;
        assert_eq!(history.len(), COMPACT_KEEP_TAIL + 1);
        assert!(history[0].content.contains("compacted 10"));
    }

    #[tokio::test]
    async fn resolve_prefers_exact_then_unique_prefix() {
        let store = SessionStore::new();
        store.get_or_create("telegram:1234", 1).await;
        store.get_or_create("main", 1).await;
        assert_eq!(store.resolve("main").await, ("main".into(), true));
        assert_eq!(
            store.resolve("telegram").await,
            ("telegram:1234".into(), true)
        );
        assert_eq!(store.resolve("discord").await, ("discord".into(), false));
    }

    #[tokio::test]
    async fn usage_rolls_up_and_buckets() {
        let store = SessionStore::new();
        store
            .record_usage("main", UsageSample {
                ts_ms: 1000,
                input_tokens: 10,
                output_tokens: 20,
                cost_usd: 0.01,
            })
            .await;
        store
            .record_usage("main", UsageSample {
                ts_ms: 4_000_000,
                input_tokens: 5,
                output_tokens: 5,
                cost_usd: 0.02,
            })
            .await;
        let totals = store.usage_totals(Some("main")).await;
        assert_eq!(totals.runs, 2);
        assert_eq!(totals.input_tokens, 15);
        let series = store.usage_timeseries(Some("main")).await;
        assert_eq!(series.len(), 2);
        let logs = store.usage_logs(1).await;
        assert_eq!(logs[0]["tsMs"], serde_json::json!(4_000_000));
    }
}
