//! Shadow reads: run a legacy snapshot builder alongside the primary one
//! for a configured set of read methods and log divergence. The primary
//! result is always the one returned.

use std::sync::Arc;

use {async_trait::async_trait, tracing::warn};

/// Read methods eligible for shadow comparison.
pub const SHADOW_METHODS: &[&str] = &["health", "status", "agents.list", "sessions.list", "config.get"];

/// Legacy read path. Absent by default; staged cutovers install one.
#[async_trait]
pub trait LegacyReads: Send + Sync {
    /// Legacy payload for a shadowed method, or None to skip comparison.
    async fn run(&self, method: &str, params: &serde_json::Value) -> Option<serde_json::Value>;
}

/// Default: no legacy path, shadow comparison never fires.
pub struct NoLegacyReads;

#[async_trait]
impl LegacyReads for NoLegacyReads {
    async fn run(&self, _method: &str, _params: &serde_json::Value) -> Option<serde_json::Value> {
        None
    }
}

/// Canonical (sorted-key) serialization for order-insensitive comparison.
fn canonical(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        },
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", fields.join(","))
        },
        other => other.to_string(),
    }
}

/// True when the payloads are canonically equal.
pub fn payloads_match(primary: &serde_json::Value, shadow: &serde_json::Value) -> bool {
    canonical(primary) == canonical(shadow)
}

/// Run the shadow comparison for one dispatched read. Never affects the
/// primary payload; divergence and shadow failures only log.
pub async fn run_shadow(
    legacy: &Arc<dyn LegacyReads>,
    enabled: bool,
    method: &str,
    params: &serde_json::Value,
    primary: &serde_json::Value,
) {
    if !enabled || !SHADOW_METHODS.contains(&method) {
        return;
    }
    let Some(shadow) = legacy.run(method, params).await else {
        return;
    };
    if !payloads_match(primary, &shadow) {
        warn!(method, "shadow read divergence detected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert!(payloads_match(&a, &b));
    }

    #[test]
    fn canonical_detects_value_difference() {
        let a = serde_json::json!({"a": [1, 2]});
        let b = serde_json::json!({"a": [2, 1]});
        assert!(!payloads_match(&a, &b));
    }

    #[tokio::test]
    async fn disabled_shadow_never_runs() {
        struct Panicking;
        #[async_trait]
        impl LegacyReads for Panicking {
            async fn run(&self, _m: &str, _p: &serde_json::Value) -> Option<serde_json::Value> {
                panic!("shadow must not run when disabled");
            }
        }
        let legacy: Arc<dyn LegacyReads> = Arc::new(Panicking);
        run_shadow(
            &legacy,
            false,
            "health",
            &serde_json::json!({}),
            &serde_json::json!({}),
        )
        .await;
    }

    #[tokio::test]
    async fn non_shadow_method_is_skipped() {
        struct Panicking;
        #[async_trait]
        impl LegacyReads for Panicking {
            async fn run(&self, _m: &str, _p: &serde_json::Value) -> Option<serde_json::Value> {
                panic!("only read methods are shadowed");
            }
        }
        let legacy: Arc<dyn LegacyReads> = Arc::new(Panicking);
        run_shadow(
            &legacy,
            true,
            "chat.send",
            &serde_json::json!({}),
            &serde_json::json!({}),
        )
        .await;
    }
}
