//! `config.*` methods: snapshot with content hash, schema, patch/set/apply.

use serde_json::json;

use {
    tether_config::{TetherConfig, config_hash},
    tether_protocol::ErrorShape,
};

use super::MethodRegistry;

fn snapshot(config: &TetherConfig) -> serde_json::Value {
    let raw = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    json!({
        "config": raw,
        "hash": config_hash(config),
        "raw": serde_json::to_string_pretty(config).unwrap_or_default(),
    })
}

fn schema_payload() -> serde_json::Value {
    json!({
        "schema": {
            "type": "object",
            "properties": {
                "gateway": {"type": "object"},
                "auth": {"type": "object"},
                "approvals": {"type": "object"},
                "nodes": {"type": "object"},
                "lanes": {"type": "object"},
                "alerts": {"type": "object"},
                "rate_limit": {"type": "object"},
            },
            "additionalProperties": false,
        },
        "version": "tether-rpc-1",
    })
}

/// Shallow-merge `patch` into the serialized config, section by section.
fn merge_patch(
    base: &TetherConfig,
    patch: &serde_json::Value,
) -> Result<TetherConfig, ErrorShape> {
    let mut raw = serde_json::to_value(base)
        .map_err(|e| ErrorShape::invalid(format!("config serialize failed: {e}")))?;
    let Some(patch_obj) = patch.as_object() else {
        return Err(ErrorShape::invalid("patch must be an object"));
    };
    if let Some(base_obj) = raw.as_object_mut() {
        for (section, value) in patch_obj {
            match (base_obj.get_mut(section), value.as_object()) {
                (Some(serde_json::Value::Object(existing)), Some(fields)) => {
                    for (k, v) in fields {
                        existing.insert(k.clone(), v.clone());
                    }
                },
                _ => {
                    base_obj.insert(section.clone(), value.clone());
                },
            }
        }
    }
    serde_json::from_value(raw).map_err(|e| ErrorShape::invalid(format!("invalid config: {e}")))
}

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "config.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let config = ctx.state.config.read().await;
                Ok(snapshot(&config))
            })
        }),
    );

    reg.register(
        "config.schema",
        Box::new(|_ctx| Box::pin(async move { Ok(schema_payload()) })),
    );

    for method in ["config.patch", "config.set", "config.apply"] {
        reg.register(
            method,
            Box::new(|ctx| {
                Box::pin(async move {
                    // set/apply accept the full raw document; patch merges.
                    let next = if let Some(raw) = ctx.params.get("raw").and_then(|v| v.as_str()) {
                        serde_json::from_str::<TetherConfig>(raw)
                            .map_err(|e| ErrorShape::invalid(format!("invalid config raw: {e}")))?
                    } else {
                        let current = ctx.state.config.read().await.clone();
                        merge_patch(&current, &ctx.params)?
                    };
                    {
                        let mut config = ctx.state.config.write().await;
                        *config = next.clone();
                    }
                    Ok(json!({"ok": true, "updated": true, "hash": config_hash(&next)}))
                })
            }),
        );
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_hash_matches_raw_round_trip() {
        let config = TetherConfig::default();
        let snap = snapshot(&config);
        let raw = snap["raw"].as_str().unwrap();
        let parsed: TetherConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(snap["hash"].as_str().unwrap(), config_hash(&parsed));
    }

    #[test]
    fn merge_patch_updates_one_field() {
        let base = TetherConfig::default();
        let patched = merge_patch(&base, &json!({"lanes": {"max_pending_per_lane": 7}})).unwrap();
        assert_eq!(patched.lanes.max_pending_per_lane, 7);
        assert_eq!(patched.gateway.port, base.gateway.port);
    }

    #[test]
    fn merge_patch_rejects_unknown_shape() {
        let base = TetherConfig::default();
        assert!(merge_patch(&base, &json!({"lanes": {"max_pending_per_lane": "x"}})).is_err());
        assert!(merge_patch(&base, &json!(42)).is_err());
    }
}
