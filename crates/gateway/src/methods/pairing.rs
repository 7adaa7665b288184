//! Device and node pairing methods.

use serde_json::json;

use tether_protocol::ErrorShape;

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    state::now_ms,
};

use super::{MethodRegistry, require_str, str_param};

pub(super) fn register(reg: &mut MethodRegistry) {
    // ── device ───────────────────────────────────────────────────────────

    reg.register(
        "device.pair.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let pairs = ctx.state.pairing.load_pairs().await;
                Ok(json!({
                    "pending": pairs.get("pending"),
                    "paired": pairs.get("paired"),
                }))
            })
        }),
    );

    reg.register(
        "device.pair.approve",
        Box::new(|ctx| {
            Box::pin(async move {
                let request_id = require_str(&ctx.params, "requestId")?;
                let outcome = ctx.state.pairing.approve_device(&request_id, now_ms()).await;
                let payload = outcome.unwrap_or_else(|| json!({"ok": true}));
                broadcast(
                    &ctx.state,
                    "device.pair.resolved",
                    json!({
                        "requestId": request_id,
                        "decision": "approved",
                        "deviceId": payload.get("deviceId"),
                        "ts": now_ms(),
                    }),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(payload)
            })
        }),
    );

    reg.register(
        "device.pair.reject",
        Box::new(|ctx| {
            Box::pin(async move {
                let request_id = require_str(&ctx.params, "requestId")?;
                ctx.state.pairing.reject_device(&request_id).await;
                broadcast(
                    &ctx.state,
                    "device.pair.resolved",
                    json!({"requestId": request_id, "decision": "rejected", "ts": now_ms()}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true}))
            })
        }),
    );

    reg.register(
        "device.pair.remove",
        Box::new(|ctx| {
            Box::pin(async move {
                let device_id = require_str(&ctx.params, "deviceId")?;
                ctx.state.pairing.remove_device(&device_id).await;
                Ok(json!({"ok": true, "deviceId": device_id}))
            })
        }),
    );

    reg.register(
        "device.token.rotate",
        Box::new(|ctx| {
            Box::pin(async move {
                let device_id = require_str(&ctx.params, "deviceId")?;
                let role = str_param(&ctx.params, "role").unwrap_or_else(|| "operator".into());
                let scopes = ctx.params.get("scopes").and_then(|v| v.as_array()).map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                });
                ctx.state
                    .pairing
                    .rotate_token(&device_id, &role, scopes, now_ms())
                    .await
                    .map_err(|e| ErrorShape::invalid(e.to_string()))
            })
        }),
    );

    reg.register(
        "device.token.revoke",
        Box::new(|ctx| {
            Box::pin(async move {
                let device_id = require_str(&ctx.params, "deviceId")?;
                let role = str_param(&ctx.params, "role").unwrap_or_else(|| "operator".into());
                ctx.state
                    .pairing
                    .revoke_token(&device_id, &role, now_ms())
                    .await;
                Ok(json!({"ok": true}))
            })
        }),
    );

    // ── node ─────────────────────────────────────────────────────────────

    reg.register(
        "node.pair.request",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = str_param(&ctx.params, "nodeId")
                    .or_else(|| ctx.client_id.clone())
                    .ok_or_else(|| ErrorShape::invalid("nodeId required"))?;
                let result = ctx
                    .state
                    .pairing
                    .request_node_pair(&node_id, &ctx.params, now_ms())
                    .await;
                if result.get("created").and_then(|v| v.as_bool()) == Some(true) {
                    broadcast(
                        &ctx.state,
                        "node.pair.requested",
                        result.get("request").cloned().unwrap_or(json!({})),
                        BroadcastOpts::operators(),
                    )
                    .await;
                }
                Ok(result)
            })
        }),
    );

    reg.register(
        "node.pair.list",
        Box::new(|ctx| {
            Box::pin(async move { Ok(ctx.state.pairing.node_pair_list().await) })
        }),
    );

    reg.register(
        "node.pair.approve",
        Box::new(|ctx| {
            Box::pin(async move {
                let request_id = require_str(&ctx.params, "requestId")?;
                let approved = ctx
                    .state
                    .pairing
                    .approve_node(&request_id, now_ms())
                    .await
                    .map_err(|e| ErrorShape::invalid(e.to_string()))?;
                broadcast(
                    &ctx.state,
                    "node.pair.resolved",
                    json!({
                        "requestId": request_id,
                        "nodeId": approved.get("nodeId"),
                        "decision": "approved",
                        "ts": now_ms(),
                    }),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(approved)
            })
        }),
    );

    reg.register(
        "node.pair.reject",
        Box::new(|ctx| {
            Box::pin(async move {
                let request_id = require_str(&ctx.params, "requestId")?;
                let resolved = ctx
                    .state
                    .pairing
                    .reject_node(&request_id)
                    .await
                    .map_err(|e| ErrorShape::invalid(e.to_string()))?;
                broadcast(
                    &ctx.state,
                    "node.pair.resolved",
                    resolved.clone(),
                    BroadcastOpts::operators(),
                )
                .await;
                let mut payload = json!({"ok": true});
                if let (Some(obj), Some(fields)) = (payload.as_object_mut(), resolved.as_object()) {
                    for (k, v) in fields {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                Ok(payload)
            })
        }),
    );

    reg.register(
        "node.pair.verify",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = str_param(&ctx.params, "nodeId")
                    .or_else(|| ctx.client_id.clone())
                    .ok_or_else(|| ErrorShape::invalid("nodeId required"))?;
                let token = require_str(&ctx.params, "token")?;
                let ok = ctx.state.pairing.verify_node_token(&node_id, &token).await;
                Ok(json!({"ok": ok, "nodeId": node_id}))
            })
        }),
    );
}
