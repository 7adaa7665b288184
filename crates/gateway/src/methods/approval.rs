//! Exec-approval methods: request/waitDecision/resolve, pending listing,
//! persisted policy files.

use std::sync::Arc;

use serde_json::json;

use {tether_protocol::ErrorShape, tether_storage::slots};

use crate::{
    approval::{
        ApprovalCoordinator, Decision, OutboundMessage, build_request_message, forward_targets,
        should_forward,
    },
    broadcast::{BroadcastOpts, broadcast},
    state::{GatewayState, now_ms},
};

use super::{MethodRegistry, MethodResult, bool_param, require_str, str_param, u64_param};

fn map_err(e: crate::approval::Error) -> ErrorShape {
    ErrorShape::invalid(e.to_string())
}

/// Sweep expired records and notify waiters. Runs at the entry of every
/// approval RPC and from the periodic tick.
pub(crate) async fn sweep_and_broadcast(state: &Arc<GatewayState>) {
    let expired = state.approvals.sweep(now_ms()).await;
    for record in expired {
        broadcast(
            state,
            "exec.approval.resolved",
            json!({"id": record.id, "decision": null, "status": "expired", "ts": now_ms()}),
            BroadcastOpts::operators(),
        )
        .await;
    }
}

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "exec.approval.request",
        Box::new(|ctx| Box::pin(async move { handle_request(ctx).await })),
    );

    reg.register(
        "exec.approval.waitDecision",
        Box::new(|ctx| {
            Box::pin(async move {
                sweep_and_broadcast(&ctx.state).await;
                let id = require_str(&ctx.params, "id")?;
                let (record, rx) = ctx.state.approvals.attach(&id).await.map_err(map_err)?;
                if let Some(decision) = record.decision {
                    return Ok(json!({
                        "id": id,
                        "decision": decision.as_str(),
                        "createdAtMs": record.created_at_ms,
                        "expiresAtMs": record.expires_at_ms,
                    }));
                }
                let remaining = record.expires_at_ms.saturating_sub(now_ms()).max(1);
                let decision = ApprovalCoordinator::await_decision(rx, remaining).await;
                Ok(json!({
                    "id": id,
                    "decision": decision.map(|d| d.as_str()),
                    "createdAtMs": record.created_at_ms,
                    "expiresAtMs": record.expires_at_ms,
                }))
            })
        }),
    );

    reg.register(
        "exec.approval.resolve",
        Box::new(|ctx| {
            Box::pin(async move {
                sweep_and_broadcast(&ctx.state).await;
                let id = str_param(&ctx.params, "requestId")
                    .or_else(|| str_param(&ctx.params, "id"))
                    .ok_or_else(|| ErrorShape::invalid("requestId/id required"))?;
                let decision = Decision::parse(
                    &require_str(&ctx.params, "decision")?,
                )
                .map_err(map_err)?;
                let resolved_by = ctx.client_id.clone();
                ctx.state
                    .approvals
                    .resolve(&id, decision, resolved_by.clone(), now_ms())
                    .await
                    .map_err(map_err)?;
                broadcast(
                    &ctx.state,
                    "exec.approval.resolved",
                    json!({
                        "id": id,
                        "decision": decision.as_str(),
                        "resolvedBy": resolved_by,
                        "ts": now_ms(),
                    }),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true}))
            })
        }),
    );

    reg.register(
        "exec.approvals.pending",
        Box::new(|ctx| {
            Box::pin(async move {
                sweep_and_broadcast(&ctx.state).await;
                let pending: Vec<_> = ctx
                    .state
                    .approvals
                    .pending(now_ms())
                    .await
                    .iter()
                    .map(|r| r.summary())
                    .collect();
                Ok(json!({"pending": pending}))
            })
        }),
    );

    reg.register(
        "exec.approvals.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let file = ctx
                    .state
                    .storage
                    .load(
                        slots::EXEC_APPROVALS,
                        json!({"version": 1, "defaults": {}, "agents": {}}),
                    )
                    .await;
                Ok(json!({
                    "path": "~/.tether/state/rpc.exec_approvals.json",
                    "exists": true,
                    "file": file,
                }))
            })
        }),
    );

    reg.register(
        "exec.approvals.set",
        Box::new(|ctx| {
            Box::pin(async move {
                let file = ctx
                    .params
                    .get("file")
                    .filter(|f| f.is_object())
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                ctx.state.storage.save(slots::EXEC_APPROVALS, &file).await;
                Ok(json!({"ok": true}))
            })
        }),
    );

    reg.register(
        "exec.approvals.node.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = require_str(&ctx.params, "nodeId")?;
                let map = ctx
                    .state
                    .storage
                    .load(slots::NODE_EXEC_APPROVALS, json!({}))
                    .await;
                let file = map
                    .get(&node_id)
                    .cloned()
                    .unwrap_or_else(|| json!({"version": 1, "defaults": {}, "agents": {}}));
                Ok(json!({"path": format!("node:{node_id}"), "exists": true, "file": file}))
            })
        }),
    );

    reg.register(
        "exec.approvals.node.set",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = require_str(&ctx.params, "nodeId")?;
                let file = ctx
                    .params
                    .get("file")
                    .filter(|f| f.is_object())
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let mut map = ctx
                    .state
                    .storage
                    .load(slots::NODE_EXEC_APPROVALS, json!({}))
                    .await;
                if let Some(obj) = map.as_object_mut() {
                    obj.insert(node_id, file);
                }
                ctx.state.storage.save(slots::NODE_EXEC_APPROVALS, &map).await;
                Ok(json!({"ok": true}))
            })
        }),
    );
}

async fn handle_request(ctx: super::MethodContext) -> MethodResult {
    sweep_and_broadcast(&ctx.state).await;
    let now = now_ms();
    let id = str_param(&ctx.params, "id")
        .unwrap_or_else(|| format!("apr_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));
    let timeout_ms = u64_param(&ctx.params, "timeoutMs", 300_000);
    let two_phase = bool_param(&ctx.params, "twoPhase", false);

    let request = json!({
        "command": ctx.params.get("command"),
        "cwd": ctx.params.get("cwd"),
        "host": ctx.params.get("host"),
        "security": ctx.params.get("security"),
        "ask": ctx.params.get("ask"),
        "agentId": ctx.params.get("agentId"),
        "resolvedPath": ctx.params.get("resolvedPath"),
        "sessionKey": ctx.params.get("sessionKey"),
    });

    let (record, rx) = ctx
        .state
        .approvals
        .create(&id, request.clone(), timeout_ms, ctx.client_id.clone(), now)
        .await
        .map_err(map_err)?;

    broadcast(
        &ctx.state,
        "exec.approval.requested",
        json!({
            "id": record.id.clone(),
            "request": request,
            "createdAtMs": record.created_at_ms,
            "expiresAtMs": record.expires_at_ms,
        }),
        BroadcastOpts::operators(),
    )
    .await;

    // Optional chat forwarding so operators can answer from a channel.
    {
        let config = ctx.state.config.read().await.clone();
        if should_forward(&config.approvals.exec, &request) {
            let text = build_request_message(&record, now);
            for (channel, to) in forward_targets(&config, &request) {
                let _ = ctx
                    .state
                    .services
                    .bus
                    .send(OutboundMessage {
                        channel,
                        to,
                        text: text.clone(),
                    })
                    .await;
            }
        }
    }

    if two_phase {
        return Ok(json!({
            "status": "accepted",
            "id": record.id.clone(),
            "createdAtMs": record.created_at_ms,
            "expiresAtMs": record.expires_at_ms,
        }));
    }

    let decision = ApprovalCoordinator::await_decision(rx, timeout_ms.max(1)).await;
    if decision.is_none() {
        // Make the expiry visible to pending listings immediately.
        ctx.state.approvals.sweep(now_ms()).await;
    }
    Ok(json!({
        "id": record.id,
        "decision": decision.map(|d| d.as_str()),
        "createdAtMs": record.created_at_ms,
        "expiresAtMs": record.expires_at_ms,
    }))
}
