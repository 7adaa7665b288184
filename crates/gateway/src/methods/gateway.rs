//! connect, health/status, and the misc control/query methods.

use std::sync::Arc;

use {serde_json::json, tracing::info};

use {
    tether_protocol::{ConnectParams, ErrorShape, error_codes, roles},
    tether_storage::slots,
};

use crate::{
    alerts,
    auth::{
        self, RATE_SCOPE_DEVICE_TOKEN, RATE_SCOPE_SHARED_SECRET, check_shared_credentials,
        resolve_scopes,
    },
    broadcast::{BroadcastOpts, broadcast},
    nodes::NodeSession,
    presence::PresenceUpdate,
    state::{GatewayState, now_ms},
};

use super::{MethodRegistry, MethodResult, u64_param};

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "connect",
        Box::new(|ctx| Box::pin(async move { handle_connect(ctx).await })),
    );

    for method in ["health", "status"] {
        reg.register(
            method,
            Box::new(|ctx| {
                Box::pin(async move {
                    let overview = build_overview(&ctx.state).await;
                    Ok(overview)
                })
            }),
        );
    }

    reg.register(
        "models.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let agents = ctx.state.catalog.list().await;
                let mut seen = std::collections::HashSet::new();
                let models: Vec<_> = agents
                    .iter()
                    .filter_map(|a| a.model.clone().map(|m| (m, a.provider.clone())))
                    .filter(|(m, _)| seen.insert(m.clone()))
                    .map(|(m, provider)| json!({"id": m.clone(), "label": m, "provider": provider}))
                    .collect();
                Ok(json!({"models": models}))
            })
        }),
    );

    reg.register(
        "auth.profiles.status",
        Box::new(|ctx| {
            Box::pin(async move { Ok(ctx.state.services.auth_profiles.report().await) })
        }),
    );

    reg.register(
        "actions.catalog",
        Box::new(|_ctx| Box::pin(async move { Ok(alerts::actions_catalog(now_ms())) })),
    );

    reg.register(
        "actions.validate",
        Box::new(|ctx| {
            Box::pin(async move {
                let code = super::require_str(&ctx.params, "code")?;
                let result =
                    alerts::validate_action(&code, ctx.params.get("action").filter(|a| a.is_object()));
                if result.get("ok").and_then(|v| v.as_bool()) == Some(true) {
                    Ok(result)
                } else {
                    let reason = result
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("invalid action")
                        .to_string();
                    Err(ErrorShape::with_data(
                        error_codes::INVALID_REQUEST,
                        reason,
                        json!({"validation": result}),
                    ))
                }
            })
        }),
    );

    reg.register(
        "actions.validate.batch",
        Box::new(|ctx| {
            Box::pin(async move {
                let items = batch_items(&ctx.params)?;
                Ok(alerts::validate_action_batch(&items))
            })
        }),
    );

    reg.register(
        "actions.validate.batch.lifecycle",
        Box::new(|ctx| {
            Box::pin(async move {
                let items = batch_items(&ctx.params)?;
                let validation = alerts::validate_action_batch(&items);
                let overview = build_overview(&ctx.state).await;
                Ok(json!({
                    "ok": validation.get("ok"),
                    "validation": validation,
                    "alertsSummary": overview.get("alertsSummary"),
                    "alertsLifecycle": overview.get("alertsLifecycle"),
                    "generatedAtMs": now_ms(),
                }))
            })
        }),
    );

    reg.register(
        "alerts.lifecycle",
        Box::new(|ctx| Box::pin(async move { Ok(ctx.state.alerts.view().await) })),
    );

    reg.register(
        "system-presence",
        Box::new(|ctx| {
            Box::pin(async move {
                let entries = ctx.state.presence.write().await.list(now_ms());
                Ok(serde_json::to_value(entries).unwrap_or_else(|_| json!([])))
            })
        }),
    );

    reg.register(
        "logs.tail",
        Box::new(|ctx| {
            Box::pin(async move {
                let cursor = ctx.params.get("cursor").and_then(|v| v.as_u64());
                let limit = u64_param(&ctx.params, "limit", 200) as usize;
                let (entries, next) = ctx.state.run_log.tail(cursor, limit).await;
                Ok(json!({
                    "file": ctx.state.run_log.file_path().display().to_string(),
                    "entries": entries,
                    "cursor": next,
                }))
            })
        }),
    );

    reg.register(
        "last-heartbeat",
        Box::new(|ctx| {
            Box::pin(async move {
                let state = ctx
                    .state
                    .storage
                    .load(slots::LAST_HEARTBEAT, json!({"ts": null}))
                    .await;
                Ok(json!({"ok": true, "ts": state.get("ts")}))
            })
        }),
    );

    reg.register(
        "update.run",
        Box::new(|ctx| {
            Box::pin(async move {
                let current = ctx
                    .state
                    .storage
                    .load(slots::UPDATE_STATUS, json!({"running": false}))
                    .await;
                if current.get("running").and_then(|v| v.as_bool()) == Some(true) {
                    return Ok(json!({"ok": true, "started": false, "status": current}));
                }
                let status = json!({"running": true, "startedAtMs": now_ms()});
                ctx.state.storage.save(slots::UPDATE_STATUS, &status).await;
                let state = Arc::clone(&ctx.state);
                tokio::spawn(async move {
                    let result = state.services.updater.run().await;
                    let done = json!({
                        "running": false,
                        "finishedAtMs": now_ms(),
                        "ok": result.is_ok(),
                        "result": result.unwrap_or_else(|e| json!({"error": e})),
                    });
                    state.storage.save(slots::UPDATE_STATUS, &done).await;
                });
                Ok(json!({"ok": true, "started": true, "status": status}))
            })
        }),
    );

    reg.register(
        "doctor.memory.status",
        Box::new(|_ctx| {
            Box::pin(async move {
                Ok(json!({"ok": true, "status": "healthy", "message": "memory diagnostics not implemented"}))
            })
        }),
    );

    reg.register(
        "push.test",
        Box::new(|_ctx| {
            Box::pin(async move {
                Ok(json!({"ok": true, "delivered": false, "message": "push notifications not configured"}))
            })
        }),
    );
}

fn batch_items(params: &serde_json::Value) -> Result<Vec<serde_json::Value>, ErrorShape> {
    params
        .get("items")
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| ErrorShape::invalid("items[] required"))
}

// ── Overview ─────────────────────────────────────────────────────────────────

/// Health/status overview: channels, cron, alerts pipeline, summary.
/// Also embedded in the connect snapshot.
pub(super) async fn build_overview(state: &Arc<GatewayState>) -> serde_json::Value {
    let now = now_ms();
    let channels_snapshot = state.services.channels.snapshot(now).await;
    let auth_profiles = state.services.auth_profiles.report().await;
    let cron_status = state.cron.status(now).await;
    let worker_status = state
        .storage
        .load(slots::WORKER_STATUS, json!({}))
        .await;

    let raw = alerts::build_operational_alerts(
        &auth_profiles,
        &channels_snapshot,
        Some(&cron_status),
        &worker_status,
        now,
    );
    let normalized = alerts::normalize_alerts(raw);
    let (alerts_list, lifecycle) = state.alerts.apply(normalized, now).await;
    let mut summary = alerts::alerts_summary(&alerts_list);
    if let Some(obj) = summary.as_object_mut() {
        obj.insert(
            "resolvedRecentCount".into(),
            lifecycle
                .get("resolvedRecentCount")
                .cloned()
                .unwrap_or(json!(0)),
        );
    }
    state.bump_health_version();
    let critical = summary.get("critical").and_then(|v| v.as_u64()).unwrap_or(0);

    let channels = channels_snapshot
        .get("channels")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let channels_summary = json!({
        "count": channels.len(),
        "configured": channels.values().filter(|c| c.get("configured").and_then(|v| v.as_bool()) == Some(true)).count(),
        "running": channels.values().filter(|c| c.get("running").and_then(|v| v.as_bool()) == Some(true)).count(),
        "channels": channels,
    });

    let (host, port) = {
        let config = state.config.read().await;
        (config.gateway.host.clone(), config.gateway.port)
    };

    json!({
        "ok": true,
        "health": critical == 0,
        "uptimeSeconds": state.uptime_seconds(),
        "gateway": {"host": host, "port": port, "version": state.version},
        "sessionsCount": state.sessions.count().await,
        "presenceCount": state.presence.read().await.len(),
        "cron": cron_status,
        "channels": channels_summary,
        "channelsSnapshot": channels_snapshot,
        "controlPlane": worker_status,
        "authProfiles": auth_profiles,
        "alerts": alerts_list,
        "alertsSummary": summary,
        "alertsLifecycle": lifecycle,
        "actionsCatalog": alerts::actions_catalog(now),
        "walletUnlocked": state.wallet_unlocked,
    })
}

/// Canvas URL: env override, else derived from the bind address.
async fn canvas_host_url(state: &Arc<GatewayState>) -> Option<String> {
    if let Ok(url) = std::env::var(tether_config::ENV_CANVAS_HOST_URL)
        && !url.trim().is_empty()
    {
        return Some(url.trim().to_string());
    }
    let config = state.config.read().await;
    let host = config.gateway.host.trim();
    if host.is_empty() || config.gateway.port == 0 {
        return None;
    }
    let host = if host == "0.0.0.0" || host == "::" {
        "127.0.0.1"
    } else {
        host
    };
    Some(format!("http://{host}:{}", config.gateway.port))
}

// ── connect ──────────────────────────────────────────────────────────────────

async fn handle_connect(ctx: super::MethodContext) -> MethodResult {
    let state = Arc::clone(&ctx.state);
    let params: ConnectParams = serde_json::from_value(ctx.params.clone())
        .map_err(|e| ErrorShape::invalid(format!("invalid connect params: {e}")))?;
    let now = now_ms();
    let role = params.role.clone().unwrap_or_else(|| roles::OPERATOR.into());
    if role != roles::OPERATOR && role != roles::NODE {
        return Err(ErrorShape::invalid(format!("unknown role: {role}")));
    }

    let rate_scope = if params
        .auth
        .as_ref()
        .and_then(|a| a.device_token.as_ref())
        .is_some()
    {
        RATE_SCOPE_DEVICE_TOKEN
    } else {
        RATE_SCOPE_SHARED_SECRET
    };
    let check = state
        .rate_limiter
        .check(&ctx.remote_ip, rate_scope, now)
        .await;
    if !check.allowed {
        return Err(ErrorShape::with_data(
            error_codes::INVALID_REQUEST,
            "too many failed auth attempts",
            json!({"retryAfterMs": check.retry_after_ms}),
        ));
    }

    // Nonce check applies when a device identity is presented.
    let issued_nonce = {
        let clients = state.clients.read().await;
        clients
            .get(&ctx.conn_id)
            .map(|c| c.connect_nonce.clone())
            .unwrap_or_default()
    };
    if let Some(device) = &params.device
        && device.nonce.as_deref() != Some(issued_nonce.as_str())
    {
        state
            .rate_limiter
            .record_failure(&ctx.remote_ip, rate_scope, now)
            .await;
        return Err(ErrorShape::invalid("authentication failed"));
    }

    // Credential resolution.
    let config = state.config.read().await.clone();
    let device_id = params.device.as_ref().map(|d| d.device_id.clone());
    let mut granted: Option<Vec<String>> = None;
    if let (Some(device_id), Some(token)) = (
        device_id.as_deref(),
        params.auth.as_ref().and_then(|a| a.device_token.as_deref()),
    ) && let Some((_, scopes)) = state.pairing.verify_device_token(device_id, token).await
    {
        granted = Some(scopes);
    }
    if granted.is_none() {
        let token = params.auth.as_ref().and_then(|a| a.token.as_deref());
        let password = params.auth.as_ref().and_then(|a| a.password.as_deref());
        if check_shared_credentials(&config, token, password).is_some() {
            granted = Some(auth::operator_grant());
        }
    }
    let Some(granted) = granted else {
        // A device with no usable credential gets a pending pair request
        // so an operator can admit it.
        if let Some(device) = &params.device {
            let (request, created) = state
                .pairing
                .request_device_pair(
                    &device.device_id,
                    device.display_name.as_deref(),
                    device.platform.as_deref(),
                    now,
                )
                .await;
            if created {
                broadcast(
                    &state,
                    "device.pair.requested",
                    request,
                    BroadcastOpts::operators(),
                )
                .await;
            }
        }
        state
            .rate_limiter
            .record_failure(&ctx.remote_ip, rate_scope, now)
            .await;
        return Err(ErrorShape::invalid("authentication failed"));
    };

    // Node role must map to a paired node.
    if role == roles::NODE {
        let Some(device_id) = device_id.as_deref() else {
            return Err(ErrorShape::new(error_codes::NOT_PAIRED, "node requires device identity"));
        };
        if !state.pairing.is_paired_node(device_id).await {
            return Err(ErrorShape::new(error_codes::NOT_PAIRED, "node is not paired"));
        }
    }

    let scopes = resolve_scopes(params.scopes.as_deref(), &granted);
    let client_id = params
        .client_id
        .clone()
        .or_else(|| device_id.clone())
        .unwrap_or_else(|| ctx.conn_id.clone());

    // Bind the authenticated state.
    {
        let mut clients = state.clients.write().await;
        let Some(client) = clients.get_mut(&ctx.conn_id) else {
            return Err(ErrorShape::unavailable("connection gone"));
        };
        client.role = role.clone();
        client.scopes = scopes.clone();
        client.client_id = Some(client_id.clone());
        client.connected = true;
    }
    state.rate_limiter.reset(&ctx.remote_ip, rate_scope).await;

    state.presence.write().await.upsert(
        &client_id,
        PresenceUpdate {
            reason: "connect".into(),
            mode: if role == roles::NODE { "node".into() } else { "ui".into() },
            ip: Some(ctx.remote_ip.clone()),
            connection_key: Some(ctx.conn_id.clone()),
            ..PresenceUpdate::default()
        },
        now,
    );
    state.bump_presence_version();

    // Node registration.
    if role == roles::NODE
        && let Some(device) = &params.device
    {
        let permissions = device
            .permissions
            .as_ref()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                    .collect()
            })
            .unwrap_or_default();
        let session = NodeSession {
            node_id: device.device_id.clone(),
            conn_id: ctx.conn_id.clone(),
            display_name: device.display_name.clone(),
            platform: device.platform.clone(),
            device_family: device.device_family.clone(),
            version: device.version.clone(),
            caps: device.caps.clone(),
            commands: device.commands.clone(),
            permissions,
            remote_ip: Some(ctx.remote_ip.clone()),
            connected_at_ms: now,
        };
        state.nodes.write().await.register(session);
        info!(conn_id = %ctx.conn_id, node_id = %device.device_id, "node registered");
        broadcast(
            &state,
            "presence",
            json!({"type": "node.connected", "nodeId": device.device_id.clone(), "platform": device.platform.clone()}),
            BroadcastOpts::default(),
        )
        .await;
    }

    info!(
        conn_id = %ctx.conn_id,
        client_id = %client_id,
        role = %role,
        "connect accepted"
    );

    // Snapshot.
    let overview = build_overview(&state).await;
    let agents = state.catalog.list().await;
    let sessions = state.sessions.list().await;
    let presence = state.presence.write().await.list(now);
    let methods = state.method_names.read().await.clone();
    Ok(json!({
        "ok": true,
        "connId": ctx.conn_id,
        "server": {"version": state.version, "host": state.hostname},
        "auth": {"role": role, "scopes": scopes},
        "snapshot": overview,
        "agents": agents,
        "sessions": sessions,
        "presence": presence,
        "methods": methods,
        "events": tether_protocol::event_names(),
        "canvasHostUrl": canvas_host_url(&state).await,
        "policy": {
            "maxPayload": tether_protocol::MAX_PAYLOAD_BYTES,
            "tickIntervalMs": tether_protocol::TICK_INTERVAL_MS,
        },
    }))
}
