//! Node runtime methods: listing, invocation with idempotent result
//! routing, node-originated events, and the browser proxy.

use std::{sync::Arc, time::Duration};

use {
    base64::Engine as _,
    serde_json::json,
    tracing::{debug, warn},
};

use {
    tether_protocol::{ErrorShape, EventFrame, error_codes},
    tether_storage::slots,
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    lanes::Admission,
    nodes::{InvokeOutcome, InvokeTicket, is_command_allowed, resolve_allowlist},
    runner,
    state::{GatewayState, now_ms},
};

use super::{MethodContext, MethodRegistry, MethodResult, require_str, str_param, u64_param};

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "node.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let pairs = ctx.state.pairing.node_pair_list().await;
                let paired = pairs
                    .get("paired")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                let nodes = build_node_rows(&ctx.state, &paired).await;
                Ok(json!({"ts": now_ms(), "nodes": nodes}))
            })
        }),
    );

    reg.register(
        "node.describe",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = require_str(&ctx.params, "nodeId")?;
                let pairs = ctx.state.pairing.node_pair_list().await;
                let paired = pairs
                    .get("paired")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                let nodes = build_node_rows(&ctx.state, &paired).await;
                nodes
                    .into_iter()
                    .find(|n| n.get("nodeId").and_then(|v| v.as_str()) == Some(node_id.as_str()))
                    .map(|mut node| {
                        if let Some(obj) = node.as_object_mut() {
                            obj.insert("ts".into(), json!(now_ms()));
                        }
                        node
                    })
                    .ok_or_else(|| ErrorShape::invalid("unknown nodeId"))
            })
        }),
    );

    reg.register(
        "node.rename",
        Box::new(|ctx| {
            Box::pin(async move {
                let node_id = require_str(&ctx.params, "nodeId")?;
                let display_name = require_str(&ctx.params, "displayName")?;
                // Applies to the live session and sticks on the paired row.
                let live = ctx
                    .state
                    .nodes
                    .write()
                    .await
                    .rename(&node_id, &display_name)
                    .is_ok();
                let paired = ctx
                    .state
                    .pairing
                    .rename_device(&node_id, &display_name)
                    .await;
                if !live && !paired {
                    return Err(ErrorShape::invalid("unknown nodeId"));
                }
                Ok(json!({"nodeId": node_id, "displayName": display_name}))
            })
        }),
    );

    reg.register(
        "node.invoke",
        Box::new(|ctx| Box::pin(async move { handle_invoke(ctx).await })),
    );

    reg.register(
        "node.invoke.result",
        Box::new(|ctx| {
            Box::pin(async move {
                let invoke_id = require_str(&ctx.params, "id")?;
                let accepted = ctx.state.nodes.write().await.complete_invoke(
                    &invoke_id,
                    InvokeOutcome {
                        ok: super::bool_param(&ctx.params, "ok", false),
                        payload: ctx.params.get("payload").cloned(),
                        error: ctx.params.get("error").filter(|e| e.is_object()).cloned(),
                    },
                );
                if !accepted {
                    debug!(invoke_id = %invoke_id, "invoke result with no pending invoke");
                }
                Ok(json!({"ok": true, "accepted": accepted}))
            })
        }),
    );

    reg.register(
        "node.event",
        Box::new(|ctx| Box::pin(async move { handle_node_event(ctx).await })),
    );

    reg.register(
        "browser.request",
        Box::new(|ctx| Box::pin(async move { handle_browser_request(ctx).await })),
    );
}

async fn build_node_rows(
    state: &Arc<GatewayState>,
    paired: &[serde_json::Value],
) -> Vec<serde_json::Value> {
    let nodes = state.nodes.read().await;
    let mut ids: Vec<String> = paired
        .iter()
        .filter_map(|row| row.get("deviceId").and_then(|v| v.as_str()))
        .map(String::from)
        .collect();
    for session in nodes.list() {
        if !ids.contains(&session.node_id) {
            ids.push(session.node_id.clone());
        }
    }
    ids.sort();
    ids.into_iter()
        .map(|node_id| {
            let row = paired
                .iter()
                .find(|r| r.get("deviceId").and_then(|v| v.as_str()) == Some(node_id.as_str()));
            let live = nodes.get(&node_id);
            json!({
                "nodeId": node_id,
                "displayName": live
                    .and_then(|l| l.display_name.clone())
                    .or_else(|| row.and_then(|r| r.get("displayName").and_then(|v| v.as_str()).map(String::from))),
                "platform": live
                    .and_then(|l| l.platform.clone())
                    .or_else(|| row.and_then(|r| r.get("platform").and_then(|v| v.as_str()).map(String::from))),
                "version": live.and_then(|l| l.version.clone()),
                "remoteIp": live.and_then(|l| l.remote_ip.clone()),
                "caps": live.map(|l| l.caps.clone()).unwrap_or_default(),
                "commands": live
                    .map(|l| l.commands.clone())
                    .or_else(|| row.and_then(|r| r.get("commands").and_then(|v| v.as_array()).map(|a| {
                        a.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                    })))
                    .unwrap_or_default(),
                "connectedAtMs": live.map(|l| l.connected_at_ms),
                "paired": row.is_some(),
                "connected": live.is_some(),
            })
        })
        .collect()
}

// ── node.invoke ──────────────────────────────────────────────────────────────

async fn handle_invoke(ctx: MethodContext) -> MethodResult {
    let node_id = require_str(&ctx.params, "nodeId")?;
    let command = require_str(&ctx.params, "command")?;
    if command.starts_with("system.execApprovals.") {
        return Err(ErrorShape::with_data(
            error_codes::INVALID_REQUEST,
            "node.invoke does not allow system.execApprovals.*; use exec.approvals.node.*",
            json!({"command": command}),
        ));
    }
    let timeout_ms = u64_param(&ctx.params, "timeoutMs", 30_000).max(100);
    let idempotency_key = str_param(&ctx.params, "idempotencyKey");
    let invoke_params = ctx.params.get("params").cloned().unwrap_or(json!({}));

    invoke_node_command(
        &ctx.state,
        &node_id,
        &command,
        invoke_params,
        timeout_ms,
        idempotency_key.as_deref(),
    )
    .await
    .map(|payload| {
        json!({
            "ok": true,
            "nodeId": node_id,
            "command": command,
            "payload": payload,
        })
    })
}

/// Send one command to a connected node and await its result.
pub(super) async fn invoke_node_command(
    state: &Arc<GatewayState>,
    node_id: &str,
    command: &str,
    params: serde_json::Value,
    timeout_ms: u64,
    idempotency_key: Option<&str>,
) -> Result<serde_json::Value, ErrorShape> {
    let now = now_ms();
    let nodes_cfg = state.config.read().await.nodes.clone();
    let (conn_id, ticket) = {
        let mut nodes = state.nodes.write().await;
        let session = nodes.get(node_id).ok_or_else(|| {
            ErrorShape::with_data(
                error_codes::UNAVAILABLE,
                "node not connected",
                json!({"code": error_codes::NOT_CONNECTED}),
            )
        })?;
        let conn_id = session.conn_id.clone();
        let declared = session.commands.clone();
        let allowlist = resolve_allowlist(&nodes_cfg, session);
        is_command_allowed(command, &declared, &allowlist).map_err(|reason| {
            ErrorShape::with_data(
                error_codes::INVALID_REQUEST,
                "node command not allowed",
                json!({"reason": reason, "command": command}),
            )
        })?;
        (conn_id, nodes.begin_invoke(node_id, idempotency_key, now))
    };

    let (invoke_id, rx, fresh) = match ticket {
        InvokeTicket::New { invoke_id, rx } => (invoke_id, rx, true),
        InvokeTicket::Attached { invoke_id, rx } => (invoke_id, rx, false),
    };

    if fresh {
        let frame = EventFrame::new(
            "node.invoke.request",
            json!({
                "id": invoke_id.clone(),
                "nodeId": node_id,
                "command": command,
                "params": params,
                "timeoutMs": timeout_ms,
            }),
            state.next_seq(),
        );
        let json_frame = serde_json::to_string(&frame)
            .map_err(|e| ErrorShape::new(error_codes::INTERNAL_ERROR, e.to_string()))?;
        if !state.send_to_conn(&conn_id, &json_frame).await {
            state.nodes.write().await.reap_invoke(&invoke_id);
            return Err(ErrorShape::unavailable("node send failed"));
        }
    }

    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
        Ok(Ok(outcome)) if outcome.ok => Ok(outcome.payload.unwrap_or(serde_json::Value::Null)),
        Ok(Ok(outcome)) => {
            let error = outcome.error.unwrap_or_else(|| {
                json!({"code": error_codes::UNAVAILABLE, "message": "node invoke failed"})
            });
            Err(ErrorShape::with_data(
                error
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or(error_codes::UNAVAILABLE)
                    .to_string(),
                error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("node invoke failed")
                    .to_string(),
                json!({"nodeId": node_id, "command": command}),
            ))
        },
        Ok(Err(_)) => Err(ErrorShape::unavailable("invoke cancelled")),
        Err(_) => {
            state.nodes.write().await.reap_invoke(&invoke_id);
            Err(ErrorShape::unavailable("node invoke timeout"))
        },
    }
}

// ── node.event ───────────────────────────────────────────────────────────────

async fn handle_node_event(ctx: MethodContext) -> MethodResult {
    let event = require_str(&ctx.params, "event")?;
    let node_id = str_param(&ctx.params, "nodeId")
        .or_else(|| ctx.client_id.clone())
        .ok_or_else(|| ErrorShape::invalid("nodeId required"))?;
    let payload = ctx.params.get("payload").cloned().unwrap_or(json!({}));
    let now = now_ms();

    match event.as_str() {
        "voice.transcript" | "agent.request" => {
            let message = payload
                .get("text")
                .or_else(|| payload.get("message"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ErrorShape::invalid("agent request requires text"))?
                .to_string();
            let session_key = payload
                .get("sessionKey")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("node:{node_id}"));
            // The node hears the reply through its chat subscription.
            ctx.state
                .nodes
                .write()
                .await
                .subscribe_chat(&node_id, &session_key);
            let run_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
            let admission = ctx
                .state
                .lanes
                .admit(&run_id, &session_key, json!({"message": message.clone()}), now)
                .await;
            if matches!(admission, Admission::Started) {
                runner::spawn_run(
                    Arc::clone(&ctx.state),
                    run_id,
                    session_key,
                    message,
                    None,
                );
            }
        },
        "chat.subscribe" => {
            if let Some(session_key) = payload.get("sessionKey").and_then(|v| v.as_str()) {
                ctx.state
                    .nodes
                    .write()
                    .await
                    .subscribe_chat(&node_id, session_key);
            }
        },
        "chat.unsubscribe" => {
            if let Some(session_key) = payload.get("sessionKey").and_then(|v| v.as_str()) {
                ctx.state
                    .nodes
                    .write()
                    .await
                    .unsubscribe_chat(&node_id, session_key);
            }
        },
        "exec.started" | "exec.finished" | "exec.denied" => {
            ctx.state
                .storage
                .save(slots::LAST_HEARTBEAT, &json!({"ts": now}))
                .await;
            ctx.state
                .run_log
                .append(
                    &event,
                    json!({
                        "nodeId": node_id.clone(),
                        "command": payload.get("command"),
                        "exitCode": payload.get("exitCode"),
                        "runId": payload.get("runId"),
                    }),
                    now,
                )
                .await;
        },
        _ => {},
    }

    let forwarded = json!({"nodeId": node_id.clone(), "payload": payload.clone(), "ts": now});
    broadcast(&ctx.state, &event, forwarded, BroadcastOpts::operators()).await;
    broadcast(
        &ctx.state,
        "node.event",
        json!({"nodeId": node_id.clone(), "event": event.clone(), "payload": payload, "ts": now}),
        BroadcastOpts::operators(),
    )
    .await;
    Ok(json!({"ok": true, "nodeId": node_id, "event": event}))
}

// ── browser.request ──────────────────────────────────────────────────────────

async fn handle_browser_request(ctx: MethodContext) -> MethodResult {
    let method = str_param(&ctx.params, "method").unwrap_or_else(|| "GET".into());
    let path = require_str(&ctx.params, "path")?;
    let timeout_ms = u64_param(&ctx.params, "timeoutMs", 30_000);
    let (target, control_url) = {
        let config = ctx.state.config.read().await;
        (
            str_param(&ctx.params, "nodeId").or_else(|| config.gateway.node_browser_target.clone()),
            config.gateway.browser_control_url.clone(),
        )
    };

    let node_id = {
        let nodes = ctx.state.nodes.read().await;
        nodes
            .resolve_browser_node(target.as_deref())
            .map(|n| n.node_id.clone())
    };

    if let Some(node_id) = node_id {
        let mut result = invoke_node_command(
            &ctx.state,
            &node_id,
            "browser.proxy",
            json!({
                "method": method,
                "path": path,
                "query": ctx.params.get("query"),
                "body": ctx.params.get("body"),
            }),
            timeout_ms,
            None,
        )
        .await?;
        let mapping = persist_proxy_files(result.get("files").and_then(|v| v.as_array())).await;
        rewrite_proxy_paths(&mut result, &mapping);
        return Ok(json!({"ok": true, "nodeId": node_id, "result": result}));
    }

    // No node available: fall back to the local browser-control service.
    let Some(control_url) = control_url else {
        return Err(ErrorShape::unavailable("no browser node connected"));
    };
    let url = format!(
        "{}/{}",
        control_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let client = reqwest::Client::new();
    let request = match method.to_ascii_uppercase().as_str() {
        "POST" => client.post(&url).json(ctx.params.get("body").unwrap_or(&json!({}))),
        "DELETE" => client.delete(&url),
        _ => client.get(&url),
    };
    let response = request
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .await
        .map_err(|e| ErrorShape::new(error_codes::HTTP_ERROR, super::sanitize_error(&e.to_string())))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        return Err(ErrorShape::with_data(
            error_codes::HTTP_ERROR,
            format!("browser control returned {status}"),
            json!({"body": body}),
        ));
    }
    Ok(json!({"ok": true, "nodeId": null, "result": body}))
}

/// Decode base64 file payloads returned by `browser.proxy` into the media
/// directory. Returns source-path → local-path mapping.
async fn persist_proxy_files(
    files: Option<&Vec<serde_json::Value>>,
) -> std::collections::HashMap<String, String> {
    let mut mapping = std::collections::HashMap::new();
    let Some(files) = files else {
        return mapping;
    };
    let root = dirs_next::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".tether")
        .join("media")
        .join("browser");
    if tokio::fs::create_dir_all(&root).await.is_err() {
        return mapping;
    }
    for entry in files {
        let Some(src_path) = entry.get("path").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(raw_b64) = entry.get("base64").and_then(|v| v.as_str()) else {
            continue;
        };
        let mime = entry
            .get("mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        let suffix = if mime.contains("png") {
            ".png"
        } else if mime.contains("jpeg") || mime.contains("jpg") {
            ".jpg"
        } else if mime.contains("webp") {
            ".webp"
        } else if mime.contains("json") {
            ".json"
        } else if mime.contains("pdf") {
            ".pdf"
        } else {
            ".bin"
        };
        let target = root.join(format!(
            "browser-proxy-{}{suffix}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        ));
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw_b64) else {
            warn!(path = src_path, "browser proxy file payload not base64");
            continue;
        };
        if tokio::fs::write(&target, bytes).await.is_ok() {
            mapping.insert(src_path.to_string(), target.display().to_string());
        }
    }
    mapping
}

/// Rewrite in-payload node-local paths to their persisted equivalents.
fn rewrite_proxy_paths(
    result: &mut serde_json::Value,
    mapping: &std::collections::HashMap<String, String>,
) {
    if mapping.is_empty() {
        return;
    }
    for field in ["path", "imagePath"] {
        if let Some(value) = result.get(field).and_then(|v| v.as_str())
            && let Some(local) = mapping.get(value)
        {
            let local = local.clone();
            if let Some(obj) = result.as_object_mut() {
                obj.insert(field.into(), json!(local));
            }
        }
    }
    if let Some(download) = result.get_mut("download").and_then(|v| v.as_object_mut())
        && let Some(dpath) = download.get("path").and_then(|v| v.as_str())
        && let Some(local) = mapping.get(dpath)
    {
        let local = local.clone();
        download.insert("path".into(), json!(local));
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_known_paths_only() {
        let mut result = json!({
            "path": "/tmp/shot.png",
            "imagePath": "/tmp/other.png",
            "download": {"path": "/tmp/file.pdf"},
        });
        let mut mapping = std::collections::HashMap::new();
        mapping.insert("/tmp/shot.png".to_string(), "/home/x/shot.png".to_string());
        mapping.insert("/tmp/file.pdf".to_string(), "/home/x/file.pdf".to_string());
        rewrite_proxy_paths(&mut result, &mapping);
        assert_eq!(result["path"], json!("/home/x/shot.png"));
        assert_eq!(result["imagePath"], json!("/tmp/other.png"));
        assert_eq!(result["download"]["path"], json!("/home/x/file.pdf"));
    }
}
