//! WebSocket connection lifecycle: accept → challenge → read loop →
//! cleanup cascade.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    rand::Rng,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use tether_protocol::{EventFrame, GatewayFrame, MAX_PAYLOAD_BYTES, roles};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    methods::{MethodContext, MethodRegistry},
    presence::PresenceUpdate,
    state::{ConnectedClient, GatewayState, now_ms},
};

fn rand_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| format!("{:x}", rng.random_range(0..16)))
        .collect()
}

/// Handle a single WebSocket connection through its full lifecycle.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = format!("rpc_{}", rand_hex(12));
    let remote_ip = remote_addr.ip().to_string();
    let now = now_ms();
    info!(conn_id = %conn_id, remote_ip = %remote_ip, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    // Write loop: forwards frames from the channel to the socket.
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    // Register in unknown role; `connect` promotes it.
    let connect_nonce = format!("n_{}", rand_hex(16));
    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            role: roles::UNKNOWN.into(),
            scopes: Vec::new(),
            client_id: None,
            connected: false,
            connect_nonce: connect_nonce.clone(),
            remote_ip: remote_ip.clone(),
            sender: client_tx.clone(),
            connected_at_ms: now,
            last_activity_ms: now,
        })
        .await;
    state.presence.write().await.upsert(
        &conn_id,
        PresenceUpdate {
            reason: "connect".into(),
            mode: "ui".into(),
            ip: Some(remote_ip.clone()),
            connection_key: Some(conn_id.clone()),
            ..PresenceUpdate::default()
        },
        now,
    );
    state.bump_presence_version();

    // Challenge: the only frame an unauthenticated client receives.
    let challenge = EventFrame::new(
        "connect.challenge",
        serde_json::json!({"nonce": connect_nonce}),
        state.next_seq(),
    );
    if let Ok(json) = serde_json::to_string(&challenge) {
        let _ = client_tx.send(json);
    }

    // ── Read loop ────────────────────────────────────────────────────────

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, size = text.len(), "ws: payload too large");
            let err = EventFrame::new(
                "error",
                serde_json::json!({"message": "payload too large", "maxBytes": MAX_PAYLOAD_BYTES}),
                state.next_seq(),
            );
            if let Ok(json) = serde_json::to_string(&err) {
                let _ = client_tx.send(json);
            }
            continue;
        }

        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: invalid frame");
                let err = EventFrame::new(
                    "error",
                    serde_json::json!({"message": "invalid frame"}),
                    state.next_seq(),
                );
                if let Ok(json) = serde_json::to_string(&err) {
                    let _ = client_tx.send(json);
                }
                continue;
            },
        };

        let now = now_ms();
        if let Some(client) = state.clients.write().await.get_mut(&conn_id) {
            client.touch(now);
        }

        match frame {
            GatewayFrame::Request(req) => {
                // Role/scopes are re-read per request; `connect` mutates them.
                let (role, scopes, client_id) = {
                    let clients = state.clients.read().await;
                    match clients.get(&conn_id) {
                        Some(c) => (c.role.clone(), c.scopes.clone(), c.client_id.clone()),
                        None => break,
                    }
                };
                let ctx = MethodContext {
                    request_id: req.id.clone(),
                    method: req.method.clone(),
                    params: req.params.unwrap_or(serde_json::Value::Null),
                    conn_id: conn_id.clone(),
                    role,
                    scopes,
                    client_id,
                    remote_ip: remote_ip.clone(),
                    state: Arc::clone(&state),
                };
                let response = methods.dispatch(ctx).await;
                if let Ok(json) = serde_json::to_string(&response) {
                    let _ = client_tx.send(json);
                }
            },
            GatewayFrame::Presence(presence) => {
                state.presence.write().await.upsert(
                    &presence.instance_id,
                    PresenceUpdate {
                        reason: "periodic".into(),
                        mode: presence.mode.clone(),
                        last_input_seconds: presence.last_input_seconds,
                        host: presence.host.clone(),
                        version: presence.version.clone(),
                        connection_key: Some(conn_id.clone()),
                        ..PresenceUpdate::default()
                    },
                    now,
                );
                state.bump_presence_version();
            },
            _ => {
                debug!(conn_id = %conn_id, "ws: ignoring non-request frame");
            },
        }
    }

    // ── Cleanup cascade ──────────────────────────────────────────────────

    let removed_node = state.nodes.write().await.unregister_by_conn(&conn_id);
    if let Some(node) = &removed_node {
        info!(conn_id = %conn_id, node_id = %node.node_id, "node unregistered");
        broadcast(
            &state,
            "presence",
            serde_json::json!({"type": "node.disconnected", "nodeId": node.node_id.clone()}),
            BroadcastOpts::default(),
        )
        .await;
    }

    state.presence.write().await.remove_by_connection(&conn_id);
    state.bump_presence_version();

    let duration_ms = state
        .remove_client(&conn_id)
        .await
        .map(|c| now_ms().saturating_sub(c.connected_at_ms))
        .unwrap_or_default();

    info!(
        conn_id = %conn_id,
        duration_secs = duration_ms / 1000,
        "ws: connection closed"
    );

    drop(client_tx);
    write_handle.abort();
}
