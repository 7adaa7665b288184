//! Event fan-out to connected clients, filtered by role and per-event
//! scope guards. Dead connections are culled inline.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use tether_protocol::{EventFrame, scopes};

use crate::state::GatewayState;

/// Events that require a scope to receive. `operator.admin` satisfies any.
fn event_scope_guards() -> HashMap<&'static str, &'static [&'static str]> {
    let mut m = HashMap::new();
    m.insert("exec.approval.requested", [scopes::APPROVALS].as_slice());
    m.insert("exec.approval.resolved", [scopes::APPROVALS].as_slice());
    m.insert("device.pair.requested", [scopes::PAIRING].as_slice());
    m.insert("device.pair.resolved", [scopes::PAIRING].as_slice());
    m.insert("node.pair.requested", [scopes::PAIRING].as_slice());
    m.insert("node.pair.resolved", [scopes::PAIRING].as_slice());
    m
}

#[derive(Default)]
pub struct BroadcastOpts {
    /// Restrict delivery to these roles (None = all connected clients).
    pub roles: Option<&'static [&'static str]>,
}

impl BroadcastOpts {
    pub fn operators() -> Self {
        Self {
            roles: Some(&["operator"]),
        }
    }

    pub fn operators_and_nodes() -> Self {
        Self {
            roles: Some(&["operator", "node"]),
        }
    }
}

/// Broadcast an event to all qualifying connections.
pub async fn broadcast(
    state: &Arc<GatewayState>,
    event: &str,
    payload: serde_json::Value,
    opts: BroadcastOpts,
) {
    let seq = state.next_seq();
    let mut frame = EventFrame::new(event, payload, seq);
    frame.state_version = Some(state.state_version());
    let json = match serde_json::to_string(&frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(event, error = %e, "failed to serialize broadcast event");
            return;
        },
    };

    let guards = event_scope_guards();
    let required = guards.get(event);

    let mut dead = Vec::new();
    {
        let clients = state.clients.read().await;
        debug!(event, seq, clients = clients.len(), "broadcasting event");
        for client in clients.values() {
            if !client.connected {
                continue;
            }
            if let Some(roles) = opts.roles
                && !roles.contains(&client.role.as_str())
            {
                continue;
            }
            if let Some(required) = required {
                // Scope-guarded events only go to operators holding the
                // scope (or admin).
                if client.role != "operator" || !required.iter().any(|s| client.has_scope(s)) {
                    continue;
                }
            }
            if !client.send(&json) {
                dead.push(client.conn_id.clone());
            }
        }
    }
    if !dead.is_empty() {
        let mut clients = state.clients.write().await;
        for conn_id in dead {
            debug!(conn_id = %conn_id, "culling dead connection during broadcast");
            clients.remove(&conn_id);
        }
    }
}

/// Broadcast a tick heartbeat with the current timestamp.
pub async fn broadcast_tick(state: &Arc<GatewayState>, now_ms: u64) {
    broadcast(
        state,
        "tick",
        serde_json::json!({"ts": now_ms}),
        BroadcastOpts::default(),
    )
    .await;
}
