//! Connect handshake and authorization behavior through the dispatch
//! pipeline: credentials, rate limiting, pairing, canary gating.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use {
    serde_json::{Value, json},
    tokio::sync::mpsc,
};

use {
    tether_agents::NoopAgentService,
    tether_config::TetherConfig,
    tether_gateway::{
        methods::{MethodContext, MethodRegistry},
        services::GatewayServices,
        state::{ConnectedClient, GatewayState, now_ms},
    },
    tether_storage::MemorySlotStore,
};

struct Harness {
    state: Arc<GatewayState>,
    registry: Arc<MethodRegistry>,
}

impl Harness {
    fn new(config: TetherConfig) -> Self {
        Self {
            state: GatewayState::new(
                config,
                Arc::new(MemorySlotStore::new()),
                GatewayServices::default(),
                Arc::new(NoopAgentService),
            ),
            registry: Arc::new(MethodRegistry::new()),
        }
    }

    /// Register a fresh (pre-connect) connection with a known nonce.
    async fn fresh_conn(&self, conn_id: &str, remote_ip: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .register_client(ConnectedClient {
                conn_id: conn_id.into(),
                role: "unknown".into(),
                scopes: Vec::new(),
                client_id: None,
                connected: false,
                connect_nonce: "n_fixed".into(),
                remote_ip: remote_ip.into(),
                sender: tx,
                connected_at_ms: now_ms(),
                last_activity_ms: now_ms(),
            })
            .await;
        rx
    }

    async fn call_from(
        &self,
        conn_id: &str,
        remote_ip: &str,
        method: &str,
        params: Value,
    ) -> tether_protocol::ResponseFrame {
        let (role, scopes, client_id) = {
            let clients = self.state.clients.read().await;
            clients
                .get(conn_id)
                .map(|c| (c.role.clone(), c.scopes.clone(), c.client_id.clone()))
                .unwrap_or(("unknown".into(), Vec::new(), None))
        };
        let ctx = MethodContext {
            request_id: "t1".into(),
            method: method.into(),
            params,
            conn_id: conn_id.into(),
            role,
            scopes,
            client_id,
            remote_ip: remote_ip.into(),
            state: Arc::clone(&self.state),
        };
        self.registry.dispatch(ctx).await
    }
}

fn token_config(token: &str) -> TetherConfig {
    let mut config = TetherConfig::default();
    config.auth.token = Some(token.into());
    config
}

#[tokio::test]
async fn fresh_connection_rejects_everything_but_connect() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let denied = harness.call_from("c1", "10.0.0.5", "health", json!({})).await;
    assert!(!denied.ok);
    assert!(denied.error.unwrap().message.contains("connect"));
}

#[tokio::test]
async fn connect_with_token_grants_operator_and_snapshot() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({"role": "operator", "clientId": "ui-1", "auth": {"token": "secret"}}),
        )
        .await;
    assert!(response.ok, "connect failed: {:?}", response.error);
    let payload = response.payload.unwrap();
    assert_eq!(payload["auth"]["role"], json!("operator"));
    assert!(
        payload["auth"]["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == "operator.admin")
    );
    // Snapshot surfaces.
    assert!(payload["snapshot"]["alertsSummary"].is_object());
    assert!(payload["events"].as_array().unwrap().iter().any(|e| e == "connect.challenge"));
    assert!(payload["presence"].as_array().is_some());

    // Subsequent calls carry the bound role.
    let health = harness.call_from("c1", "10.0.0.5", "health", json!({})).await;
    assert!(health.ok);
}

#[tokio::test]
async fn connect_with_bad_token_fails_generically() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({"auth": {"token": "wrong"}}),
        )
        .await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().message, "authentication failed");
    // No state mutated.
    let clients = harness.state.clients.read().await;
    assert!(!clients.get("c1").unwrap().connected);
}

#[tokio::test]
async fn repeated_failures_lock_the_peer() {
    let mut config = token_config("secret");
    config.rate_limit.max_attempts = 3;
    let harness = Harness::new(config);
    harness.fresh_conn("c1", "203.0.113.7").await;
    for _ in 0..3 {
        harness
            .call_from(
                "c1",
                "203.0.113.7",
                "connect",
                json!({"auth": {"token": "wrong"}}),
            )
            .await;
    }
    let locked = harness
        .call_from(
            "c1",
            "203.0.113.7",
            "connect",
            json!({"auth": {"token": "secret"}}),
        )
        .await;
    assert!(!locked.ok);
    let error = locked.error.unwrap();
    assert!(error.message.contains("too many"));
    assert!(error.data.unwrap()["retryAfterMs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn loopback_is_exempt_from_lockout() {
    let mut config = token_config("secret");
    config.rate_limit.max_attempts = 2;
    let harness = Harness::new(config);
    harness.fresh_conn("c1", "127.0.0.1").await;
    for _ in 0..5 {
        harness
            .call_from("c1", "127.0.0.1", "connect", json!({"auth": {"token": "wrong"}}))
            .await;
    }
    let ok = harness
        .call_from("c1", "127.0.0.1", "connect", json!({"auth": {"token": "secret"}}))
        .await;
    assert!(ok.ok);
}

#[tokio::test]
async fn insecure_auth_admits_without_credentials() {
    let mut config = TetherConfig::default();
    config.auth.allow_insecure_auth = true;
    let harness = Harness::new(config);
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness.call_from("c1", "10.0.0.5", "connect", json!({})).await;
    assert!(response.ok);
}

#[tokio::test]
async fn requested_scopes_intersect_grant() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({"scopes": ["operator.read", "bogus.scope"], "auth": {"token": "secret"}}),
        )
        .await;
    let scopes = response.payload.unwrap()["auth"]["scopes"].clone();
    assert_eq!(scopes, json!(["operator.read"]));

    // Bound scopes now gate writes.
    let denied = harness
        .call_from("c1", "10.0.0.5", "chat.send", json!({"message": "x"}))
        .await;
    assert!(denied.error.unwrap().message.contains("operator.write"));
}

#[tokio::test]
async fn unpaired_node_role_is_rejected() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({
                "role": "node",
                "device": {"deviceId": "mac-9", "nonce": "n_fixed", "commands": ["system.run"]},
                "auth": {"token": "secret"},
            }),
        )
        .await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, "NOT_PAIRED");
}

#[tokio::test]
async fn paired_node_connect_registers_session() {
    let harness = Harness::new(token_config("secret"));
    // Pair the node out of band.
    let request = harness
        .state
        .pairing
        .request_node_pair("mac-1", &json!({"platform": "macos"}), 1)
        .await;
    let request_id = request["request"]["requestId"].as_str().unwrap().to_string();
    harness.state.pairing.approve_node(&request_id, 2).await.unwrap();

    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({
                "role": "node",
                "device": {
                    "deviceId": "mac-1",
                    "nonce": "n_fixed",
                    "platform": "macos",
                    "caps": ["browser"],
                    "commands": ["browser.proxy", "system.run"],
                },
                "auth": {"token": "secret"},
            }),
        )
        .await;
    assert!(response.ok, "node connect failed: {:?}", response.error);
    let nodes = harness.state.nodes.read().await;
    let session = nodes.get("mac-1").unwrap();
    assert_eq!(session.conn_id, "c1");
    assert_eq!(session.commands, vec!["browser.proxy", "system.run"]);
}

#[tokio::test]
async fn wrong_nonce_fails_device_connect() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({
                "device": {"deviceId": "d1", "nonce": "n_stale"},
                "auth": {"token": "secret"},
            }),
        )
        .await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().message, "authentication failed");
}

#[tokio::test]
async fn device_token_connect_uses_paired_scopes() {
    let harness = Harness::new(TetherConfig::default());
    let (request, _) = harness
        .state
        .pairing
        .request_device_pair("dev-1", Some("Laptop"), Some("macos"), 1)
        .await;
    let approved = harness
        .state
        .pairing
        .approve_device(request["requestId"].as_str().unwrap(), 2)
        .await
        .unwrap();
    let token = approved["token"].as_str().unwrap().to_string();

    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({
                "device": {"deviceId": "dev-1", "nonce": "n_fixed"},
                "auth": {"deviceToken": token},
            }),
        )
        .await;
    assert!(response.ok, "device connect failed: {:?}", response.error);
    let scopes = response.payload.unwrap()["auth"]["scopes"].clone();
    assert!(scopes.as_array().unwrap().iter().any(|s| s == "operator.admin"));
}

#[tokio::test]
async fn canary_gates_unlisted_methods() {
    let mut config = token_config("secret");
    config.gateway.rpc_canary_methods = vec!["lanes.status".into()];
    let harness = Harness::new(config);
    harness.fresh_conn("c1", "10.0.0.5").await;
    harness
        .call_from(
            "c1",
            "10.0.0.5",
            "connect",
            json!({"auth": {"token": "secret"}}),
        )
        .await;

    let allowed = harness
        .call_from("c1", "10.0.0.5", "lanes.status", json!({"sessionKey": "x"}))
        .await;
    assert!(allowed.ok);
    let health = harness.call_from("c1", "10.0.0.5", "health", json!({})).await;
    assert!(health.ok, "health is canary-exempt");
    let gated = harness.call_from("c1", "10.0.0.5", "cron.list", json!({})).await;
    assert!(!gated.ok);
    let error = gated.error.unwrap();
    assert_eq!(error.code, "UNAVAILABLE");
    assert!(error.message.contains("canary"));
}

#[tokio::test]
async fn unknown_method_is_invalid_request() {
    let harness = Harness::new(token_config("secret"));
    harness.fresh_conn("c1", "10.0.0.5").await;
    harness
        .call_from("c1", "10.0.0.5", "connect", json!({"auth": {"token": "secret"}}))
        .await;
    let response = harness
        .call_from("c1", "10.0.0.5", "no.such.method", json!({}))
        .await;
    assert!(!response.ok);
    let error = response.error.unwrap();
    assert_eq!(error.code, "INVALID_REQUEST");
}

#[tokio::test]
async fn rpc_disabled_turns_everything_unavailable() {
    let mut config = token_config("secret");
    config.gateway.rpc_enabled = false;
    let harness = Harness::new(config);
    harness.fresh_conn("c1", "10.0.0.5").await;
    let response = harness
        .call_from("c1", "10.0.0.5", "connect", json!({"auth": {"token": "secret"}}))
        .await;
    assert_eq!(response.error.unwrap().code, "UNAVAILABLE");
}

#[tokio::test]
async fn presence_entries_stay_bounded_with_self_pinned() {
    let harness = Harness::new(token_config("secret"));
    {
        let mut presence = harness.state.presence.write().await;
        presence.register_gateway("127.0.0.1", 18790, now_ms());
        for i in 0..260 {
            presence.upsert(
                &format!("inst-{i}"),
                tether_gateway::presence::PresenceUpdate {
                    reason: "periodic".into(),
                    mode: "ui".into(),
                    ..Default::default()
                },
                now_ms(),
            );
        }
    }
    let entries = harness.state.presence.write().await.list(now_ms());
    assert!(entries.len() <= 200);
    assert!(entries.iter().any(|e| e.reason == "self"));
}
