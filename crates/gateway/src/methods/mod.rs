//! Method dispatch: registry keyed by method name, role/scope
//! authorization, canary gating, shadow-read hook.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use tether_protocol::{ErrorShape, ResponseFrame, error_codes, roles, scopes};

use crate::state::GatewayState;

mod agents;
mod approval;
mod chat;
mod config;
mod control;
mod cron;
mod gateway;
mod node;
mod pairing;
mod sessions;

pub(crate) use approval::sweep_and_broadcast as sweep_approvals;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub conn_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub remote_ip: String,
    pub state: Arc<GatewayState>,
}

pub type MethodResult = Result<serde_json::Value, ErrorShape>;

pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

// ── Method sets ──────────────────────────────────────────────────────────────

const READ_METHODS: &[&str] = &[
    "health",
    "status",
    "agents.list",
    "agents.files.list",
    "agents.files.get",
    "agent.identity.get",
    "models.list",
    "auth.profiles.status",
    "actions.catalog",
    "actions.validate",
    "actions.validate.batch",
    "actions.validate.batch.lifecycle",
    "alerts.lifecycle",
    "chat.history",
    "lanes.status",
    "lanes.list",
    "traces.list",
    "traces.get",
    "sessions.list",
    "sessions.resolve",
    "sessions.preview",
    "sessions.usage",
    "sessions.usage.timeseries",
    "sessions.usage.logs",
    "usage.cost",
    "usage.status",
    "config.get",
    "config.schema",
    "skills.status",
    "plugins.list",
    "plugins.info",
    "plugins.doctor",
    "plugins.status",
    "plugins.gateway.methods",
    "plugins.cli.list",
    "plugins.channels.list",
    "plugins.providers.list",
    "plugins.hooks.list",
    "voicewake.get",
    "tts.status",
    "tts.providers",
    "channels.status",
    "system-presence",
    "logs.tail",
    "last-heartbeat",
    "doctor.memory.status",
    "device.pair.list",
    "exec.approvals.get",
    "exec.approvals.node.get",
    "node.list",
    "node.describe",
    "node.pair.list",
    "web.login.wait",
    "cron.list",
    "cron.status",
    "cron.runs",
];

const WRITE_METHODS: &[&str] = &[
    "chat.send",
    "chat.inject",
    "chat.abort",
    "agent",
    "agent.wait",
    "agents.create",
    "agents.update",
    "agents.delete",
    "agents.files.set",
    "sessions.patch",
    "sessions.reset",
    "sessions.delete",
    "sessions.compact",
    "config.patch",
    "config.set",
    "config.apply",
    "skills.update",
    "skills.install",
    "plugins.reload",
    "plugins.http.dispatch",
    "plugins.cli.invoke",
    "plugins.services.start",
    "plugins.services.stop",
    "plugins.setup_host",
    "talk.config",
    "voicewake.set",
    "wizard.start",
    "wizard.next",
    "tts.enable",
    "tts.disable",
    "tts.convert",
    "channels.logout",
    "update.run",
    "push.test",
    "device.pair.approve",
    "device.pair.reject",
    "device.pair.remove",
    "device.token.rotate",
    "device.token.revoke",
    "node.invoke",
    "node.rename",
    "node.pair.request",
    "node.pair.approve",
    "node.pair.reject",
    "node.pair.verify",
    "node.invoke.result",
    "node.event",
    "browser.request",
    "exec.approval.request",
    "exec.approval.resolve",
    "exec.approvals.set",
    "exec.approvals.node.set",
    "web.login.start",
    "cron.add",
    "cron.update",
    "cron.remove",
    "cron.run",
];

/// Methods a `node`-role connection may call.
const NODE_ROLE_METHODS: &[&str] = &[
    "node.pair.request",
    "node.pair.verify",
    "node.invoke.result",
    "node.event",
    "exec.approval.request",
    "exec.approval.waitDecision",
];

const APPROVAL_METHODS: &[&str] = &[
    "exec.approval.request",
    "exec.approval.waitDecision",
    "exec.approval.resolve",
    "exec.approvals.get",
    "exec.approvals.pending",
];

const PAIRING_METHODS: &[&str] = &[
    "node.pair.request",
    "node.pair.list",
    "node.pair.approve",
    "node.pair.reject",
    "node.pair.verify",
    "device.pair.list",
    "device.pair.approve",
    "device.pair.reject",
    "device.pair.remove",
    "device.token.rotate",
    "device.token.revoke",
    "node.rename",
];

/// Methods that require `operator.admin`, not just `operator.write`.
const ADMIN_ONLY_METHODS: &[&str] = &[
    "config.patch",
    "config.set",
    "config.apply",
    "agents.create",
    "agents.update",
    "agents.delete",
    "skills.update",
    "skills.install",
    "sessions.patch",
    "sessions.reset",
    "sessions.delete",
    "sessions.compact",
    "cron.add",
    "cron.update",
    "cron.remove",
    "cron.run",
    "channels.logout",
    "update.run",
    "wizard.start",
    "wizard.next",
    "exec.approvals.set",
    "exec.approvals.node.set",
];

/// Dispatchable regardless of a configured canary list.
const CANARY_EXEMPT: &[&str] = &["connect", "health", "status"];

fn is_in(method: &str, list: &[&str]) -> bool {
    list.contains(&method)
}

// ── Authorization ────────────────────────────────────────────────────────────

/// Canary gate: a non-empty configured list restricts dispatch to the
/// listed methods plus the always-allowed triple.
pub fn allowed_by_canary(method: &str, canary: &[String]) -> bool {
    canary.is_empty() || is_in(method, CANARY_EXEMPT) || canary.iter().any(|m| m == method)
}

/// Role + scope check. None means authorized.
pub fn authorize_method(
    method: &str,
    connected: bool,
    role: &str,
    client_scopes: &[String],
    plugin_methods: &[String],
) -> Option<ErrorShape> {
    if method == "connect" {
        return None;
    }
    if !connected {
        return Some(ErrorShape::invalid("must call connect first"));
    }
    if role == roles::NODE {
        if is_in(method, NODE_ROLE_METHODS) {
            return None;
        }
        return Some(ErrorShape::invalid(format!(
            "unauthorized method for node role: {method}"
        )));
    }
    if role != roles::OPERATOR {
        return Some(ErrorShape::invalid(format!("unauthorized role: {role}")));
    }

    let has = |scope: &str| client_scopes.iter().any(|s| s == scope);
    if has(scopes::ADMIN) {
        return None;
    }
    if is_in(method, APPROVAL_METHODS) {
        return if has(scopes::APPROVALS) {
            None
        } else {
            Some(ErrorShape::invalid("missing scope: operator.approvals"))
        };
    }
    if is_in(method, PAIRING_METHODS) {
        return if has(scopes::PAIRING) {
            None
        } else {
            Some(ErrorShape::invalid("missing scope: operator.pairing"))
        };
    }
    if is_in(method, READ_METHODS) {
        return if has(scopes::READ) || has(scopes::WRITE) {
            None
        } else {
            Some(ErrorShape::invalid("missing scope: operator.read"))
        };
    }
    if is_in(method, ADMIN_ONLY_METHODS) {
        return Some(ErrorShape::invalid("missing scope: operator.admin"));
    }
    if is_in(method, WRITE_METHODS) {
        return if has(scopes::WRITE) {
            None
        } else {
            Some(ErrorShape::invalid("missing scope: operator.write"))
        };
    }
    if method.starts_with("exec.approvals.") {
        return Some(ErrorShape::invalid("missing scope: operator.admin"));
    }
    if plugin_methods.iter().any(|m| m == method) {
        return if has(scopes::WRITE) {
            None
        } else {
            Some(ErrorShape::invalid("missing scope: operator.write"))
        };
    }
    Some(ErrorShape::invalid("unknown or unauthorized method"))
}

// ── Error sanitization ───────────────────────────────────────────────────────

/// Scrub an internal error before it leaves the process: drop filesystem
/// paths, cap length.
pub fn sanitize_error(message: &str) -> String {
    let mut out = String::with_capacity(message.len().min(300));
    for token in message.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        if token.starts_with('/') || token.starts_with("\\\\") {
            out.push_str("<path>");
        } else {
            out.push_str(token);
        }
    }
    if out.chars().count() > 300 {
        out = out.chars().take(300).collect();
    }
    out
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        gateway::register(&mut reg);
        agents::register(&mut reg);
        chat::register(&mut reg);
        sessions::register(&mut reg);
        config::register(&mut reg);
        control::register(&mut reg);
        pairing::register(&mut reg);
        node::register(&mut reg);
        approval::register(&mut reg);
        cron::register(&mut reg);
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();
        let state = Arc::clone(&ctx.state);
        let params = ctx.params.clone();

        let (rpc_enabled, canary, shadow_enabled) = {
            let config = state.config.read().await;
            (
                config.gateway.rpc_enabled,
                config.gateway.rpc_canary_methods.clone(),
                config.gateway.rpc_shadow_reads,
            )
        };
        if !rpc_enabled {
            return ResponseFrame::err(&request_id, ErrorShape::unavailable("rpc gateway is disabled"));
        }
        if !allowed_by_canary(&method, &canary) {
            return ResponseFrame::err(
                &request_id,
                ErrorShape::unavailable(format!("method gated by canary: {method}")),
            );
        }

        let plugin_methods = state.services.plugins.gateway_methods().await;
        let connected = ctx.role != roles::UNKNOWN;
        if let Some(err) = authorize_method(&method, connected, &ctx.role, &ctx.scopes, &plugin_methods)
        {
            warn!(method, conn_id = %conn_id, code = %err.code, "method auth denied");
            return ResponseFrame::err(&request_id, err);
        }

        let Some(handler) = self.handlers.get(&method) else {
            // Plugin-declared methods dispatch through the plugin host.
            if plugin_methods.iter().any(|m| m == &method) {
                return match state.services.plugins.dispatch(&method, &params).await {
                    Ok(payload) => ResponseFrame::ok(&request_id, payload),
                    Err(e) => ResponseFrame::err(
                        &request_id,
                        ErrorShape::new(error_codes::INTERNAL_ERROR, sanitize_error(&e)),
                    ),
                };
            }
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::invalid(format!("unknown method: {method}")),
            );
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => {
                crate::shadow::run_shadow(
                    &state.legacy_reads,
                    shadow_enabled,
                    &method,
                    &params,
                    &payload,
                )
                .await;
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                if err.code == error_codes::UNAVAILABLE {
                    debug!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method unavailable");
                } else {
                    warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                }
                ResponseFrame::err(&request_id, err)
            },
        }
    }
}

// ── Param helpers shared by family modules ───────────────────────────────────

pub(crate) fn str_param(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub(crate) fn require_str(params: &serde_json::Value, key: &str) -> Result<String, ErrorShape> {
    str_param(params, key).ok_or_else(|| ErrorShape::invalid(format!("missing {key}")))
}

pub(crate) fn u64_param(params: &serde_json::Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

pub(crate) fn bool_param(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

#[allow(clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn scopes_of(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn authorize(method: &str, role: &str, scopes: &[&str]) -> Option<ErrorShape> {
        authorize_method(method, true, role, &scopes_of(scopes), &[])
    }

    #[test]
    fn fresh_connection_only_allows_connect() {
        assert!(authorize_method("health", false, "unknown", &[], &[]).is_some());
        assert!(authorize_method("connect", false, "unknown", &[], &[]).is_none());
    }

    #[test]
    fn node_role_is_restricted_to_node_methods() {
        assert!(authorize("node.invoke.result", "node", &[]).is_none());
        assert!(authorize("node.event", "node", &[]).is_none());
        assert!(authorize("exec.approval.request", "node", &[]).is_none());
        assert!(authorize("chat.send", "node", &[]).is_some());
        assert!(authorize("config.get", "node", &["operator.admin"]).is_some());
    }

    #[test]
    fn read_scope_gates_read_methods() {
        assert!(authorize("sessions.list", "operator", &["operator.read"]).is_none());
        assert!(authorize("sessions.list", "operator", &["operator.write"]).is_none());
        assert!(authorize("sessions.list", "operator", &[]).is_some());
    }

    #[test]
    fn write_scope_gates_write_methods() {
        assert!(authorize("chat.send", "operator", &["operator.write"]).is_none());
        assert!(authorize("chat.send", "operator", &["operator.read"]).is_some());
    }

    #[test]
    fn admin_only_methods_reject_write_scope() {
        for method in ["config.set", "cron.add", "sessions.delete", "update.run"] {
            assert!(
                authorize(method, "operator", &["operator.write"]).is_some(),
                "write scope must not authorize {method}"
            );
            assert!(
                authorize(method, "operator", &["operator.admin"]).is_none(),
                "admin scope must authorize {method}"
            );
        }
    }

    #[test]
    fn approval_scope_gates_approval_methods() {
        assert!(authorize("exec.approval.resolve", "operator", &["operator.approvals"]).is_none());
        assert!(authorize("exec.approval.resolve", "operator", &["operator.write"]).is_some());
    }

    #[test]
    fn pairing_scope_gates_pairing_methods() {
        assert!(authorize("device.pair.approve", "operator", &["operator.pairing"]).is_none());
        assert!(authorize("device.pair.approve", "operator", &["operator.write"]).is_some());
        assert!(authorize("node.rename", "operator", &["operator.pairing"]).is_none());
    }

    #[test]
    fn missing_scope_error_names_the_scope() {
        let err = authorize("chat.send", "operator", &[]).expect("must deny");
        assert!(err.message.contains("operator.write"));
        assert_eq!(err.code, "INVALID_REQUEST");
    }

    #[test]
    fn plugin_methods_require_write() {
        let plugin_methods = vec!["myplugin.do".to_string()];
        assert!(
            authorize_method(
                "myplugin.do",
                true,
                "operator",
                &scopes_of(&["operator.write"]),
                &plugin_methods
            )
            .is_none()
        );
        assert!(
            authorize_method(
                "myplugin.do",
                true,
                "operator",
                &scopes_of(&["operator.read"]),
                &plugin_methods
            )
            .is_some()
        );
    }

    #[test]
    fn canary_restricts_but_exempts_core_triple() {
        let canary = vec!["chat.send".to_string()];
        assert!(allowed_by_canary("chat.send", &canary));
        assert!(allowed_by_canary("connect", &canary));
        assert!(allowed_by_canary("health", &canary));
        assert!(allowed_by_canary("status", &canary));
        assert!(!allowed_by_canary("cron.list", &canary));
        assert!(allowed_by_canary("cron.list", &[]));
    }

    #[test]
    fn sanitize_strips_paths_and_truncates() {
        let scrubbed = sanitize_error("failed to open /home/user/.tether/state/x.json now");
        assert!(!scrubbed.contains("/home"));
        assert!(scrubbed.contains("<path>"));
        let long = "x".repeat(500);
        assert_eq!(sanitize_error(&long).chars().count(), 300);
    }

    #[test]
    fn every_read_method_is_not_admin_only() {
        for method in READ_METHODS {
            assert!(
                !ADMIN_ONLY_METHODS.contains(method),
                "{method} cannot be both read and admin-only"
            );
        }
    }
}
