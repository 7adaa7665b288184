//! Node registry: connected edge nodes, command allowlists, outstanding
//! invocations with idempotent attach, chat-event subscriptions.

use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node not connected")]
    NodeNotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Node session ─────────────────────────────────────────────────────────────

/// A paired edge node currently connected.
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub device_family: Option<String>,
    pub version: Option<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: HashMap<String, bool>,
    pub remote_ip: Option<String>,
    pub connected_at_ms: u64,
}

// ── Invocation ───────────────────────────────────────────────────────────────

/// Terminal outcome of one node invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub ok: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

struct PendingInvoke {
    node_id: String,
    idempotency_key: Option<String>,
    waiters: Vec<oneshot::Sender<InvokeOutcome>>,
    created_at_ms: u64,
}

/// How an invoke call proceeds.
pub enum InvokeTicket {
    /// New invocation: caller must send the request frame to the node.
    New {
        invoke_id: String,
        rx: oneshot::Receiver<InvokeOutcome>,
    },
    /// An invocation with the same idempotency key is outstanding; caller
    /// just awaits it.
    Attached { invoke_id: String, rx: oneshot::Receiver<InvokeOutcome> },
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeSession>,
    by_conn: HashMap<String, String>,
    invokes: HashMap<String, PendingInvoke>,
    /// `nodeId:key` → invoke id, for idempotent attach.
    idempotency: HashMap<String, String>,
    /// node_id → session keys with chat fan-out subscriptions.
    subscriptions: HashMap<String, HashSet<String>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn register(&mut self, session: NodeSession) {
        self.by_conn
            .insert(session.conn_id.clone(), session.node_id.clone());
        self.nodes.insert(session.node_id.clone(), session);
    }

    pub fn unregister_by_conn(&mut self, conn_id: &str) -> Option<NodeSession> {
        let node_id = self.by_conn.remove(conn_id)?;
        self.subscriptions.remove(&node_id);
        self.nodes.remove(&node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSession> {
        self.nodes.get(node_id)
    }

    pub fn node_id_for_conn(&self, conn_id: &str) -> Option<&String> {
        self.by_conn.get(conn_id)
    }

    pub fn list(&self) -> Vec<&NodeSession> {
        let mut out: Vec<_> = self.nodes.values().collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn rename(&mut self, node_id: &str, display_name: &str) -> Result<()> {
        let node = self.nodes.get_mut(node_id).ok_or(Error::NodeNotConnected)?;
        node.display_name = Some(display_name.to_string());
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    // ── Invocations ──────────────────────────────────────────────────────

    /// Begin an invocation. With an idempotency key, a repeat call while
    /// the original is outstanding attaches to the same future.
    pub fn begin_invoke(
        &mut self,
        node_id: &str,
        idempotency_key: Option<&str>,
        now_ms: u64,
    ) -> InvokeTicket {
        if let Some(key) = idempotency_key {
            let map_key = format!("{node_id}:{key}");
            if let Some(invoke_id) = self.idempotency.get(&map_key).cloned()
                && let Some(pending) = self.invokes.get_mut(&invoke_id)
            {
                let (tx, rx) = oneshot::channel();
                pending.waiters.push(tx);
                return InvokeTicket::Attached { invoke_id, rx };
            }
        }
        let invoke_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.invokes.insert(invoke_id.clone(), PendingInvoke {
            node_id: node_id.to_string(),
            idempotency_key: idempotency_key.map(|s| s.to_string()),
            waiters: vec![tx],
            created_at_ms: now_ms,
        });
        if let Some(key) = idempotency_key {
            self.idempotency
                .insert(format!("{node_id}:{key}"), invoke_id.clone());
        }
        InvokeTicket::New { invoke_id, rx }
    }

    /// Deliver a node's result. Returns false when no invoke matches
    /// (late or duplicate result; correlation is by invoke id only).
    pub fn complete_invoke(&mut self, invoke_id: &str, outcome: InvokeOutcome) -> bool {
        let Some(pending) = self.invokes.remove(invoke_id) else {
            return false;
        };
        if let Some(key) = &pending.idempotency_key {
            self.idempotency.remove(&format!("{}:{key}", pending.node_id));
        }
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
        true
    }

    /// Reap an invoke after timeout. The future owners already gave up.
    pub fn reap_invoke(&mut self, invoke_id: &str) {
        if let Some(pending) = self.invokes.remove(invoke_id)
            && let Some(key) = &pending.idempotency_key
        {
            self.idempotency.remove(&format!("{}:{key}", pending.node_id));
        }
    }

    pub fn outstanding_invokes(&self) -> usize {
        self.invokes.len()
    }

    /// Oldest outstanding invoke age, for diagnostics.
    pub fn oldest_invoke_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.invokes
            .values()
            .map(|p| now_ms.saturating_sub(p.created_at_ms))
            .max()
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub fn subscribe_chat(&mut self, node_id: &str, session_key: &str) {
        self.subscriptions
            .entry(node_id.to_string())
            .or_default()
            .insert(session_key.to_string());
    }

    pub fn unsubscribe_chat(&mut self, node_id: &str, session_key: &str) {
        if let Some(subs) = self.subscriptions.get_mut(node_id) {
            subs.remove(session_key);
            if subs.is_empty() {
                self.subscriptions.remove(node_id);
            }
        }
    }

    /// Conn ids of nodes subscribed to a session's chat events.
    pub fn subscribed_conns(&self, session_key: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|(_, subs)| subs.contains(session_key))
            .filter_map(|(node_id, _)| self.nodes.get(node_id))
            .map(|n| n.conn_id.clone())
            .collect()
    }

    /// Browser-capable node selection for `browser.request`: explicit
    /// target (id, ip, display name, or id prefix) wins; otherwise only a
    /// single browser-capable node is eligible.
    pub fn resolve_browser_node(&self, target: Option<&str>) -> Option<&NodeSession> {
        let browser_nodes: Vec<&NodeSession> = self
            .nodes
            .values()
            .filter(|n| {
                n.caps.iter().any(|c| c == "browser")
                    || n.commands.iter().any(|c| c == "browser.proxy")
            })
            .collect();
        let query = target.map(str::trim).unwrap_or("");
        if query.is_empty() {
            return if browser_nodes.len() == 1 {
                Some(browser_nodes[0])
            } else {
                None
            };
        }
        let q = query.to_lowercase();
        let matches: Vec<&NodeSession> = browser_nodes
            .into_iter()
            .filter(|n| {
                n.node_id == query
                    || n.remote_ip.as_deref() == Some(query)
                    || n.display_name
                        .as_deref()
                        .map(|d| d.to_lowercase() == q)
                        .unwrap_or(false)
                    || n.node_id.starts_with(query)
            })
            .collect();
        if matches.len() == 1 { Some(matches[0]) } else { None }
    }
}

// ── Allowlists ───────────────────────────────────────────────────────────────

/// Normalize a declared platform into a known platform id.
pub fn normalize_platform(platform: Option<&str>, device_family: Option<&str>) -> &'static str {
    let raw = platform.unwrap_or("").trim().to_lowercase();
    if raw.starts_with("ios") {
        return "ios";
    }
    if raw.starts_with("android") {
        return "android";
    }
    if raw.starts_with("mac") || raw.starts_with("darwin") {
        return "macos";
    }
    if raw.starts_with("win") {
        return "windows";
    }
    if raw.starts_with("linux") {
        return "linux";
    }
    let family = device_family.unwrap_or("").trim().to_lowercase();
    if family.contains("iphone") || family.contains("ipad") || family.contains("ios") {
        return "ios";
    }
    if family.contains("android") {
        return "android";
    }
    if family.contains("mac") {
        return "macos";
    }
    if family.contains("windows") {
        return "windows";
    }
    if family.contains("linux") {
        return "linux";
    }
    "unknown"
}

/// Platform-default command allowlist.
pub fn default_allowlist(platform_id: &str) -> HashSet<String> {
    let canvas = [
        "canvas.present",
        "canvas.hide",
        "canvas.navigate",
        "canvas.eval",
        "canvas.snapshot",
    ];
    let common = ["device.info", "device.status", "location.get", "camera.list"];
    let system = ["system.run", "system.which", "system.notify", "browser.proxy"];

    let names: Vec<&str> = match platform_id {
        "ios" => canvas
            .iter()
            .chain(common.iter())
            .chain(["system.notify", "browser.proxy"].iter())
            .copied()
            .collect(),
        "android" => canvas
            .iter()
            .chain(common.iter())
            .chain(["browser.proxy"].iter())
            .copied()
            .collect(),
        "macos" => canvas
            .iter()
            .chain(common.iter())
            .chain(system.iter())
            .copied()
            .collect(),
        "linux" | "windows" => system.to_vec(),
        _ => canvas
            .iter()
            .chain(["camera.list", "location.get"].iter())
            .chain(system.iter())
            .copied()
            .collect(),
    };
    names.into_iter().map(String::from).collect()
}

/// Effective allowlist: platform defaults plus config additions, minus
/// config removals.
pub fn resolve_allowlist(cfg: &tether_config::NodesConfig, node: &NodeSession) -> HashSet<String> {
    let platform_id = normalize_platform(node.platform.as_deref(), node.device_family.as_deref());
    let mut allow = default_allowlist(platform_id);
    for cmd in &cfg.allow_commands {
        let c = cmd.trim();
        if !c.is_empty() {
            allow.insert(c.to_string());
        }
    }
    for cmd in &cfg.deny_commands {
        allow.remove(cmd.trim());
    }
    allow
}

/// Gate a command: must be allowlisted AND declared by the node. A node
/// that declared no commands cannot be invoked at all.
pub fn is_command_allowed(
    command: &str,
    declared: &[String],
    allowlist: &HashSet<String>,
) -> std::result::Result<(), String> {
    let cmd = command.trim();
    if cmd.is_empty() {
        return Err("command required".into());
    }
    if !allowlist.contains(cmd) {
        return Err("command not allowlisted".into());
    }
    if declared.iter().all(|c| c.trim().is_empty()) {
        return Err("node did not declare commands".into());
    }
    if !declared.iter().any(|c| c.trim() == cmd) {
        return Err("command not declared by node".into());
    }
    Ok(())
}
