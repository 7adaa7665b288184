use serde::{Deserialize, Serialize};

/// Root configuration. Every section has serde defaults so a missing or
/// partial config file still yields a runnable gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct TetherConfig {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub approvals: ApprovalsConfig,
    pub nodes: NodesConfig,
    pub lanes: LanesConfig,
    pub alerts: AlertsConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub rpc_enabled: bool,
    /// Non-empty: only these methods (plus connect/health/status) dispatch.
    pub rpc_canary_methods: Vec<String>,
    /// Run legacy read paths alongside primary ones and log divergence.
    pub rpc_shadow_reads: bool,
    /// Local browser-control HTTP URL used when no browser node is connected.
    pub browser_control_url: Option<String>,
    /// Preferred node for browser.request when several are connected.
    pub node_browser_target: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
            rpc_enabled: true,
            rpc_canary_methods: Vec::new(),
            rpc_shadow_reads: false,
            browser_control_url: None,
            node_browser_target: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared control token; `TETHER_CONTROL_TOKEN` overrides.
    pub token: Option<String>,
    /// Control password; `TETHER_CONTROL_PASSWORD` overrides.
    pub password: Option<String>,
    /// Development only: accept connects with no credentials.
    pub allow_insecure_auth: bool,
    /// Exempt loopback peers from the auth rate limiter.
    pub rate_limit_exempt_loopback: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            password: None,
            allow_insecure_auth: false,
            rate_limit_exempt_loopback: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalsConfig {
    pub exec: ExecApprovalsConfig,
}

/// Forwarding of exec approvals to chat targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecApprovalsConfig {
    pub enabled: bool,
    /// "session" | "targets" | "both"
    pub mode: String,
    pub targets: Vec<ApprovalForwardTarget>,
    /// Only forward approvals raised by these agent ids.
    pub agent_filter: Vec<String>,
    /// Only forward approvals whose sessionKey matches one of these
    /// substrings or regexes.
    pub session_filter: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApprovalForwardTarget {
    pub channel: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodesConfig {
    /// Commands added to every platform allowlist.
    pub allow_commands: Vec<String>,
    /// Commands removed from every platform allowlist.
    pub deny_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanesConfig {
    /// Max pending items per session lane.
    pub max_pending_per_lane: usize,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            max_pending_per_lane: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    /// Trace step payload cap in chars.
    pub trace_step_chars: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            trace_step_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_ms: 60_000,
            lockout_ms: 300_000,
        }
    }
}
