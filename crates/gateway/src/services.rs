//! Trait interfaces for collaborators the gateway delegates to. Each
//! trait has a `Noop` implementation returning empty/default responses so
//! the gateway runs standalone before the domain services are wired in.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use crate::approval::OutboundMessage;

pub type ServiceError = String;
pub type ServiceResult<T = Value> = Result<T, ServiceError>;

// ── Channels ─────────────────────────────────────────────────────────────────

/// Channel adapter status, consumed by the overview and alert builders.
#[async_trait]
pub trait ChannelStatusService: Send + Sync {
    /// `{ ts, channelOrder, channelLabels, channels: { name: { configured, running, connected } } }`
    async fn snapshot(&self, now_ms: u64) -> Value;

    async fn logout(&self, channel: &str) -> ServiceResult;
}

pub struct NoopChannelStatus;

#[async_trait]
impl ChannelStatusService for NoopChannelStatus {
    async fn snapshot(&self, now_ms: u64) -> Value {
        serde_json::json!({
            "ts": now_ms,
            "channelOrder": [],
            "channelLabels": {},
            "channels": {},
        })
    }

    async fn logout(&self, channel: &str) -> ServiceResult {
        Ok(serde_json::json!({
            "ok": true,
            "channel": channel,
            "loggedOut": false,
            "message": "logout not supported",
        }))
    }
}

// ── Message bus ──────────────────────────────────────────────────────────────

/// Outbound chat delivery, used by approval forwarding.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> ServiceResult<()>;
}

pub struct NoopMessageBus;

#[async_trait]
impl MessageBus for NoopMessageBus {
    async fn send(&self, _message: OutboundMessage) -> ServiceResult<()> {
        Ok(())
    }
}

// ── Plugins ──────────────────────────────────────────────────────────────────

/// Hosted plugin surface. Plugin-declared gateway methods dispatch through
/// `dispatch`; everything else is catalog/introspection.
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn list(&self) -> Value;
    async fn info(&self, id: &str) -> ServiceResult;
    async fn doctor(&self) -> Value;
    async fn reload(&self) -> ServiceResult;
    /// Methods plugins expose through the gateway.
    async fn gateway_methods(&self) -> Vec<String>;
    async fn dispatch(&self, method: &str, params: &Value) -> ServiceResult;
}

pub struct NoopPluginHost;

#[async_trait]
impl PluginHost for NoopPluginHost {
    async fn list(&self) -> Value {
        serde_json::json!({"plugins": []})
    }

    async fn info(&self, id: &str) -> ServiceResult {
        Err(format!("unknown plugin: {id}"))
    }

    async fn doctor(&self) -> Value {
        serde_json::json!({"ok": true, "issues": []})
    }

    async fn reload(&self) -> ServiceResult {
        Ok(serde_json::json!({"ok": true, "reloaded": 0}))
    }

    async fn gateway_methods(&self) -> Vec<String> {
        Vec::new()
    }

    async fn dispatch(&self, method: &str, _params: &Value) -> ServiceResult {
        Err(format!("no plugin handles method: {method}"))
    }
}

// ── Update runner ────────────────────────────────────────────────────────────

/// Self-update execution. Single-flight is enforced by the caller through
/// the `rpc.update_status` slot.
#[async_trait]
pub trait UpdateRunner: Send + Sync {
    async fn run(&self) -> ServiceResult;
}

pub struct NoopUpdateRunner;

#[async_trait]
impl UpdateRunner for NoopUpdateRunner {
    async fn run(&self) -> ServiceResult {
        Ok(serde_json::json!({"ok": true, "updated": false, "message": "updater not configured"}))
    }
}

// ── Web login ────────────────────────────────────────────────────────────────

/// Channel web-login bridge (QR based).
#[async_trait]
pub trait WebLoginService: Send + Sync {
    /// Start a login attempt; returns `{ qrDataUrl?, connected, message? }`.
    async fn start(&self, timeout_ms: u64) -> ServiceResult;
    /// Wait until the channel reports connected (or timeout).
    async fn wait(&self, timeout_ms: u64) -> ServiceResult;
}

pub struct NoopWebLogin;

#[async_trait]
impl WebLoginService for NoopWebLogin {
    async fn start(&self, _timeout_ms: u64) -> ServiceResult {
        Err("web login bridge not configured".into())
    }

    async fn wait(&self, _timeout_ms: u64) -> ServiceResult {
        Err("web login bridge not configured".into())
    }
}

// ── Auth profiles ────────────────────────────────────────────────────────────

/// LLM auth-profile availability report, consumed by alerts.
#[async_trait]
pub trait AuthProfileService: Send + Sync {
    /// `{ providers: [{ provider, available, ... }] }`
    async fn report(&self) -> Value;
}

pub struct NoopAuthProfiles;

#[async_trait]
impl AuthProfileService for NoopAuthProfiles {
    async fn report(&self) -> Value {
        serde_json::json!({"providers": []})
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────────

/// Capability record wiring the gateway to its collaborators, assembled at
/// process start. Handlers take what they need from here instead of
/// reaching into globals.
#[derive(Clone)]
pub struct GatewayServices {
    pub channels: Arc<dyn ChannelStatusService>,
    pub bus: Arc<dyn MessageBus>,
    pub plugins: Arc<dyn PluginHost>,
    pub updater: Arc<dyn UpdateRunner>,
    pub web_login: Arc<dyn WebLoginService>,
    pub auth_profiles: Arc<dyn AuthProfileService>,
}

impl Default for GatewayServices {
    fn default() -> Self {
        Self {
            channels: Arc::new(NoopChannelStatus),
            bus: Arc::new(NoopMessageBus),
            plugins: Arc::new(NoopPluginHost),
            updater: Arc::new(NoopUpdateRunner),
            web_login: Arc::new(NoopWebLogin),
            auth_profiles: Arc::new(NoopAuthProfiles),
        }
    }
}
