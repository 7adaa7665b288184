//! Shared gateway runtime state, wrapped in `Arc` for use across tasks.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use {
    dashmap::DashMap,
    tokio::sync::{RwLock, mpsc},
};

use {
    tether_agents::{AgentCatalog, AgentService},
    tether_config::TetherConfig,
    tether_sessions::SessionStore,
    tether_storage::SlotStore,
};

use crate::{
    alerts::AlertLifecycle,
    approval::ApprovalCoordinator,
    auth::AuthRateLimiter,
    cron_jobs::CronRegistry,
    lanes::LaneRegistry,
    logs::RunLog,
    nodes::NodeRegistry,
    pairing::PairingStore,
    presence::PresenceStore,
    services::GatewayServices,
    shadow::{LegacyReads, NoLegacyReads},
    traces::TraceLog,
};

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A client currently attached to the gateway.
#[derive(Debug)]
pub struct ConnectedClient {
    pub conn_id: String,
    /// operator | node | unknown (pre-connect).
    pub role: String,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    /// Flips on a successful `connect`.
    pub connected: bool,
    /// Nonce issued in the `connect.challenge` event.
    pub connect_nonce: String,
    pub remote_ip: String,
    /// Channel feeding this client's write loop.
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at_ms: u64,
    pub last_activity_ms: u64,
}

impl ConnectedClient {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s == tether_protocol::scopes::ADMIN || s == scope)
    }

    /// Send a serialized frame. False when the write loop is gone.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity_ms = now;
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

pub struct GatewayState {
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonic event sequence shared by all outbound events.
    seq: AtomicU64,
    /// stateVersion counters attached to broadcast events.
    presence_version: AtomicU64,
    health_version: AtomicU64,

    pub config: RwLock<TetherConfig>,
    pub storage: Arc<dyn SlotStore>,
    pub services: GatewayServices,
    pub agent: Arc<dyn AgentService>,
    pub catalog: Arc<AgentCatalog>,
    pub sessions: Arc<SessionStore>,
    pub legacy_reads: Arc<dyn LegacyReads>,

    pub presence: RwLock<PresenceStore>,
    pub nodes: RwLock<NodeRegistry>,
    pub lanes: LaneRegistry,
    pub approvals: ApprovalCoordinator,
    pub alerts: AlertLifecycle,
    pub traces: TraceLog,
    pub cron: CronRegistry,
    pub run_log: RunLog,
    pub pairing: PairingStore,
    pub rate_limiter: AuthRateLimiter,
    /// Abort-requested flags, polled synchronously by running agent jobs.
    abort_flags: DashMap<String, Arc<AtomicBool>>,

    /// Registered method names, filled in once the registry is built.
    pub method_names: RwLock<Vec<String>>,
    pub version: String,
    pub hostname: String,
    pub started_at_ms: u64,
    /// Whether the wallet key was unlocked from the environment at startup.
    pub wallet_unlocked: bool,
}

impl GatewayState {
    pub fn new(
        config: TetherConfig,
        storage: Arc<dyn SlotStore>,
        services: GatewayServices,
        agent: Arc<dyn AgentService>,
    ) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let wallet_unlocked = std::env::var(tether_config::ENV_WALLET_PASSWORD)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        let log_path = dirs_next::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".tether")
            .join("logs")
            .join("gateway.jsonl");

        let state = Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            presence_version: AtomicU64::new(0),
            health_version: AtomicU64::new(0),
            rate_limiter: AuthRateLimiter::from_config(&config),
            lanes: LaneRegistry::new(config.lanes.max_pending_per_lane),
            traces: TraceLog::new(config.alerts.trace_step_chars),
            alerts: AlertLifecycle::new(Arc::clone(&storage)),
            cron: CronRegistry::new(Arc::clone(&storage)),
            pairing: PairingStore::new(Arc::clone(&storage)),
            run_log: RunLog::new(log_path),
            config: RwLock::new(config),
            storage,
            services,
            agent,
            catalog: AgentCatalog::with_default_agent(),
            sessions: Arc::new(SessionStore::new()),
            legacy_reads: Arc::new(NoLegacyReads),
            presence: RwLock::new(PresenceStore::new()),
            nodes: RwLock::new(NodeRegistry::new()),
            approvals: ApprovalCoordinator::new(),
            abort_flags: DashMap::new(),
            method_names: RwLock::new(Vec::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            started_at_ms: now_ms(),
            wallet_unlocked,
        };
        Arc::new(state)
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bump_presence_version(&self) -> u64 {
        self.presence_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bump_health_version(&self) -> u64 {
        self.health_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state_version(&self) -> tether_protocol::StateVersion {
        tether_protocol::StateVersion {
            presence: self.presence_version.load(Ordering::Relaxed),
            health: self.health_version.load(Ordering::Relaxed),
        }
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Send a serialized frame to one connection. False when gone.
    pub async fn send_to_conn(&self, conn_id: &str, frame: &str) -> bool {
        let clients = self.clients.read().await;
        clients.get(conn_id).map(|c| c.send(frame)).unwrap_or(false)
    }

    /// Gateway uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms) / 1000
    }

    // ── Abort flags ──────────────────────────────────────────────────────

    /// Flag handle for a run, created on first use. The agent loop polls
    /// it between suspension points.
    pub fn abort_flag(&self, run_id: &str) -> Arc<AtomicBool> {
        self.abort_flags
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub fn request_abort(&self, run_id: &str) {
        self.abort_flag(run_id).store(true, Ordering::Relaxed);
    }

    pub fn abort_requested(&self, run_id: &str) -> bool {
        self.abort_flags
            .get(run_id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn clear_abort(&self, run_id: &str) {
        self.abort_flags.remove(run_id);
    }
}
