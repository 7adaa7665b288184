//! Exec-approval coordination: pending records, decision futures with
//! attach-after-create semantics, expiry sweeping, optional chat
//! forwarding.

use std::collections::HashMap;

use {
    regex::Regex,
    tokio::sync::{Mutex, watch},
    tracing::{debug, warn},
};

use tether_config::{ExecApprovalsConfig, TetherConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command is required")]
    CommandRequired,

    #[error("approval id already pending")]
    AlreadyPending,

    #[error("approval expired or not found")]
    NotFound,

    #[error("approval already resolved with a different decision")]
    DecisionConflict,

    #[error("invalid decision: {0}")]
    InvalidDecision(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AllowOnce,
    AllowAlways,
    Deny,
}

impl Decision {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow-once" => Ok(Self::AllowOnce),
            "allow-always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            other => Err(Error::InvalidDecision(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }
}

/// State observed by decision futures. `watch` retains the last value, so
/// an attacher arriving after resolution still sees the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecisionState {
    #[default]
    Pending,
    Resolved(Decision),
    Expired,
}

#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub id: String,
    pub request: serde_json::Value,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: &'static str, // pending | resolved | expired
    pub decision: Option<Decision>,
    pub requested_by: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at_ms: Option<u64>,
}

impl ApprovalRecord {
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "request": self.request,
            "createdAtMs": self.created_at_ms,
            "expiresAtMs": self.expires_at_ms,
            "status": self.status,
        })
    }
}

/// Outcome of `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Record was already resolved with the same decision; no state change.
    AlreadyResolved,
}

struct PendingSlot {
    record: ApprovalRecord,
    tx: watch::Sender<DecisionState>,
}

// ── Coordinator ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ApprovalCoordinator {
    pending: Mutex<HashMap<String, PendingSlot>>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired records: mark `expired`, resolve their futures with
    /// `Expired`. Called lazily at the entry of every approval RPC and by
    /// the periodic tick.
    pub async fn sweep(&self, now_ms: u64) -> Vec<ApprovalRecord> {
        let mut pending = self.pending.lock().await;
        let mut expired = Vec::new();
        for slot in pending.values_mut() {
            if slot.record.status == "pending" && slot.record.expires_at_ms < now_ms {
                slot.record.status = "expired";
                let _ = slot.tx.send(DecisionState::Expired);
                expired.push(slot.record.clone());
            }
        }
        expired
    }

    /// Admit a new pending approval and return its decision future.
    pub async fn create(
        &self,
        id: &str,
        request: serde_json::Value,
        timeout_ms: u64,
        requested_by: Option<String>,
        now_ms: u64,
    ) -> Result<(ApprovalRecord, watch::Receiver<DecisionState>)> {
        let command_ok = request
            .get("command")
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !command_ok {
            return Err(Error::CommandRequired);
        }
        let mut pending = self.pending.lock().await;
        if let Some(slot) = pending.get(id)
            && slot.record.status == "pending"
        {
            return Err(Error::AlreadyPending);
        }
        let record = ApprovalRecord {
            id: id.to_string(),
            request,
            created_at_ms: now_ms,
            expires_at_ms: now_ms + timeout_ms.max(1),
            status: "pending",
            decision: None,
            requested_by,
            resolved_by: None,
            resolved_at_ms: None,
        };
        let (tx, rx) = watch::channel(DecisionState::Pending);
        pending.insert(id.to_string(), PendingSlot {
            record: record.clone(),
            tx,
        });
        debug!(id, "approval request created");
        Ok((record, rx))
    }

    /// Attach to an existing record's future (`waitDecision`). Returns the
    /// record and a receiver; a record that already carries a decision
    /// yields it immediately through the receiver's current value.
    pub async fn attach(&self, id: &str) -> Result<(ApprovalRecord, watch::Receiver<DecisionState>)> {
        let pending = self.pending.lock().await;
        let slot = pending.get(id).ok_or(Error::NotFound)?;
        Ok((slot.record.clone(), slot.tx.subscribe()))
    }

    /// Store a decision and resolve the future.
    pub async fn resolve(
        &self,
        id: &str,
        decision: Decision,
        resolved_by: Option<String>,
        now_ms: u64,
    ) -> Result<(ApprovalRecord, ResolveOutcome)> {
        let mut pending = self.pending.lock().await;
        let slot = pending.get_mut(id).ok_or(Error::NotFound)?;
        if slot.record.status == "resolved" {
            return if slot.record.decision == Some(decision) {
                Ok((slot.record.clone(), ResolveOutcome::AlreadyResolved))
            } else {
                Err(Error::DecisionConflict)
            };
        }
        if slot.record.status == "expired" {
            return Err(Error::NotFound);
        }
        slot.record.status = "resolved";
        slot.record.decision = Some(decision);
        slot.record.resolved_by = resolved_by;
        slot.record.resolved_at_ms = Some(now_ms);
        let _ = slot.tx.send(DecisionState::Resolved(decision));
        debug!(id, decision = decision.as_str(), "approval resolved");
        Ok((slot.record.clone(), ResolveOutcome::Resolved))
    }

    /// Unresolved, unexpired records.
    pub async fn pending(&self, now_ms: u64) -> Vec<ApprovalRecord> {
        let pending = self.pending.lock().await;
        let mut out: Vec<_> = pending
            .values()
            .filter(|s| s.record.status == "pending" && s.record.expires_at_ms >= now_ms)
            .map(|s| s.record.clone())
            .collect();
        out.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        out
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRecord> {
        self.pending.lock().await.get(id).map(|s| s.record.clone())
    }

    /// Wait on a decision future, bounded by `timeout_ms`. Returns the
    /// decision, or None on expiry/timeout.
    pub async fn await_decision(
        mut rx: watch::Receiver<DecisionState>,
        timeout_ms: u64,
    ) -> Option<Decision> {
        let deadline = std::time::Duration::from_millis(timeout_ms.max(1));
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    DecisionState::Resolved(decision) => return Some(decision),
                    DecisionState::Expired => return None,
                    DecisionState::Pending => {},
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => None,
        }
    }
}

// ── Forwarding ───────────────────────────────────────────────────────────────

/// Message handed to the external bus when an approval is forwarded to chat.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub to: String,
    pub text: String,
}

/// Whether this approval should be forwarded, per filters.
pub fn should_forward(cfg: &ExecApprovalsConfig, request: &serde_json::Value) -> bool {
    if !cfg.enabled {
        return false;
    }
    if !cfg.agent_filter.is_empty() {
        let agent_id = request.get("agentId").and_then(|v| v.as_str()).unwrap_or("");
        if agent_id.is_empty() || !cfg.agent_filter.iter().any(|a| a == agent_id) {
            return false;
        }
    }
    if !cfg.session_filter.is_empty() {
        let session_key = request
            .get("sessionKey")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if session_key.is_empty() {
            return false;
        }
        let matched = cfg.session_filter.iter().any(|pattern| {
            session_key.contains(pattern.as_str())
                || Regex::new(pattern)
                    .map(|re| re.is_match(session_key))
                    .unwrap_or(false)
        });
        if !matched {
            return false;
        }
    }
    true
}

/// Resolve `(channel, to)` delivery targets for a forwarded approval.
pub fn forward_targets(cfg: &TetherConfig, request: &serde_json::Value) -> Vec<(String, String)> {
    let exec = &cfg.approvals.exec;
    let mode = match exec.mode.trim().to_ascii_lowercase().as_str() {
        m @ ("session" | "targets" | "both") => m.to_string(),
        _ => "session".into(),
    };
    let mut targets = Vec::new();
    let mut seen = std::collections::HashSet::new();

    if mode == "session" || mode == "both" {
        let session_key = request
            .get("sessionKey")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if let Some((channel, chat_id)) = session_key.split_once(':')
            && !channel.trim().is_empty()
            && !chat_id.trim().is_empty()
            && seen.insert(format!("{channel}:{chat_id}"))
        {
            targets.push((channel.trim().to_string(), chat_id.trim().to_string()));
        }
    }
    if mode == "targets" || mode == "both" {
        for target in &exec.targets {
            if !target.channel.is_empty()
                && !target.to.is_empty()
                && seen.insert(format!("{}:{}", target.channel, target.to))
            {
                targets.push((target.channel.clone(), target.to.clone()));
            }
        }
    }
    targets
}

/// Text for a forwarded approval request.
pub fn build_request_message(record: &ApprovalRecord, now_ms: u64) -> String {
    let command = record
        .request
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    let host = record.request.get("host").and_then(|v| v.as_str());
    let expires_in_s = record.expires_at_ms.saturating_sub(now_ms) / 1000;
    let mut text = format!(
        "Exec approval requested ({id}):\n  {command}\n",
        id = record.id
    );
    if let Some(host) = host {
        text.push_str(&format!("  host: {host}\n"));
    }
    text.push_str(&format!(
        "Reply /approve {id} or /deny {id} within {expires_in_s}s.",
        id = record.id
    ));
    text
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str) -> serde_json::Value {
        serde_json::json!({"command": command, "sessionKey": "telegram:42", "agentId": "main"})
    }

    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let coord = std::sync::Arc::new(ApprovalCoordinator::new());
        let (_, rx) = coord
            .create("a1", request("ls"), 5_000, None, 0)
            .await
            .unwrap();
        let waiter = tokio::spawn(ApprovalCoordinator::await_decision(rx, 5_000));
        tokio::task::yield_now().await;
        coord
            .resolve("a1", Decision::AllowOnce, Some("op-1".into()), 10)
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap(), Some(Decision::AllowOnce));
    }

    #[tokio::test]
    async fn attach_after_resolve_sees_decision() {
        let coord = ApprovalCoordinator::new();
        coord.create("a1", request("ls"), 5_000, None, 0).await.unwrap();
        coord.resolve("a1", Decision::Deny, None, 1).await.unwrap();
        let (record, rx) = coord.attach("a1").await.unwrap();
        assert_eq!(record.status, "resolved");
        assert_eq!(
            ApprovalCoordinator::await_decision(rx, 10).await,
            Some(Decision::Deny)
        );
    }

    #[tokio::test]
    async fn sweep_expires_and_resolves_future() {
        let coord = ApprovalCoordinator::new();
        let (_, rx) = coord
            .create("a2", request("rm -rf /tmp/x"), 100, None, 0)
            .await
            .unwrap();
        let expired = coord.sweep(200).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(ApprovalCoordinator::await_decision(rx, 10).await, None);
        assert!(coord.pending(200).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_pending_id_rejected() {
        let coord = ApprovalCoordinator::new();
        coord.create("a1", request("ls"), 5_000, None, 0).await.unwrap();
        assert!(matches!(
            coord.create("a1", request("ls"), 5_000, None, 1).await,
            Err(Error::AlreadyPending)
        ));
    }

    #[tokio::test]
    async fn resolve_twice_same_decision_is_noop() {
        let coord = ApprovalCoordinator::new();
        coord.create("a1", request("ls"), 5_000, None, 0).await.unwrap();
        coord
            .resolve("a1", Decision::AllowOnce, None, 1)
            .await
            .unwrap();
        let (record, outcome) = coord
            .resolve("a1", Decision::AllowOnce, None, 2)
            .await
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::AlreadyResolved);
        assert_eq!(record.resolved_at_ms, Some(1));
    }

    #[tokio::test]
    async fn resolve_twice_conflicting_decision_errors() {
        let coord = ApprovalCoordinator::new();
        coord.create("a1", request("ls"), 5_000, None, 0).await.unwrap();
        coord.resolve("a1", Decision::AllowOnce, None, 1).await.unwrap();
        assert!(matches!(
            coord.resolve("a1", Decision::Deny, None, 2).await,
            Err(Error::DecisionConflict)
        ));
    }

    #[tokio::test]
    async fn missing_command_rejected() {
        let coord = ApprovalCoordinator::new();
        assert!(matches!(
            coord
                .create("a1", serde_json::json!({"command": "  "}), 1000, None, 0)
                .await,
            Err(Error::CommandRequired)
        ));
    }

    #[test]
    fn decision_parses_kebab_case() {
        assert_eq!(Decision::parse("allow-once").unwrap(), Decision::AllowOnce);
        assert_eq!(Decision::parse("DENY").unwrap(), Decision::Deny);
        assert!(Decision::parse("maybe").is_err());
    }

    #[test]
    fn forward_filters_by_agent_and_session() {
        let mut exec = ExecApprovalsConfig {
            enabled: true,
            ..ExecApprovalsConfig::default()
        };
        assert!(should_forward(&exec, &request("ls")));
        exec.agent_filter = vec!["other".into()];
        assert!(!should_forward(&exec, &request("ls")));
        exec.agent_filter = vec!["main".into()];
        exec.session_filter = vec!["telegram".into()];
        assert!(should_forward(&exec, &request("ls")));
        exec.session_filter = vec!["^discord:".into()];
        assert!(!should_forward(&exec, &request("ls")));
    }

    #[test]
    fn forward_targets_dedupe_session_and_config() {
        let mut cfg = TetherConfig::default();
        cfg.approvals.exec.enabled = true;
        cfg.approvals.exec.mode = "both".into();
        cfg.approvals.exec.targets = vec![
            tether_config::ApprovalForwardTarget {
                channel: "telegram".into(),
                to: "42".into(),
            },
            tether_config::ApprovalForwardTarget {
                channel: "slack".into(),
                to: "ops".into(),
            },
        ];
        let targets = forward_targets(&cfg, &request("ls"));
        assert_eq!(targets, vec![
            ("telegram".to_string(), "42".to_string()),
            ("slack".to_string(), "ops".to_string()),
        ]);
    }
}
