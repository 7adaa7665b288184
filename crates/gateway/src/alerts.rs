//! Operational alerts: gathering, normalization, dedup, lifecycle
//! tracking, action validation.
//!
//! The normalize-then-lifecycle flow is pure given the previously
//! persisted state, so everything except slot I/O lives in free functions.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Value, json};

use tether_storage::{SlotStore, slots};

const RESOLVED_RECENT_STORED: usize = 200;
const RESOLVED_RECENT_RETURNED: usize = 50;

// ── Gathering ────────────────────────────────────────────────────────────────

fn priority_for(level: &str) -> i64 {
    match level.trim().to_ascii_lowercase().as_str() {
        "critical" => 200,
        "warning" => 100,
        _ => 0,
    }
}

/// Build raw alerts from the gathered status inputs.
pub fn build_operational_alerts(
    auth_profiles: &Value,
    channels_snapshot: &Value,
    cron_status: Option<&Value>,
    worker_status: &Value,
    now_ms: u64,
) -> Vec<Value> {
    let mut alerts = Vec::new();

    // Auth profiles: provider-level availability.
    if let Some(providers) = auth_profiles.get("providers").and_then(|v| v.as_array()) {
        let down: Vec<&str> = providers
            .iter()
            .filter(|p| p.get("available").and_then(|v| v.as_bool()) == Some(false))
            .filter_map(|p| p.get("provider").and_then(|v| v.as_str()))
            .collect();
        if !down.is_empty() {
            let all_down = down.len() == providers.len();
            alerts.push(json!({
                "source": "auth",
                "category": "profiles",
                "level": if all_down { "critical" } else { "warning" },
                "code": if all_down { "AUTH_PROFILES_DOWN" } else { "AUTH_PROFILES_DEGRADED" },
                "title": if all_down { "Auth profiles unavailable" } else { "Auth profiles degraded" },
                "message": format!("Unavailable providers: {}", down.join(", ")),
            }));
            for provider in down {
                alerts.push(json!({
                    "source": "auth",
                    "category": "provider",
                    "level": "warning",
                    "code": "AUTH_PROVIDER_DOWN",
                    "title": "Auth provider down",
                    "message": format!("Provider {provider} is unavailable"),
                    "provider": provider,
                }));
            }
        }
    }

    // Channels: configured-but-not-running.
    if let Some(channels) = channels_snapshot.get("channels").and_then(|v| v.as_object()) {
        let configured: Vec<&str> = channels
            .iter()
            .filter(|(_, st)| st.get("configured").and_then(|v| v.as_bool()) == Some(true))
            .map(|(name, _)| name.as_str())
            .collect();
        let not_running: Vec<&str> = configured
            .iter()
            .filter(|name| {
                channels
                    .get(**name)
                    .and_then(|st| st.get("running"))
                    .and_then(|v| v.as_bool())
                    != Some(true)
            })
            .copied()
            .collect();
        if !not_running.is_empty() {
            let all_down = not_running.len() == configured.len();
            alerts.push(json!({
                "source": "channels",
                "category": "availability",
                "level": if all_down { "critical" } else { "warning" },
                "code": if all_down { "CHANNELS_UNAVAILABLE_ALL" } else { "CHANNELS_UNAVAILABLE_PARTIAL" },
                "title": if all_down { "Channels unavailable" } else { "Some channels unavailable" },
                "message": if all_down {
                    "All configured channels are not running.".to_string()
                } else {
                    format!("Unavailable channels: {}", not_running.join(", "))
                },
                "channels": not_running,
            }));
        }
    }

    // Cron: enabled with jobs but no upcoming wake.
    if let Some(cron) = cron_status {
        let enabled = cron.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
        let jobs = cron.get("jobs").and_then(|v| v.as_u64()).unwrap_or(0);
        let next_wake = cron.get("nextWakeAtMs").and_then(|v| v.as_u64());
        if enabled && jobs > 0 && next_wake.is_none() {
            alerts.push(json!({
                "source": "cron",
                "category": "scheduler",
                "level": "warning",
                "code": "CRON_SCHEDULER_STALLED",
                "title": "Cron scheduler stalled",
                "message": "Cron is enabled with active jobs but next wake time is missing.",
            }));
        }
    }

    // Control-plane worker heartbeat.
    if let Some(worker) = worker_status.as_object()
        && !worker.is_empty()
        && worker.get("running").and_then(|v| v.as_bool()) == Some(true)
    {
        let updated_at = worker
            .get("updatedAtMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if updated_at > 0 && now_ms.saturating_sub(updated_at) > 120_000 {
            alerts.push(json!({
                "source": "control_plane",
                "category": "worker",
                "level": "critical",
                "code": "CONTROL_PLANE_WORKER_STALE",
                "title": "Control plane worker heartbeat stale",
                "message": "Worker status has not been updated for over 120 seconds.",
                "lastUpdateMs": updated_at,
            }));
        }
    }

    alerts
}

// ── Code profiles & actions ──────────────────────────────────────────────────

struct CodeProfile {
    canonical: &'static str,
    aliases: &'static [&'static str],
    action: fn() -> Value,
    policy: fn() -> Value,
}

fn read_policy() -> Value {
    json!({"riskLevel": "low", "confirmRequired": false, "safeInReadonly": true, "requiresScope": "operator.read"})
}

fn write_policy(risk: &str) -> Value {
    json!({"riskLevel": risk, "confirmRequired": true, "safeInReadonly": false, "requiresScope": "operator.write"})
}

fn code_profile(code: &str) -> Option<CodeProfile> {
    match code {
        "AUTH_PROFILES_DOWN" => Some(CodeProfile {
            canonical: "AUTH.UNAVAILABLE.ALL",
            aliases: &["auth_profiles_down"],
            action: || json!({"type": "navigate", "name": "openPage", "target": "settings.auth", "params": {"tab": "profiles"}}),
            policy: read_policy,
        }),
        "AUTH_PROFILES_DEGRADED" => Some(CodeProfile {
            canonical: "AUTH.UNAVAILABLE.PARTIAL",
            aliases: &["auth_profiles_degraded"],
            action: || json!({"type": "navigate", "name": "openPage", "target": "settings.auth", "params": {"tab": "profiles"}}),
            policy: read_policy,
        }),
        "AUTH_PROVIDER_DOWN" => Some(CodeProfile {
            canonical: "AUTH.PROVIDER.DOWN",
            aliases: &[],
            action: || json!({"type": "navigate", "name": "openPage", "target": "settings.auth.provider"}),
            policy: read_policy,
        }),
        "CHANNELS_UNAVAILABLE_ALL" => Some(CodeProfile {
            canonical: "CHANNELS.UNAVAILABLE.ALL",
            aliases: &[],
            action: || json!({"type": "run_command", "name": "diagnoseChannels", "command": "tether", "args": ["channels", "status"]}),
            policy: || write_policy("medium"),
        }),
        "CHANNELS_UNAVAILABLE_PARTIAL" => Some(CodeProfile {
            canonical: "CHANNELS.UNAVAILABLE.PARTIAL",
            aliases: &[],
            action: || json!({"type": "run_command", "name": "diagnoseChannels", "command": "tether", "args": ["channels", "status"]}),
            policy: || write_policy("medium"),
        }),
        "CRON_SCHEDULER_STALLED" => Some(CodeProfile {
            canonical: "CRON.SCHEDULER.STALLED",
            aliases: &[],
            action: || json!({"type": "open_url", "name": "openCronOverview", "url": "/control/overview"}),
            policy: read_policy,
        }),
        "CONTROL_PLANE_WORKER_STALE" => Some(CodeProfile {
            canonical: "CONTROL_PLANE.WORKER.STALE",
            aliases: &[],
            action: || json!({"type": "run_command", "name": "restartWorker", "command": "tether", "args": ["worker", "restart"]}),
            policy: || write_policy("high"),
        }),
        _ => None,
    }
}

const PROFILE_CODES: &[&str] = &[
    "AUTH_PROFILES_DOWN",
    "AUTH_PROFILES_DEGRADED",
    "AUTH_PROVIDER_DOWN",
    "CHANNELS_UNAVAILABLE_ALL",
    "CHANNELS_UNAVAILABLE_PARTIAL",
    "CRON_SCHEDULER_STALLED",
    "CONTROL_PLANE_WORKER_STALE",
];

fn action_schema(action: &Value) -> Value {
    match action.get("type").and_then(|v| v.as_str()).unwrap_or("none") {
        "navigate" => json!({
            "type": "object",
            "required": ["type", "name", "target"],
            "properties": {
                "type": {"type": "string", "enum": ["navigate"]},
                "name": {"type": "string"},
                "target": {"type": "string"},
                "params": {"type": "object"},
            },
        }),
        "run_command" => json!({
            "type": "object",
            "required": ["type", "name", "command", "args"],
            "properties": {
                "type": {"type": "string", "enum": ["run_command"]},
                "name": {"type": "string"},
                "command": {"type": "string"},
                "args": {"type": "array", "items": {"type": "string"}},
                "params": {"type": "object"},
            },
        }),
        "open_url" => json!({
            "type": "object",
            "required": ["type", "name", "url"],
            "properties": {
                "type": {"type": "string", "enum": ["open_url"]},
                "name": {"type": "string"},
                "url": {"type": "string"},
                "params": {"type": "object"},
            },
        }),
        _ => json!({
            "type": "object",
            "required": ["type"],
            "properties": {"type": {"type": "string", "enum": ["none"]}, "params": {"type": "object"}},
        }),
    }
}

fn validation_rule(action: &Value) -> Value {
    match action.get("type").and_then(|v| v.as_str()).unwrap_or("none") {
        "navigate" => json!({
            "mode": "exact_fields",
            "type": "navigate",
            "target": action.get("target").and_then(|v| v.as_str()).unwrap_or(""),
        }),
        "run_command" => json!({
            "mode": "command_whitelist",
            "type": "run_command",
            "command": action.get("command").and_then(|v| v.as_str()).unwrap_or("tether"),
            "argsPrefix": action.get("args").cloned().unwrap_or_else(|| json!([])),
            "allowExtraFlags": ["--server"],
        }),
        "open_url" => json!({
            "mode": "exact_fields",
            "type": "open_url",
            "url": action.get("url").and_then(|v| v.as_str()).unwrap_or("/control/overview"),
        }),
        _ => json!({"mode": "none", "type": "none"}),
    }
}

/// Server-side validation of a candidate action against the per-code rule.
/// Unvalidated actions must never be displayed as executable.
pub fn validate_action(code: &str, candidate: Option<&Value>) -> Value {
    let Some(profile) = code_profile(code) else {
        return json!({"ok": false, "reason": "unknown_code", "normalizedAction": null});
    };
    let expected = (profile.action)();
    let rule = validation_rule(&expected);
    let actual = candidate.cloned().unwrap_or_else(|| expected.clone());
    let expected_type = rule.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let actual_type = actual.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if actual_type != expected_type {
        return json!({"ok": false, "reason": "type_mismatch", "normalizedAction": null, "rule": rule});
    }
    match expected_type {
        "navigate" => {
            if actual.get("target") != rule.get("target") {
                return json!({"ok": false, "reason": "target_mismatch", "normalizedAction": null, "rule": rule});
            }
        },
        "open_url" => {
            if actual.get("url") != rule.get("url") {
                return json!({"ok": false, "reason": "url_mismatch", "normalizedAction": null, "rule": rule});
            }
        },
        "run_command" => {
            if actual.get("command") != rule.get("command") {
                return json!({"ok": false, "reason": "command_mismatch", "normalizedAction": null, "rule": rule});
            }
            let prefix: Vec<String> = rule
                .get("argsPrefix")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let args: Vec<String> = actual
                .get("args")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            if args.len() < prefix.len() || args[..prefix.len()] != prefix[..] {
                return json!({"ok": false, "reason": "args_prefix_mismatch", "normalizedAction": null, "rule": rule});
            }
            let extras = &args[prefix.len()..];
            let mut i = 0;
            while i < extras.len() {
                let token = &extras[i];
                if token == "--server" {
                    // Flag consumes a value.
                    i += 2;
                    continue;
                }
                return json!({
                    "ok": false,
                    "reason": format!("extra_arg_not_allowed:{token}"),
                    "normalizedAction": null,
                    "rule": rule,
                });
            }
        },
        _ => {},
    }
    let mut normalized = expected;
    if let Some(params) = actual.get("params").filter(|p| p.is_object())
        && let Some(obj) = normalized.as_object_mut()
    {
        obj.insert("params".into(), params.clone());
    }
    json!({"ok": true, "reason": "ok", "normalizedAction": normalized, "rule": rule})
}

pub fn validate_action_batch(items: &[Value]) -> Value {
    let mut results = Vec::new();
    let mut valid = 0usize;
    let mut invalid = 0usize;
    for (index, row) in items.iter().enumerate() {
        let code = row.get("code").and_then(|v| v.as_str()).unwrap_or("").trim();
        let result = validate_action(code, row.get("action").filter(|a| a.is_object()));
        if result.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            valid += 1;
        } else {
            invalid += 1;
        }
        let mut entry = json!({"index": index, "code": code});
        if let (Some(entry_obj), Some(result_obj)) = (entry.as_object_mut(), result.as_object()) {
            for (k, v) in result_obj {
                entry_obj.insert(k.clone(), v.clone());
            }
        }
        results.push(entry);
    }
    json!({
        "ok": invalid == 0,
        "total": items.len(),
        "valid": valid,
        "invalid": invalid,
        "results": results,
    })
}

/// The full actions catalog, sorted by canonical code.
pub fn actions_catalog(now_ms: u64) -> Value {
    let mut actions: Vec<Value> = PROFILE_CODES
        .iter()
        .filter_map(|code| {
            let profile = code_profile(code)?;
            let action = (profile.action)();
            Some(json!({
                "code": code,
                "canonicalCode": profile.canonical,
                "aliases": profile.aliases,
                "action": action,
                "schema": action_schema(&action),
                "validationRule": validation_rule(&action),
                "executionPolicy": (profile.policy)(),
            }))
        })
        .collect();
    actions.sort_by(|a, b| {
        let ka = a.get("canonicalCode").and_then(|v| v.as_str()).unwrap_or("");
        let kb = b.get("canonicalCode").and_then(|v| v.as_str()).unwrap_or("");
        ka.cmp(kb)
    });
    json!({
        "version": 2,
        "count": actions.len(),
        "supportedActionTypes": ["navigate", "run_command", "open_url", "none"],
        "supportsBatchValidate": true,
        "actions": actions,
        "generatedAtMs": now_ms,
    })
}

// ── Normalization ────────────────────────────────────────────────────────────

pub fn dedupe_key(alert: &Value) -> String {
    let get = |field: &str, default: &str| {
        alert
            .get(field)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
            .to_string()
    };
    format!(
        "{}:{}:{}:{}",
        get("source", "unknown"),
        get("category", "general"),
        get("code", "UNKNOWN"),
        get("provider", "")
    )
}

/// Normalize raw alerts: level/priority, profile enrichment, dedupe
/// keeping the highest-priority copy, stable sort.
pub fn normalize_alerts(raw: Vec<Value>) -> Vec<Value> {
    let mut deduped: HashMap<String, Value> = HashMap::new();
    for alert in raw {
        let Some(mut item) = alert.as_object().cloned() else {
            continue;
        };
        let level = item
            .get("level")
            .or_else(|| item.get("severity"))
            .and_then(|v| v.as_str())
            .unwrap_or("warning")
            .to_lowercase();
        let priority = priority_for(&level);
        item.insert("level".into(), json!(level.clone()));
        item.insert("severity".into(), json!(level));
        let source = item
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let category = item
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        item.insert("group".into(), json!(format!("{source}.{category}")));
        item.insert("source".into(), json!(source));
        item.insert("category".into(), json!(category));
        item.insert("priority".into(), json!(priority));

        let code = item
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let (canonical, aliases, action, policy) = match code_profile(&code) {
            Some(profile) => (
                profile.canonical.to_string(),
                json!(profile.aliases),
                (profile.action)(),
                (profile.policy)(),
            ),
            None => (
                code.clone(),
                json!([]),
                json!({"type": "none", "name": "noop", "params": {}}),
                read_policy(),
            ),
        };
        item.insert("canonicalCode".into(), json!(canonical));
        item.insert("aliases".into(), aliases);
        item.insert("actionSchema".into(), action_schema(&action));
        item.insert("executionPolicy".into(), policy);
        item.insert("action".into(), action);

        let value = Value::Object(item);
        let key = dedupe_key(&value);
        let replace = deduped
            .get(&key)
            .map(|existing| {
                existing
                    .get("priority")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    < priority
            })
            .unwrap_or(true);
        if replace {
            let mut value = value;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("dedupeKey".into(), json!(key.clone()));
            }
            deduped.insert(key, value);
        }
    }
    let mut out: Vec<Value> = deduped.into_values().collect();
    out.sort_by(|a, b| {
        let pa = a.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
        let pb = b.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
        pb.cmp(&pa).then_with(|| {
            let key = |v: &Value| {
                (
                    v.get("source").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                    v.get("category").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                    v.get("code").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                    v.get("provider").and_then(|x| x.as_str()).unwrap_or("").to_string(),
                )
            };
            key(a).cmp(&key(b))
        })
    });
    out
}

pub fn alerts_summary(alerts: &[Value]) -> Value {
    let mut critical = 0u64;
    let mut warning = 0u64;
    let mut by_source: HashMap<String, (u64, u64, u64)> = HashMap::new();
    for alert in alerts {
        let level = alert.get("level").and_then(|v| v.as_str()).unwrap_or("");
        let source = alert
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let row = by_source.entry(source).or_default();
        row.2 += 1;
        match level {
            "critical" => {
                critical += 1;
                row.0 += 1;
            },
            "warning" => {
                warning += 1;
                row.1 += 1;
            },
            _ => {},
        }
    }
    let mut sources: Vec<Value> = by_source
        .into_iter()
        .map(|(source, (c, w, t))| {
            json!({"source": source, "critical": c, "warning": w, "total": t})
        })
        .collect();
    sources.sort_by(|a, b| {
        let ka = a.get("source").and_then(|v| v.as_str()).unwrap_or("");
        let kb = b.get("source").and_then(|v| v.as_str()).unwrap_or("");
        ka.cmp(kb)
    });
    json!({
        "total": alerts.len(),
        "critical": critical,
        "warning": warning,
        "bySource": sources,
    })
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

/// Pure lifecycle transition: applies a normalized snapshot to the prior
/// persisted state. Returns (enriched alerts, new state, lifecycle view).
pub fn apply_lifecycle(alerts: Vec<Value>, prior: &Value, now_ms: u64) -> (Vec<Value>, Value, Value) {
    let mut active: serde_json::Map<String, Value> = prior
        .get("active")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let mut resolved_recent: Vec<Value> = prior
        .get("resolvedRecent")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut current_keys = std::collections::HashSet::new();
    let mut enriched = Vec::with_capacity(alerts.len());

    for alert in alerts {
        let key = alert
            .get("dedupeKey")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| dedupe_key(&alert));
        current_keys.insert(key.clone());
        let prior_rec = active.get(&key);
        let first_seen = prior_rec
            .and_then(|r| r.get("firstSeenMs"))
            .and_then(|v| v.as_u64())
            .unwrap_or(now_ms);
        let was_inactive = prior_rec
            .and_then(|r| r.get("active"))
            .and_then(|v| v.as_bool())
            == Some(false);
        let last_transition = if was_inactive {
            now_ms
        } else {
            prior_rec
                .and_then(|r| r.get("lastTransitionMs"))
                .and_then(|v| v.as_u64())
                .unwrap_or(first_seen)
        };
        let lifecycle_row = json!({
            "dedupeKey": key.clone(),
            "code": alert.get("code"),
            "canonicalCode": alert.get("canonicalCode"),
            "source": alert.get("source"),
            "category": alert.get("category"),
            "level": alert.get("level"),
            "firstSeenMs": first_seen,
            "lastSeenMs": now_ms,
            "lastTransitionMs": last_transition,
            "resolvedAtMs": null,
            "active": true,
        });
        active.insert(key, lifecycle_row);

        let mut item = alert;
        if let Some(obj) = item.as_object_mut() {
            obj.insert("firstSeenMs".into(), json!(first_seen));
            obj.insert("lastSeenMs".into(), json!(now_ms));
            obj.insert("lastTransitionMs".into(), json!(last_transition));
            obj.insert("resolvedAtMs".into(), Value::Null);
            obj.insert("active".into(), json!(true));
        }
        enriched.push(item);
    }

    // Previously-active records no longer present resolve now.
    let resolved_keys: Vec<String> = active
        .keys()
        .filter(|k| !current_keys.contains(*k))
        .cloned()
        .collect();
    for key in resolved_keys {
        if let Some(mut rec) = active.remove(&key) {
            if let Some(obj) = rec.as_object_mut() {
                obj.insert("active".into(), json!(false));
                obj.insert("resolvedAtMs".into(), json!(now_ms));
                obj.insert("lastTransitionMs".into(), json!(now_ms));
            }
            resolved_recent.insert(0, rec);
        }
    }
    resolved_recent.truncate(RESOLVED_RECENT_STORED);

    let state = json!({
        "active": active,
        "resolvedRecent": resolved_recent,
        "lastUpdatedMs": now_ms,
    });
    let view = lifecycle_view(&state);
    (enriched, state, view)
}

/// Read-only view over persisted lifecycle state.
pub fn lifecycle_view(state: &Value) -> Value {
    let active = state
        .get("active")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    let resolved_recent = state
        .get("resolvedRecent")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let mut active_rows: Vec<Value> = active.values().cloned().collect();
    active_rows.sort_by(|a, b| {
        let ka = a.get("dedupeKey").and_then(|v| v.as_str()).unwrap_or("");
        let kb = b.get("dedupeKey").and_then(|v| v.as_str()).unwrap_or("");
        ka.cmp(kb)
    });
    json!({
        "activeCount": active.len(),
        "resolvedRecentCount": resolved_recent.len(),
        "active": active_rows,
        "resolvedRecent": resolved_recent
            .into_iter()
            .take(RESOLVED_RECENT_RETURNED)
            .collect::<Vec<_>>(),
        "lastUpdatedMs": state.get("lastUpdatedMs").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

// ── Storage-backed wrapper ───────────────────────────────────────────────────

fn empty_state() -> Value {
    json!({"active": {}, "resolvedRecent": [], "lastUpdatedMs": 0})
}

/// Slot-persisted alert lifecycle store.
pub struct AlertLifecycle {
    storage: Arc<dyn SlotStore>,
}

impl AlertLifecycle {
    pub fn new(storage: Arc<dyn SlotStore>) -> Self {
        Self { storage }
    }

    /// Apply a normalized snapshot against the persisted state and write
    /// the new state back. Returns (enriched alerts, lifecycle view).
    pub async fn apply(&self, alerts: Vec<Value>, now_ms: u64) -> (Vec<Value>, Value) {
        let prior = self
            .storage
            .load(slots::ALERTS_LIFECYCLE, empty_state())
            .await;
        let (enriched, state, view) = apply_lifecycle(alerts, &prior, now_ms);
        self.storage.save(slots::ALERTS_LIFECYCLE, &state).await;
        (enriched, view)
    }

    pub async fn view(&self) -> Value {
        let state = self
            .storage
            .load(slots::ALERTS_LIFECYCLE, empty_state())
            .await;
        lifecycle_view(&state)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn channels_snapshot(running: &[(&str, bool)]) -> Value {
        let mut channels = serde_json::Map::new();
        for (name, up) in running {
            channels.insert(
                name.to_string(),
                json!({"configured": true, "running": up, "connected": up}),
            );
        }
        json!({"channels": channels})
    }

    #[test]
    fn all_channels_down_is_critical() {
        let alerts = build_operational_alerts(
            &json!({}),
            &channels_snapshot(&[("telegram", false), ("slack", false)]),
            None,
            &json!({}),
            1000,
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["code"], json!("CHANNELS_UNAVAILABLE_ALL"));
        assert_eq!(alerts[0]["level"], json!("critical"));
    }

    #[test]
    fn partial_outage_is_warning() {
        let alerts = build_operational_alerts(
            &json!({}),
            &channels_snapshot(&[("telegram", false), ("slack", true)]),
            None,
            &json!({}),
            1000,
        );
        assert_eq!(alerts[0]["code"], json!("CHANNELS_UNAVAILABLE_PARTIAL"));
        assert_eq!(alerts[0]["level"], json!("warning"));
    }

    #[test]
    fn normalize_dedupes_by_priority() {
        let raw = vec![
            json!({"source": "channels", "category": "availability", "code": "CHANNELS_UNAVAILABLE_ALL", "level": "warning"}),
            json!({"source": "channels", "category": "availability", "code": "CHANNELS_UNAVAILABLE_ALL", "level": "critical"}),
        ];
        let normalized = normalize_alerts(raw);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0]["level"], json!("critical"));
        assert_eq!(normalized[0]["priority"], json!(200));
        assert_eq!(
            normalized[0]["dedupeKey"],
            json!("channels:availability:CHANNELS_UNAVAILABLE_ALL:")
        );
        assert_eq!(
            normalized[0]["canonicalCode"],
            json!("CHANNELS.UNAVAILABLE.ALL")
        );
    }

    #[test]
    fn normalize_sorts_critical_first() {
        let raw = vec![
            json!({"source": "cron", "category": "scheduler", "code": "CRON_SCHEDULER_STALLED", "level": "warning"}),
            json!({"source": "channels", "category": "availability", "code": "CHANNELS_UNAVAILABLE_ALL", "level": "critical"}),
        ];
        let normalized = normalize_alerts(raw);
        assert_eq!(normalized[0]["source"], json!("channels"));
    }

    #[test]
    fn lifecycle_tracks_first_seen_and_resolve() {
        let raw = normalize_alerts(vec![json!({
            "source": "channels", "category": "availability",
            "code": "CHANNELS_UNAVAILABLE_ALL", "level": "critical",
        })]);
        let (enriched, state, _) = apply_lifecycle(raw.clone(), &empty_state(), 1000);
        assert_eq!(enriched[0]["firstSeenMs"], json!(1000));
        assert_eq!(enriched[0]["active"], json!(true));

        // Still firing later: firstSeen kept.
        let (enriched2, state2, _) = apply_lifecycle(raw, &state, 2000);
        assert_eq!(enriched2[0]["firstSeenMs"], json!(1000));
        assert_eq!(enriched2[0]["lastSeenMs"], json!(2000));

        // Recovered: record resolves and moves to resolvedRecent.
        let (none, state3, view) = apply_lifecycle(Vec::new(), &state2, 3000);
        assert!(none.is_empty());
        assert_eq!(state3["active"].as_object().unwrap().len(), 0);
        let resolved = view["resolvedRecent"].as_array().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0]["resolvedAtMs"], json!(3000));
        assert_eq!(resolved[0]["active"], json!(false));
    }

    #[test]
    fn resolved_recent_is_bounded() {
        let mut state = empty_state();
        for i in 0..250 {
            let raw = normalize_alerts(vec![json!({
                "source": "auth", "category": "provider",
                "code": "AUTH_PROVIDER_DOWN", "level": "warning",
                "provider": format!("p{i}"),
            })]);
            let (_, next, _) = apply_lifecycle(raw, &state, i);
            let (_, next, _) = apply_lifecycle(Vec::new(), &next, i + 1);
            state = next;
        }
        assert_eq!(state["resolvedRecent"].as_array().unwrap().len(), 200);
        let view = lifecycle_view(&state);
        assert_eq!(view["resolvedRecent"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn summary_counts_by_source() {
        let alerts = normalize_alerts(vec![
            json!({"source": "channels", "category": "availability", "code": "CHANNELS_UNAVAILABLE_ALL", "level": "critical"}),
            json!({"source": "cron", "category": "scheduler", "code": "CRON_SCHEDULER_STALLED", "level": "warning"}),
        ]);
        let summary = alerts_summary(&alerts);
        assert_eq!(summary["total"], json!(2));
        assert_eq!(summary["critical"], json!(1));
        assert_eq!(summary["warning"], json!(1));
        assert_eq!(summary["bySource"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn validate_navigate_requires_exact_target() {
        let ok = validate_action(
            "AUTH_PROFILES_DOWN",
            Some(&json!({"type": "navigate", "name": "openPage", "target": "settings.auth"})),
        );
        assert_eq!(ok["ok"], json!(true));
        let bad = validate_action(
            "AUTH_PROFILES_DOWN",
            Some(&json!({"type": "navigate", "name": "openPage", "target": "settings.other"})),
        );
        assert_eq!(bad["ok"], json!(false));
        assert_eq!(bad["reason"], json!("target_mismatch"));
    }

    #[test]
    fn validate_run_command_checks_prefix_and_extras() {
        let ok = validate_action(
            "CHANNELS_UNAVAILABLE_ALL",
            Some(&json!({
                "type": "run_command", "name": "diagnoseChannels",
                "command": "tether", "args": ["channels", "status", "--server", "prod"],
            })),
        );
        assert_eq!(ok["ok"], json!(true));
        let bad = validate_action(
            "CHANNELS_UNAVAILABLE_ALL",
            Some(&json!({
                "type": "run_command", "name": "diagnoseChannels",
                "command": "tether", "args": ["channels", "status", "--force"],
            })),
        );
        assert_eq!(bad["ok"], json!(false));
        assert_eq!(bad["reason"], json!("extra_arg_not_allowed:--force"));
    }

    #[test]
    fn validate_unknown_code_fails() {
        let result = validate_action("NOPE", None);
        assert_eq!(result["reason"], json!("unknown_code"));
    }

    #[test]
    fn batch_validation_aggregates() {
        let result = validate_action_batch(&[
            json!({"code": "CRON_SCHEDULER_STALLED", "action": {"type": "open_url", "name": "openCronOverview", "url": "/control/overview"}}),
            json!({"code": "NOPE"}),
        ]);
        assert_eq!(result["ok"], json!(false));
        assert_eq!(result["valid"], json!(1));
        assert_eq!(result["invalid"], json!(1));
    }

    #[test]
    fn catalog_is_sorted_and_complete() {
        let catalog = actions_catalog(1);
        let actions = catalog["actions"].as_array().unwrap();
        assert_eq!(actions.len(), PROFILE_CODES.len());
        let canons: Vec<&str> = actions
            .iter()
            .map(|a| a["canonicalCode"].as_str().unwrap())
            .collect();
        let mut sorted = canons.clone();
        sorted.sort();
        assert_eq!(canons, sorted);
    }
}
