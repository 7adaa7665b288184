//! Cron job store: at / every / cron-expression schedules, bounded run
//! history persisted through the `rpc.cron_runs` slot.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use {
    chrono::{TimeZone, Utc},
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
};

use tether_storage::{SlotStore, slots};

const RUNS_RETAINED: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cron job not found: {0}")]
    JobNotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Types ────────────────────────────────────────────────────────────────────

/// How a job is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// One-shot: fire once at `at_ms` (epoch millis).
    At { at_ms: u64 },
    /// Fixed interval, optionally anchored.
    Every {
        every_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<u64>,
    },
    /// Standard 5/6-field cron expression, UTC.
    Cron { expr: String },
}

impl CronSchedule {
    /// Next fire time strictly after `now_ms`, or None when exhausted.
    pub fn next_after(&self, now_ms: u64) -> Option<u64> {
        match self {
            Self::At { at_ms } => (*at_ms > now_ms).then_some(*at_ms),
            Self::Every { every_ms, anchor_ms } => {
                let every = (*every_ms).max(1);
                let anchor = anchor_ms.unwrap_or(0);
                if now_ms < anchor {
                    return Some(anchor);
                }
                let elapsed = now_ms - anchor;
                Some(anchor + (elapsed / every + 1) * every)
            },
            Self::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr).ok()?;
                let now = Utc.timestamp_millis_opt(now_ms as i64).single()?;
                schedule
                    .after(&now)
                    .next()
                    .map(|dt| dt.timestamp_millis() as u64)
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Self::Cron { expr } = self {
            cron::Schedule::from_str(expr)
                .map_err(|e| Error::InvalidSchedule(format!("{expr}: {e}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    /// Message injected into the target session when the job fires.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub enabled: bool,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronRunRecord {
    pub job_id: String,
    pub started_at_ms: u64,
    pub status: String, // ok | error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Registry ─────────────────────────────────────────────────────────────────

pub struct CronRegistry {
    jobs: RwLock<HashMap<String, CronJob>>,
    storage: Arc<dyn SlotStore>,
    enabled: bool,
}

impl CronRegistry {
    pub fn new(storage: Arc<dyn SlotStore>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            storage,
            enabled: true,
        }
    }

    pub async fn list(&self) -> Vec<CronJob> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<_> = jobs.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn add(&self, job: CronJob) -> Result<CronJob> {
        job.schedule.validate()?;
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Patch name/schedule/message/sessionKey/enabled from params.
    pub async fn update(&self, id: &str, params: &serde_json::Value) -> Result<CronJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| Error::JobNotFound(id.into()))?;
        if let Some(name) = params.get("name").and_then(|v| v.as_str()) {
            job.name = name.to_string();
        }
        if let Some(schedule) = params.get("schedule") {
            let parsed: CronSchedule = serde_json::from_value(schedule.clone())
                .map_err(|e| Error::InvalidSchedule(e.to_string()))?;
            parsed.validate()?;
            job.schedule = parsed;
        }
        if let Some(message) = params.get("message").and_then(|v| v.as_str()) {
            job.message = message.to_string();
        }
        if let Some(session_key) = params.get("sessionKey").and_then(|v| v.as_str()) {
            job.session_key = Some(session_key.to_string());
        }
        if let Some(enabled) = params.get("enabled").and_then(|v| v.as_bool()) {
            job.enabled = enabled;
        }
        Ok(job.clone())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::JobNotFound(id.into()))
    }

    /// Mark a run and append it to the persisted tail (cap 200).
    pub async fn record_run(&self, job_id: &str, status: &str, error: Option<String>, now_ms: u64) {
        if let Some(job) = self.jobs.write().await.get_mut(job_id) {
            job.last_run_at_ms = Some(now_ms);
        }
        let record = CronRunRecord {
            job_id: job_id.to_string(),
            started_at_ms: now_ms,
            status: status.to_string(),
            error,
        };
        let mut runs: Vec<serde_json::Value> = self
            .storage
            .load(slots::CRON_RUNS, serde_json::json!([]))
            .await
            .as_array()
            .cloned()
            .unwrap_or_default();
        if let Ok(value) = serde_json::to_value(&record) {
            runs.insert(0, value);
        }
        runs.truncate(RUNS_RETAINED);
        self.storage
            .save(slots::CRON_RUNS, &serde_json::Value::Array(runs))
            .await;
    }

    pub async fn runs(&self, limit: usize) -> Vec<serde_json::Value> {
        let runs = self
            .storage
            .load(slots::CRON_RUNS, serde_json::json!([]))
            .await;
        runs.as_array()
            .map(|a| a.iter().take(limit.clamp(1, RUNS_RETAINED)).cloned().collect())
            .unwrap_or_default()
    }

    /// Status payload: job count plus the earliest upcoming wake.
    pub async fn status(&self, now_ms: u64) -> serde_json::Value {
        let jobs = self.jobs.read().await;
        let next_wake = jobs
            .values()
            .filter(|j| j.enabled)
            .filter_map(|j| j.schedule.next_after(now_ms))
            .min();
        serde_json::json!({
            "enabled": self.enabled,
            "jobs": jobs.len(),
            "nextWakeAtMs": next_wake,
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tether_storage::MemorySlotStore;

    fn job(id: &str, schedule: CronSchedule) -> CronJob {
        CronJob {
            id: id.into(),
            name: id.into(),
            schedule,
            message: "ping".into(),
            session_key: None,
            enabled: true,
            created_at_ms: 0,
            last_run_at_ms: None,
        }
    }

    fn registry() -> CronRegistry {
        CronRegistry::new(Arc::new(MemorySlotStore::new()))
    }

    #[test]
    fn every_schedule_aligns_to_anchor() {
        let schedule = CronSchedule::Every {
            every_ms: 100,
            anchor_ms: Some(50),
        };
        assert_eq!(schedule.next_after(0), Some(50));
        assert_eq!(schedule.next_after(50), Some(150));
        assert_eq!(schedule.next_after(151), Some(250));
    }

    #[test]
    fn at_schedule_exhausts() {
        let schedule = CronSchedule::At { at_ms: 1000 };
        assert_eq!(schedule.next_after(500), Some(1000));
        assert_eq!(schedule.next_after(1000), None);
    }

    #[test]
    fn cron_expr_validates() {
        assert!(CronSchedule::Cron { expr: "0 0 * * * *".into() }.validate().is_ok());
        assert!(CronSchedule::Cron { expr: "not-cron".into() }.validate().is_err());
    }

    #[tokio::test]
    async fn add_update_remove_round_trip() {
        let reg = registry();
        reg.add(job("j1", CronSchedule::At { at_ms: 10 })).await.unwrap();
        let updated = reg
            .update("j1", &serde_json::json!({"enabled": false, "name": "renamed"}))
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.name, "renamed");
        reg.remove("j1").await.unwrap();
        assert!(matches!(reg.remove("j1").await, Err(Error::JobNotFound(_))));
    }

    #[tokio::test]
    async fn runs_tail_is_bounded() {
        let reg = registry();
        reg.add(job("j1", CronSchedule::At { at_ms: 10 })).await.unwrap();
        for i in 0..250u64 {
            reg.record_run("j1", "ok", None, i).await;
        }
        let runs = reg.runs(500).await;
        assert_eq!(runs.len(), 200);
        // Newest first.
        assert_eq!(runs[0]["startedAtMs"], serde_json::json!(249));
    }

    #[tokio::test]
    async fn status_reports_next_wake() {
        let reg = registry();
        reg.add(job("j1", CronSchedule::At { at_ms: 500 })).await.unwrap();
        reg.add(job("j2", CronSchedule::At { at_ms: 300 })).await.unwrap();
        let status = reg.status(100).await;
        assert_eq!(status["jobs"], serde_json::json!(2));
        assert_eq!(status["nextWakeAtMs"], serde_json::json!(300));
    }
}
