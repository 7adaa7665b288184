//! Lane queue + agent job registry.
//!
//! A lane is the per-session FIFO of pending chat/agent requests plus at
//! most one running job. The job map, the `session → running run` index,
//! the pending lists and the completion waiters all live behind one mutex
//! so the at-most-one-running invariant cannot be violated between reads
//! and writes.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{Mutex, oneshot};

/// Completed jobs kept around for late `agent.wait` callers.
const FINISHED_JOBS_RETAINED: usize = 256;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Ok,
    Error,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentJob {
    pub run_id: String,
    pub session_key: String,
    pub status: JobStatus,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct LanePendingItem {
    pub run_id: String,
    pub session_key: String,
    pub enqueued_at_ms: u64,
    pub params: serde_json::Value,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// No running job: caller must start the run now.
    Started,
    /// A job with this run id is already running (or queued).
    InFlight { run_id: String },
    /// Session busy; item appended to the lane FIFO.
    Queued { position: usize, depth: usize },
    /// Lane FIFO at capacity.
    QueueFull,
}

#[derive(Default)]
struct LanesInner {
    jobs: HashMap<String, AgentJob>,
    /// Completed run ids in completion order, for bounded retention.
    finished_order: VecDeque<String>,
    /// session_key → running run_id. Single writer: `admit`/`complete`.
    running: HashMap<String, String>,
    pending: HashMap<String, VecDeque<LanePendingItem>>,
    waiters: HashMap<String, Vec<oneshot::Sender<AgentJob>>>,
}

/// The registry. One per gateway.
pub struct LaneRegistry {
    inner: Mutex<LanesInner>,
    max_pending_per_lane: usize,
}

impl LaneRegistry {
    pub fn new(max_pending_per_lane: usize) -> Self {
        Self {
            inner: Mutex::new(LanesInner::default()),
            max_pending_per_lane,
        }
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Admit a run for `session_key`. Registers the job and binds the
    /// running index when the lane is idle; queues otherwise.
    pub async fn admit(
        &self,
        run_id: &str,
        session_key: &str,
        params: serde_json::Value,
        now_ms: u64,
    ) -> Admission {
        let mut inner = self.inner.lock().await;

        if let Some(running_id) = inner.running.get(session_key) {
            // Same idempotency key while the original is outstanding.
            if running_id == run_id {
                return Admission::InFlight {
                    run_id: running_id.clone(),
                };
            }
            let queue = inner.pending.entry(session_key.to_string()).or_default();
            if queue.iter().any(|item| item.run_id == run_id) {
                return Admission::InFlight {
                    run_id: run_id.to_string(),
                };
            }
            if queue.len() >= self.max_pending_per_lane {
                return Admission::QueueFull;
            }
            queue.push_back(LanePendingItem {
                run_id: run_id.to_string(),
                session_key: session_key.to_string(),
                enqueued_at_ms: now_ms,
                params,
            });
            let depth = queue.len();
            return Admission::Queued {
                position: depth,
                depth,
            };
        }

        inner.jobs.insert(run_id.to_string(), AgentJob {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            status: JobStatus::Running,
            started_at_ms: now_ms,
            ended_at_ms: None,
            error: None,
            result: None,
        });
        inner
            .running
            .insert(session_key.to_string(), run_id.to_string());
        Admission::Started
    }

    /// Register a dequeued item as the running job. Used by the dequeue
    /// loop after a completion; the lane is known idle at that point.
    pub async fn start_dequeued(&self, item: &LanePendingItem, now_ms: u64) {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(item.run_id.clone(), AgentJob {
            run_id: item.run_id.clone(),
            session_key: item.session_key.clone(),
            status: JobStatus::Running,
            started_at_ms: now_ms,
            ended_at_ms: None,
            error: None,
            result: None,
        });
        inner
            .running
            .insert(item.session_key.clone(), item.run_id.clone());
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Record completion, resolve waiters, unbind the running index and
    /// pop the next pending item for the session (FIFO), if any.
    pub async fn complete(
        &self,
        run_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now_ms: u64,
    ) -> Option<LanePendingItem> {
        let mut inner = self.inner.lock().await;
        let session_key = {
            let Some(job) = inner.jobs.get_mut(run_id) else {
                return None;
            };
            job.status = status;
            job.ended_at_ms = Some(now_ms);
            job.error = error;
            job.result = result;
            job.session_key.clone()
        };
        if inner.running.get(&session_key).map(String::as_str) == Some(run_id) {
            inner.running.remove(&session_key);
        }

        let snapshot = inner.jobs.get(run_id).cloned();
        if let (Some(waiters), Some(snapshot)) = (inner.waiters.remove(run_id), snapshot) {
            for waiter in waiters {
                let _ = waiter.send(snapshot.clone());
            }
        }

        inner.finished_order.push_back(run_id.to_string());
        while inner.finished_order.len() > FINISHED_JOBS_RETAINED {
            if let Some(old) = inner.finished_order.pop_front() {
                inner.jobs.remove(&old);
            }
        }

        let next = inner
            .pending
            .get_mut(&session_key)
            .and_then(VecDeque::pop_front);
        if inner
            .pending
            .get(&session_key)
            .map(VecDeque::is_empty)
            .unwrap_or(false)
        {
            inner.pending.remove(&session_key);
        }
        next
    }

    // ── Waiting ──────────────────────────────────────────────────────────

    /// Wait for a run to finish, bounded by `timeout_ms`. A job that
    /// already finished resolves immediately; an unknown run id returns
    /// None after the timeout window.
    pub async fn wait(&self, run_id: &str, timeout_ms: u64) -> Option<AgentJob> {
        let rx = {
            let mut inner = self.inner.lock().await;
            match inner.jobs.get(run_id) {
                Some(job) if job.status != JobStatus::Running => return Some(job.clone()),
                _ => {},
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(run_id.to_string()).or_default().push(tx);
            rx
        };
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms.max(1)), rx).await {
            Ok(Ok(job)) => Some(job),
            _ => None,
        }
    }

    // ── Observability ────────────────────────────────────────────────────

    pub async fn job(&self, run_id: &str) -> Option<AgentJob> {
        self.inner.lock().await.jobs.get(run_id).cloned()
    }

    pub async fn running_run_id(&self, session_key: &str) -> Option<String> {
        self.inner.lock().await.running.get(session_key).cloned()
    }

    /// Single-lane status payload for `lanes.status`.
    pub async fn lane_status(&self, session_key: &str, now_ms: u64) -> serde_json::Value {
        let inner = self.inner.lock().await;
        Self::lane_row(&inner, session_key, now_ms)
    }

    fn lane_row(inner: &LanesInner, session_key: &str, now_ms: u64) -> serde_json::Value {
        let running = inner.running.get(session_key);
        let queue = inner.pending.get(session_key);
        let depth = queue.map(VecDeque::len).unwrap_or(0);
        let oldest = queue.and_then(|q| q.front()).map(|i| i.enqueued_at_ms);
        let head_wait = oldest.map(|t| now_ms.saturating_sub(t));
        serde_json::json!({
            "sessionKey": session_key,
            "runningRunId": running,
            "queued": depth,
            "queueDepth": depth,
            "headWaitMs": head_wait,
            "oldestEnqueuedAt": oldest,
        })
    }

    /// All lanes with running + pending info, plus a global summary.
    pub async fn lane_list(&self, now_ms: u64) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let mut keys: Vec<&String> = inner
            .running
            .keys()
            .chain(inner.pending.keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        let lanes: Vec<_> = keys
            .into_iter()
            .map(|k| Self::lane_row(&inner, k, now_ms))
            .collect();
        let total_queued: usize = inner.pending.values().map(VecDeque::len).sum();
        serde_json::json!({
            "summary": {
                "runningSessions": inner.running.len(),
                "queuedSessions": inner.pending.len(),
                "totalQueued": total_queued,
            },
            "lanes": lanes,
        })
    }

    /// Total pending items across all lanes.
    pub async fn total_queued(&self) -> usize {
        self.inner
            .lock()
            .await
            .pending
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Count of running jobs for a session. Always 0 or 1.
    pub async fn running_count(&self, session_key: &str) -> usize {
        usize::from(self.inner.lock().await.running.contains_key(session_key))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn params(msg: &str) -> serde_json::Value {
        serde_json::json!({"message": msg, "sessionKey": "main"})
    }

    #[tokio::test]
    async fn second_submission_queues_fifo() {
        let lanes = LaneRegistry::new(100);
        assert_eq!(
            lanes.admit("r1", "main", params("a"), 1).await,
            Admission::Started
        );
        assert_eq!(
            lanes.admit("r2", "main", params("b"), 2).await,
            Admission::Queued {
                position: 1,
                depth: 1
            }
        );
        assert_eq!(
            lanes.admit("r3", "main", params("c"), 3).await,
            Admission::Queued {
                position: 2,
                depth: 2
            }
        );
        let next = lanes
            .complete("r1", JobStatus::Ok, None, None, 4)
            .await
            .unwrap();
        assert_eq!(next.run_id, "r2");
        lanes.start_dequeued(&next, 4).await;
        let next = lanes
            .complete("r2", JobStatus::Ok, None, None, 5)
            .await
            .unwrap();
        assert_eq!(next.run_id, "r3");
    }

    #[tokio::test]
    async fn duplicate_run_id_is_in_flight() {
        let lanes = LaneRegistry::new(100);
        lanes.admit("r1", "main", params("a"), 1).await;
        assert_eq!(
            lanes.admit("r1", "main", params("a"), 2).await,
            Admission::InFlight {
                run_id: "r1".into()
            }
        );
        // After completion with an empty queue the key is reusable.
        lanes.complete("r1", JobStatus::Ok, None, None, 3).await;
        assert_eq!(
            lanes.admit("r1", "main", params("a"), 4).await,
            Admission::Started
        );
    }

    #[tokio::test]
    async fn queue_full_over_cap() {
        let lanes = LaneRegistry::new(2);
        lanes.admit("r0", "main", params("x"), 1).await;
        lanes.admit("q1", "main", params("x"), 1).await;
        lanes.admit("q2", "main", params("x"), 1).await;
        assert_eq!(
            lanes.admit("q3", "main", params("x"), 1).await,
            Admission::QueueFull
        );
    }

    #[tokio::test]
    async fn cross_session_runs_are_independent() {
        let lanes = LaneRegistry::new(100);
        assert_eq!(
            lanes.admit("r1", "a", params("x"), 1).await,
            Admission::Started
        );
        assert_eq!(
            lanes.admit("r2", "b", params("y"), 1).await,
            Admission::Started
        );
        assert_eq!(lanes.running_count("a").await, 1);
        assert_eq!(lanes.running_count("b").await, 1);
    }

    #[tokio::test]
    async fn wait_resolves_on_completion() {
        let lanes = std::sync::Arc::new(LaneRegistry::new(100));
        lanes.admit("r1", "main", params("a"), 1).await;
        let waiter = {
            let lanes = std::sync::Arc::clone(&lanes);
            tokio::spawn(async move { lanes.wait("r1", 5_000).await })
        };
        tokio::task::yield_now().await;
        lanes
            .complete(
                "r1",
                JobStatus::Ok,
                Some(serde_json::json!({"state": "final"})),
                None,
                9,
            )
            .await;
        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Ok);
        assert_eq!(job.ended_at_ms, Some(9));
    }

    #[tokio::test]
    async fn wait_after_completion_gets_snapshot() {
        let lanes = LaneRegistry::new(100);
        lanes.admit("r1", "main", params("a"), 1).await;
        lanes.complete("r1", JobStatus::Error, None, Some("boom".into()), 2).await;
        let job = lanes.wait("r1", 10).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn wait_times_out_for_unknown_run() {
        let lanes = LaneRegistry::new(100);
        assert!(lanes.wait("nope", 20).await.is_none());
    }

    #[tokio::test]
    async fn lane_status_reports_depth_and_head_wait() {
        let lanes = LaneRegistry::new(100);
        lanes.admit("r1", "main", params("a"), 100).await;
        lanes.admit("r2", "main", params("b"), 200).await;
        let status = lanes.lane_status("main", 250).await;
        assert_eq!(status["runningRunId"], serde_json::json!("r1"));
        assert_eq!(status["queueDepth"], serde_json::json!(1));
        assert_eq!(status["headWaitMs"], serde_json::json!(50));
        let list = lanes.lane_list(250).await;
        assert_eq!(list["summary"]["totalQueued"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn queued_count_matches_pending_records() {
        let lanes = LaneRegistry::new(100);
        lanes.admit("r1", "a", params("x"), 1).await;
        lanes.admit("r2", "a", params("x"), 1).await;
        lanes.admit("r3", "b", params("x"), 1).await;
        lanes.admit("r4", "b", params("x"), 1).await;
        assert_eq!(lanes.total_queued().await, 2);
    }
}
