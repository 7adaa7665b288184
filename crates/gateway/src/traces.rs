//! Per-run trace records, written once at run completion.

use std::collections::VecDeque;

use {serde::Serialize, tokio::sync::Mutex};

const TRACES_RETAINED: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTrace {
    /// Equals the runId.
    pub trace_id: String,
    pub session_key: String,
    pub status: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    pub steps_json: String,
    pub tools_used: Vec<String>,
    pub message_preview: String,
}

/// Bounded, most-recent-first trace log with cursor pagination.
pub struct TraceLog {
    inner: Mutex<VecDeque<AgentTrace>>,
    /// Step payload / preview char cap.
    step_chars: usize,
}

impl TraceLog {
    pub fn new(step_chars: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            step_chars,
        }
    }

    pub fn truncate_payload(&self, text: &str) -> String {
        if text.chars().count() <= self.step_chars {
            return text.to_string();
        }
        text.chars().take(self.step_chars).collect()
    }

    pub async fn record(&self, mut trace: AgentTrace) {
        trace.message_preview = self.truncate_payload(&trace.message_preview);
        trace.steps_json = self.truncate_payload(&trace.steps_json);
        let mut inner = self.inner.lock().await;
        inner.push_front(trace);
        inner.truncate(TRACES_RETAINED);
    }

    /// Most-recent-first page. The cursor is the traceId to resume after.
    pub async fn list(
        &self,
        session_key: Option<&str>,
        limit: usize,
        cursor: Option<&str>,
    ) -> (Vec<serde_json::Value>, Option<String>) {
        let inner = self.inner.lock().await;
        let filtered: Vec<&AgentTrace> = inner
            .iter()
            .filter(|t| session_key.is_none_or(|k| t.session_key == k))
            .collect();
        let start = match cursor {
            Some(cursor) => filtered
                .iter()
                .position(|t| t.trace_id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let limit = limit.clamp(1, 200);
        let page: Vec<&AgentTrace> = filtered.into_iter().skip(start).take(limit + 1).collect();
        let has_more = page.len() > limit;
        let items: Vec<serde_json::Value> = page
            .iter()
            .take(limit)
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect();
        let next_cursor = if has_more {
            items
                .last()
                .and_then(|t| t.get("traceId"))
                .and_then(|v| v.as_str())
                .map(String::from)
        } else {
            None
        };
        (items, next_cursor)
    }

    pub async fn get(&self, trace_id: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .find(|t| t.trace_id == trace_id)
            .and_then(|t| serde_json::to_value(t).ok())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn trace(id: &str, session: &str, started: u64) -> AgentTrace {
        AgentTrace {
            trace_id: id.into(),
            session_key: session.into(),
            status: "ok".into(),
            started_at_ms: started,
            ended_at_ms: started + 10,
            error_text: None,
            steps_json: "[]".into(),
            tools_used: Vec::new(),
            message_preview: "hello".into(),
        }
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let log = TraceLog::new(2000);
        log.record(trace("t1", "main", 1)).await;
        log.record(trace("t2", "main", 2)).await;
        let (items, next) = log.list(None, 50, None).await;
        assert_eq!(items[0]["traceId"], serde_json::json!("t2"));
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn cursor_pagination_resumes() {
        let log = TraceLog::new(2000);
        for i in 0..5 {
            log.record(trace(&format!("t{i}"), "main", i)).await;
        }
        let (page1, next) = log.list(None, 2, None).await;
        assert_eq!(page1.len(), 2);
        let cursor = next.unwrap();
        assert_eq!(cursor, "t3");
        let (page2, _) = log.list(None, 2, Some(&cursor)).await;
        assert_eq!(page2[0]["traceId"], serde_json::json!("t2"));
    }

    #[tokio::test]
    async fn session_filter_applies() {
        let log = TraceLog::new(2000);
        log.record(trace("t1", "a", 1)).await;
        log.record(trace("t2", "b", 2)).await;
        let (items, _) = log.list(Some("a"), 50, None).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["sessionKey"], serde_json::json!("a"));
    }

    #[tokio::test]
    async fn preview_is_truncated() {
        let log = TraceLog::new(5);
        let mut t = trace("t1", "main", 1);
        t.message_preview = "a".repeat(50);
        log.record(t).await;
        let got = log.get("t1").await.unwrap();
        assert_eq!(got["messagePreview"].as_str().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn start_not_after_end() {
        let log = TraceLog::new(2000);
        log.record(trace("t1", "main", 100)).await;
        let got = log.get("t1").await.unwrap();
        assert!(got["startedAtMs"].as_u64().unwrap() <= got["endedAtMs"].as_u64().unwrap());
    }
}
