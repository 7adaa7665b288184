//! Gateway run log: bounded in-memory ring of structured entries with
//! cursor-based tailing, mirrored best-effort to a JSONL file.

use std::{collections::VecDeque, path::PathBuf};

use tokio::sync::Mutex;

const ENTRIES_RETAINED: usize = 2000;

struct LogInner {
    entries: VecDeque<(u64, serde_json::Value)>,
    next_cursor: u64,
}

pub struct RunLog {
    inner: Mutex<LogInner>,
    file_path: PathBuf,
}

impl RunLog {
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                next_cursor: 1,
            }),
            file_path,
        }
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub async fn append(&self, event: &str, detail: serde_json::Value, now_ms: u64) {
        let entry = serde_json::json!({
            "ts": now_ms,
            "event": event,
            "detail": detail,
        });
        {
            let mut inner = self.inner.lock().await;
            let cursor = inner.next_cursor;
            inner.next_cursor += 1;
            inner.entries.push_back((cursor, entry.clone()));
            while inner.entries.len() > ENTRIES_RETAINED {
                inner.entries.pop_front();
            }
        }
        // File mirror is best-effort.
        if let Some(parent) = self.file_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let line = format!("{entry}\n");
        let path = self.file_path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            use std::io::Write as _;
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                let _ = file.write_all(line.as_bytes());
            }
        })
        .await;
    }

    /// Entries after `cursor`, up to `limit`. Returns the cursor to resume
    /// from on the next call.
    pub async fn tail(&self, cursor: Option<u64>, limit: usize) -> (Vec<serde_json::Value>, u64) {
        let inner = self.inner.lock().await;
        let after = cursor.unwrap_or(0);
        let limit = limit.clamp(1, 1000);
        let entries: Vec<serde_json::Value> = inner
            .entries
            .iter()
            .filter(|(c, _)| *c > after)
            .take(limit)
            .map(|(c, e)| {
                let mut row = e.clone();
                if let Some(obj) = row.as_object_mut() {
                    obj.insert("cursor".into(), serde_json::json!(c));
                }
                row
            })
            .collect();
        let next = entries
            .last()
            .and_then(|e| e.get("cursor"))
            .and_then(|v| v.as_u64())
            .unwrap_or(after);
        (entries, next)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_resumes_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("gateway.jsonl"));
        for i in 0..5u64 {
            log.append("exec.finished", serde_json::json!({"i": i}), i).await;
        }
        let (first, cursor) = log.tail(None, 3).await;
        assert_eq!(first.len(), 3);
        let (rest, _) = log.tail(Some(cursor), 10).await;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0]["detail"]["i"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn file_mirror_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.jsonl");
        let log = RunLog::new(path.clone());
        log.append("chat", serde_json::json!({"runId": "r1"}), 1).await;
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"runId\":\"r1\""));
    }
}
