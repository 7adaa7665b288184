//! Agent runtime contract and the agent catalog.
//!
//! The gateway never calls a language model itself; it drives an
//! [`AgentService`] through `process_direct` and observes the reply. The
//! catalog tracks configured agents and their workspace files for the
//! `agents.*` method family.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already exists: {0}")]
    AgentExists(String),

    #[error("agent run failed: {0}")]
    RunFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Run contract ─────────────────────────────────────────────────────────────

/// One inbound message for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub message: String,
    pub session_key: String,
    pub agent_id: Option<String>,
}

/// Final outcome of one agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub response: String,
    pub aborted: bool,
}

/// Per-run context handed to the service: abort polling plus a sink for
/// intermediate text deltas.
pub struct RunContext {
    pub run_id: String,
    abort_check: Box<dyn Fn() -> bool + Send + Sync>,
    delta_sink: Option<Box<dyn Fn(String) + Send + Sync>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, abort_check: Box<dyn Fn() -> bool + Send + Sync>) -> Self {
        Self {
            run_id: run_id.into(),
            abort_check,
            delta_sink: None,
        }
    }

    pub fn with_delta_sink(mut self, sink: Box<dyn Fn(String) + Send + Sync>) -> Self {
        self.delta_sink = Some(sink);
        self
    }

    /// True once an abort has been requested for this run.
    pub fn abort_requested(&self) -> bool {
        (self.abort_check)()
    }

    /// Emit an intermediate text delta, if anyone is listening.
    pub fn emit_delta(&self, text: impl Into<String>) {
        if let Some(sink) = &self.delta_sink {
            sink(text.into());
        }
    }
}

/// The agent loop, seen from the gateway.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Run one message through the agent and return the final reply. The
    /// implementation is responsible for observing `ctx.abort_requested()`
    /// and returning with `aborted = true`.
    async fn process_direct(&self, req: AgentRequest, ctx: RunContext) -> Result<AgentReply>;
}

/// Default service: fails every run. Lets the gateway come up before the
/// agent loop is wired in.
pub struct NoopAgentService;

#[async_trait]
impl AgentService for NoopAgentService {
    async fn process_direct(&self, _req: AgentRequest, _ctx: RunContext) -> Result<AgentReply> {
        Err(Error::RunFailed("agent service not configured".into()))
    }
}

/// Test double: echoes the message back, honoring aborts.
pub struct EchoAgent;

#[async_trait]
impl AgentService for EchoAgent {
    async fn process_direct(&self, req: AgentRequest, ctx: RunContext) -> Result<AgentReply> {
        if ctx.abort_requested() {
            return Ok(AgentReply {
                response: String::new(),
                aborted: true,
            });
        }
        ctx.emit_delta(req.message.clone());
        Ok(AgentReply {
            response: format!("echo: {}", req.message),
            aborted: false,
        })
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// A configured agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDef {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// A workspace file attached to an agent (SOUL.md, USER.md, notes, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFile {
    pub path: String,
    pub content: String,
    pub updated_at_ms: u64,
}

/// In-process catalog of agents and their workspace files.
#[derive(Default)]
pub struct AgentCatalog {
    inner: RwLock<CatalogInner>,
}

#[derive(Default)]
struct CatalogInner {
    agents: HashMap<String, AgentDef>,
    /// agent id → path → file
    files: HashMap<String, HashMap<String, AgentFile>>,
}

impl AgentCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Catalog seeded with one default agent.
    pub fn with_default_agent() -> Arc<Self> {
        let mut inner = CatalogInner::default();
        inner.agents.insert("main".into(), AgentDef {
            id: "main".into(),
            name: "main".into(),
            model: None,
            provider: None,
            is_default: true,
        });
        Arc::new(Self {
            inner: RwLock::new(inner),
        })
    }

    pub async fn list(&self) -> Vec<AgentDef> {
        let inner = self.inner.read().await;
        let mut agents: Vec<_> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub async fn get(&self, id: &str) -> Option<AgentDef> {
        self.inner.read().await.agents.get(id).cloned()
    }

    /// The default agent, or any agent when none is marked default.
    pub async fn default_agent(&self) -> Option<AgentDef> {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .find(|a| a.is_default)
            .or_else(|| inner.agents.values().next())
            .cloned()
    }

    pub async fn create(&self, def: AgentDef) -> Result<AgentDef> {
        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(&def.id) {
            return Err(Error::AgentExists(def.id));
        }
        inner.agents.insert(def.id.clone(), def.clone());
        Ok(def)
    }

    pub async fn update(&self, def: AgentDef) -> Result<AgentDef> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(&def.id) {
            return Err(Error::AgentNotFound(def.id));
        }
        inner.agents.insert(def.id.clone(), def.clone());
        Ok(def)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .agents
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound(id.into()))?;
        inner.files.remove(id);
        Ok(())
    }

    pub async fn list_files(&self, agent_id: &str) -> Result<Vec<AgentFile>> {
        let inner = self.inner.read().await;
        if !inner.agents.contains_key(agent_id) {
            return Err(Error::AgentNotFound(agent_id.into()));
        }
        let mut files: Vec<_> = inner
            .files
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    pub async fn get_file(&self, agent_id: &str, path: &str) -> Result<Option<AgentFile>> {
        let inner = self.inner.read().await;
        if !inner.agents.contains_key(agent_id) {
            return Err(Error::AgentNotFound(agent_id.into()));
        }
        Ok(inner.files.get(agent_id).and_then(|m| m.get(path)).cloned())
    }

    pub async fn set_file(
        &self,
        agent_id: &str,
        path: &str,
        content: String,
        now_ms: u64,
    ) -> Result<AgentFile> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(agent_id) {
            return Err(Error::AgentNotFound(agent_id.into()));
        }
        let file = AgentFile {
            path: path.to_string(),
            content,
            updated_at_ms: now_ms,
        };
        inner
            .files
            .entry(agent_id.to_string())
            .or_default()
            .insert(path.to_string(), file.clone());
        Ok(file)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> AgentDef {
        AgentDef {
            id: id.into(),
            name: id.into(),
            model: None,
            provider: None,
            is_default: false,
        }
    }

    #[tokio::test]
    async fn create_then_list() {
        let catalog = AgentCatalog::new();
        catalog.create(def("a")).await.unwrap();
        catalog.create(def("b")).await.unwrap();
        let ids: Vec<_> = catalog.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let catalog = AgentCatalog::new();
        catalog.create(def("a")).await.unwrap();
        assert!(matches!(
            catalog.create(def("a")).await,
            Err(Error::AgentExists(_))
        ));
    }

    #[tokio::test]
    async fn file_set_then_get_round_trips() {
        let catalog = AgentCatalog::new();
        catalog.create(def("a")).await.unwrap();
        catalog
            .set_file("a", "SOUL.md", "be kind".into(), 1000)
            .await
            .unwrap();
        let file = catalog.get_file("a", "SOUL.md").await.unwrap().unwrap();
        assert_eq!(file.content, "be kind");
        assert!(catalog.get_file("a", "USER.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_drops_files() {
        let catalog = AgentCatalog::new();
        catalog.create(def("a")).await.unwrap();
        catalog.set_file("a", "x", "1".into(), 1).await.unwrap();
        catalog.delete("a").await.unwrap();
        assert!(matches!(
            catalog.list_files("a").await,
            Err(Error::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn echo_agent_honors_abort() {
        let agent = EchoAgent;
        let ctx = RunContext::new("r1", Box::new(|| true));
        let reply = agent
            .process_direct(
                AgentRequest {
                    message: "hi".into(),
                    session_key: "main".into(),
                    agent_id: None,
                },
                ctx,
            )
            .await
            .unwrap();
        assert!(reply.aborted);
    }
}
