//! `agents.*` catalog methods and agent identity.

use serde_json::json;

use {tether_agents::AgentDef, tether_protocol::ErrorShape};

use crate::state::now_ms;

use super::{MethodRegistry, bool_param, require_str, str_param};

fn map_err(e: tether_agents::Error) -> ErrorShape {
    match e {
        tether_agents::Error::AgentNotFound(_) => ErrorShape::not_found(e.to_string()),
        _ => ErrorShape::invalid(e.to_string()),
    }
}

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "agents.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let agents = ctx.state.catalog.list().await;
                let count = agents.len();
                Ok(json!({"agents": agents, "count": count}))
            })
        }),
    );

    reg.register(
        "agents.create",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                let def = AgentDef {
                    id: id.clone(),
                    name: str_param(&ctx.params, "name").unwrap_or_else(|| id.clone()),
                    model: str_param(&ctx.params, "model"),
                    provider: str_param(&ctx.params, "provider"),
                    is_default: bool_param(&ctx.params, "isDefault", false),
                };
                let created = ctx.state.catalog.create(def).await.map_err(map_err)?;
                Ok(json!({"ok": true, "agent": created}))
            })
        }),
    );

    reg.register(
        "agents.update",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                let existing = ctx
                    .state
                    .catalog
                    .get(&id)
                    .await
                    .ok_or_else(|| ErrorShape::not_found(format!("agent not found: {id}")))?;
                let def = AgentDef {
                    id: id.clone(),
                    name: str_param(&ctx.params, "name").unwrap_or(existing.name),
                    model: str_param(&ctx.params, "model").or(existing.model),
                    provider: str_param(&ctx.params, "provider").or(existing.provider),
                    is_default: bool_param(&ctx.params, "isDefault", existing.is_default),
                };
                let updated = ctx.state.catalog.update(def).await.map_err(map_err)?;
                Ok(json!({"ok": true, "agent": updated}))
            })
        }),
    );

    reg.register(
        "agents.delete",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                ctx.state.catalog.delete(&id).await.map_err(map_err)?;
                Ok(json!({"ok": true, "id": id}))
            })
        }),
    );

    reg.register(
        "agents.files.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let agent_id = require_str(&ctx.params, "agentId")?;
                let files = ctx
                    .state
                    .catalog
                    .list_files(&agent_id)
                    .await
                    .map_err(map_err)?;
                Ok(json!({"agentId": agent_id, "files": files}))
            })
        }),
    );

    reg.register(
        "agents.files.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let agent_id = require_str(&ctx.params, "agentId")?;
                let path = require_str(&ctx.params, "path")?;
                let file = ctx
                    .state
                    .catalog
                    .get_file(&agent_id, &path)
                    .await
                    .map_err(map_err)?;
                match file {
                    Some(file) => Ok(json!({
                        "agentId": agent_id,
                        "path": path,
                        "content": file.content,
                        "updatedAtMs": file.updated_at_ms,
                        "missing": false,
                    })),
                    None => Ok(json!({
                        "agentId": agent_id,
                        "path": path,
                        "content": null,
                        "missing": true,
                    })),
                }
            })
        }),
    );

    reg.register(
        "agents.files.set",
        Box::new(|ctx| {
            Box::pin(async move {
                let agent_id = require_str(&ctx.params, "agentId")?;
                let path = require_str(&ctx.params, "path")?;
                let content = ctx
                    .params
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ErrorShape::invalid("missing content"))?
                    .to_string();
                let file = ctx
                    .state
                    .catalog
                    .set_file(&agent_id, &path, content, now_ms())
                    .await
                    .map_err(map_err)?;
                Ok(json!({
                    "ok": true,
                    "agentId": agent_id,
                    "path": path,
                    "updatedAtMs": file.updated_at_ms,
                }))
            })
        }),
    );

    reg.register(
        "agent.identity.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let default = ctx.state.catalog.default_agent().await;
                Ok(json!({
                    "name": default.as_ref().map(|a| a.name.clone()).unwrap_or_else(|| "tether".into()),
                    "agentId": default.map(|a| a.id),
                    "avatar": null,
                }))
            })
        }),
    );
}
