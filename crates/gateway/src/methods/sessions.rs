//! `sessions.*` and `usage.*` methods.

use serde_json::json;

use tether_protocol::ErrorShape;

use crate::state::now_ms;

use super::{MethodRegistry, require_str, str_param, u64_param};

fn map_err(e: tether_sessions::Error) -> ErrorShape {
    ErrorShape::not_found(e.to_string())
}

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "sessions.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let sessions = ctx.state.sessions.list().await;
                let count = sessions.len();
                Ok(json!({"sessions": sessions, "count": count}))
            })
        }),
    );

    reg.register(
        "sessions.resolve",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                let (resolved, exists) = ctx.state.sessions.resolve(&key).await;
                Ok(json!({"sessionKey": resolved, "exists": exists}))
            })
        }),
    );

    reg.register(
        "sessions.preview",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                let limit = u64_param(&ctx.params, "limit", 10).clamp(1, 100) as usize;
                let messages = ctx.state.sessions.history(&key, limit).await;
                Ok(json!({"sessionKey": key, "messages": messages}))
            })
        }),
    );

    reg.register(
        "sessions.patch",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                let outcome = ctx
                    .state
                    .sessions
                    .patch(&key, &ctx.params, now_ms())
                    .await
                    .map_err(map_err)?;
                Ok(json!({
                    "ok": true,
                    "sessionKey": key,
                    "changed": outcome.changed,
                    "metadata": outcome.metadata,
                }))
            })
        }),
    );

    reg.register(
        "sessions.reset",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                ctx.state
                    .sessions
                    .reset(&key, now_ms())
                    .await
                    .map_err(map_err)?;
                Ok(json!({"ok": true, "sessionKey": key}))
            })
        }),
    );

    reg.register(
        "sessions.delete",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                ctx.state.sessions.delete(&key).await.map_err(map_err)?;
                Ok(json!({"ok": true, "sessionKey": key}))
            })
        }),
    );

    reg.register(
        "sessions.compact",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = require_str(&ctx.params, "sessionKey")?;
                let dropped = ctx
                    .state
                    .sessions
                    .compact(&key, now_ms())
                    .await
                    .map_err(map_err)?;
                Ok(json!({"ok": true, "sessionKey": key, "dropped": dropped}))
            })
        }),
    );

    reg.register(
        "sessions.usage",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = str_param(&ctx.params, "sessionKey");
                let totals = ctx.state.sessions.usage_totals(key.as_deref()).await;
                Ok(json!({"sessionKey": key, "totals": totals}))
            })
        }),
    );

    reg.register(
        "sessions.usage.timeseries",
        Box::new(|ctx| {
            Box::pin(async move {
                let key = str_param(&ctx.params, "sessionKey");
                let series = ctx.state.sessions.usage_timeseries(key.as_deref()).await;
                Ok(json!({"sessionKey": key, "series": series}))
            })
        }),
    );

    reg.register(
        "sessions.usage.logs",
        Box::new(|ctx| {
            Box::pin(async move {
                let limit = u64_param(&ctx.params, "limit", 100).clamp(1, 500) as usize;
                let logs = ctx.state.sessions.usage_logs(limit).await;
                Ok(json!({"logs": logs}))
            })
        }),
    );

    reg.register(
        "usage.cost",
        Box::new(|ctx| {
            Box::pin(async move {
                let totals = ctx.state.sessions.usage_totals(None).await;
                Ok(json!({
                    "costUsd": totals.cost_usd,
                    "inputTokens": totals.input_tokens,
                    "outputTokens": totals.output_tokens,
                    "runs": totals.runs,
                }))
            })
        }),
    );

    reg.register(
        "usage.status",
        Box::new(|ctx| {
            Box::pin(async move {
                let totals = ctx.state.sessions.usage_totals(None).await;
                let sessions = ctx.state.sessions.count().await;
                Ok(json!({
                    "ok": true,
                    "sessions": sessions,
                    "totals": totals,
                }))
            })
        }),
    );
}
