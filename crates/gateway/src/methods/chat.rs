//! Chat runtime (`chat.*`, `agent`, `agent.wait`), lane observability and
//! trace queries.

use std::sync::Arc;

use serde_json::json;

use tether_protocol::{ErrorShape, error_codes};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    lanes::Admission,
    runner,
    state::now_ms,
};

use super::{MethodRegistry, MethodResult, bool_param, str_param, u64_param};

pub(super) fn register(reg: &mut MethodRegistry) {
    for method in ["chat.send", "agent"] {
        reg.register(
            method,
            Box::new(|ctx| Box::pin(async move { handle_send(ctx).await })),
        );
    }

    reg.register(
        "agent.wait",
        Box::new(|ctx| {
            Box::pin(async move {
                let run_id = super::require_str(&ctx.params, "runId")?;
                let timeout_ms = u64_param(&ctx.params, "timeoutMs", 30_000);
                match ctx.state.lanes.wait(&run_id, timeout_ms).await {
                    Some(job) => Ok(json!({
                        "runId": run_id,
                        "status": job.status.as_str(),
                        "startedAt": job.started_at_ms,
                        "endedAt": job.ended_at_ms,
                        "error": job.error,
                    })),
                    None => Ok(json!({"runId": run_id, "status": "timeout"})),
                }
            })
        }),
    );

    reg.register(
        "chat.inject",
        Box::new(|ctx| {
            Box::pin(async move {
                // Append-only: never starts a run.
                let session_key =
                    str_param(&ctx.params, "sessionKey").unwrap_or_else(|| "main".into());
                let role = str_param(&ctx.params, "role").unwrap_or_else(|| "user".into());
                let text = str_param(&ctx.params, "text")
                    .or_else(|| str_param(&ctx.params, "message"))
                    .ok_or_else(|| ErrorShape::invalid("chat.inject requires text"))?;
                ctx.state
                    .sessions
                    .append_message(&session_key, &role, &text, now_ms())
                    .await;
                Ok(json!({"ok": true, "sessionKey": session_key}))
            })
        }),
    );

    reg.register(
        "chat.abort",
        Box::new(|ctx| {
            Box::pin(async move {
                let session_key =
                    str_param(&ctx.params, "sessionKey").unwrap_or_else(|| "main".into());
                let run_id = str_param(&ctx.params, "runId")
                    .or(ctx.state.lanes.running_run_id(&session_key).await)
                    .ok_or_else(|| ErrorShape::invalid("no running job for session"))?;
                ctx.state.request_abort(&run_id);
                broadcast(
                    &ctx.state,
                    "chat",
                    json!({"runId": run_id.clone(), "sessionKey": session_key, "state": "aborted"}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true, "aborted": true, "runId": run_id}))
            })
        }),
    );

    reg.register(
        "chat.history",
        Box::new(|ctx| {
            Box::pin(async move {
                let session_key =
                    str_param(&ctx.params, "sessionKey").unwrap_or_else(|| "main".into());
                let limit = u64_param(&ctx.params, "limit", 200).clamp(1, 1000) as usize;
                let messages = ctx.state.sessions.history(&session_key, limit).await;
                let count = messages.len();
                Ok(json!({
                    "sessionKey": session_key,
                    "messages": messages,
                    "count": count,
                }))
            })
        }),
    );

    reg.register(
        "lanes.status",
        Box::new(|ctx| {
            Box::pin(async move {
                let now = now_ms();
                match str_param(&ctx.params, "sessionKey") {
                    Some(session_key) => Ok(ctx.state.lanes.lane_status(&session_key, now).await),
                    None => Ok(ctx.state.lanes.lane_list(now).await),
                }
            })
        }),
    );

    reg.register(
        "lanes.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let list = ctx.state.lanes.lane_list(now_ms()).await;
                Ok(json!({"lanes": list.get("lanes"), "summary": list.get("summary")}))
            })
        }),
    );

    reg.register(
        "traces.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let session_key = str_param(&ctx.params, "sessionKey");
                let limit = u64_param(&ctx.params, "limit", 50).clamp(1, 200) as usize;
                let cursor = str_param(&ctx.params, "cursor");
                let (items, next_cursor) = ctx
                    .state
                    .traces
                    .list(session_key.as_deref(), limit, cursor.as_deref())
                    .await;
                let mut payload = json!({"items": items});
                if let (Some(obj), Some(next)) = (payload.as_object_mut(), next_cursor) {
                    obj.insert("nextCursor".into(), json!(next));
                }
                Ok(payload)
            })
        }),
    );

    reg.register(
        "traces.get",
        Box::new(|ctx| {
            Box::pin(async move {
                let trace_id = super::require_str(&ctx.params, "traceId")?;
                ctx.state.traces.get(&trace_id).await.ok_or_else(|| {
                    ErrorShape::with_data(
                        error_codes::NOT_FOUND,
                        "trace not found",
                        json!({"traceId": trace_id}),
                    )
                })
            })
        }),
    );
}

// ── chat.send / agent ────────────────────────────────────────────────────────

async fn handle_send(ctx: super::MethodContext) -> MethodResult {
    let message = str_param(&ctx.params, "message")
        .or_else(|| str_param(&ctx.params, "text"))
        .ok_or_else(|| ErrorShape::invalid("chat.send requires message"))?;
    let session_key = str_param(&ctx.params, "sessionKey")
        .or_else(|| str_param(&ctx.params, "sessionId"))
        .unwrap_or_else(|| "main".into());
    let agent_id = str_param(&ctx.params, "agentId");
    let run_id = str_param(&ctx.params, "idempotencyKey")
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());
    let expect_final = bool_param(&ctx.params, "expectFinal", false);
    let timeout_ms = u64_param(&ctx.params, "timeoutMs", 30_000);
    let now = now_ms();

    let admission = ctx
        .state
        .lanes
        .admit(&run_id, &session_key, ctx.params.clone(), now)
        .await;

    match admission {
        Admission::InFlight { run_id } => {
            Ok(json!({"runId": run_id, "status": "in_flight", "sessionKey": session_key}))
        },
        Admission::QueueFull => Err(ErrorShape::with_data(
            error_codes::QUEUE_FULL,
            "session queue is full, try again later",
            json!({"sessionKey": session_key, "runId": run_id}),
        )),
        Admission::Queued { position, depth } => {
            broadcast(
                &ctx.state,
                "lanes.enqueued",
                json!({"sessionKey": session_key.clone(), "runId": run_id.clone(), "position": position}),
                BroadcastOpts::operators(),
            )
            .await;
            broadcast(
                &ctx.state,
                "lanes.depth.changed",
                ctx.state.lanes.lane_status(&session_key, now).await,
                BroadcastOpts::operators(),
            )
            .await;
            Ok(json!({
                "status": "queued",
                "ok": true,
                "runId": run_id,
                "sessionKey": session_key,
                "position": position,
                "queueDepth": depth,
                "acceptedAt": now,
            }))
        },
        Admission::Started => {
            runner::spawn_run(
                Arc::clone(&ctx.state),
                run_id.clone(),
                session_key.clone(),
                message,
                agent_id,
            );
            if expect_final {
                return match ctx.state.lanes.wait(&run_id, timeout_ms).await {
                    Some(job) => {
                        let mut out = json!({
                            "runId": run_id,
                            "status": job.status.as_str(),
                            "startedAt": job.started_at_ms,
                            "endedAt": job.ended_at_ms,
                            "error": job.error,
                            "sessionKey": session_key,
                        });
                        if let (Some(obj), Some(result)) = (out.as_object_mut(), job.result) {
                            if let Some(state) = result.get("state") {
                                obj.insert("state".into(), state.clone());
                            }
                            if let Some(message) = result.get("message") {
                                obj.insert("message".into(), message.clone());
                            }
                        }
                        Ok(out)
                    },
                    None => Ok(json!({"runId": run_id, "status": "timeout"})),
                };
            }
            let ack = if ctx.method == "chat.send" {
                "started"
            } else {
                "accepted"
            };
            Ok(json!({
                "status": ack,
                "ok": true,
                "runId": run_id,
                "sessionKey": session_key,
                "acceptedAt": now,
            }))
        },
    }
}
