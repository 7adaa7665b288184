//! `cron.*` methods: job CRUD, manual runs, run history.

use std::sync::Arc;

use serde_json::json;

use tether_protocol::ErrorShape;

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    cron_jobs::{CronJob, CronSchedule},
    lanes::Admission,
    runner,
    state::{GatewayState, now_ms},
};

use super::{MethodRegistry, require_str, str_param, u64_param};

fn map_err(e: crate::cron_jobs::Error) -> ErrorShape {
    match e {
        crate::cron_jobs::Error::JobNotFound(_) => ErrorShape::not_found(e.to_string()),
        crate::cron_jobs::Error::InvalidSchedule(_) => ErrorShape::invalid(e.to_string()),
    }
}

pub(super) fn register(reg: &mut MethodRegistry) {
    reg.register(
        "cron.list",
        Box::new(|ctx| {
            Box::pin(async move {
                let jobs = ctx.state.cron.list().await;
                Ok(json!({"jobs": jobs}))
            })
        }),
    );

    reg.register(
        "cron.status",
        Box::new(|ctx| Box::pin(async move { Ok(ctx.state.cron.status(now_ms()).await) })),
    );

    reg.register(
        "cron.add",
        Box::new(|ctx| {
            Box::pin(async move {
                let name = require_str(&ctx.params, "name")?;
                let schedule: CronSchedule = serde_json::from_value(
                    ctx.params
                        .get("schedule")
                        .cloned()
                        .ok_or_else(|| ErrorShape::invalid("schedule required"))?,
                )
                .map_err(|e| ErrorShape::invalid(format!("invalid schedule: {e}")))?;
                let message = require_str(&ctx.params, "message")?;
                let job = CronJob {
                    id: format!("cron_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
                    name,
                    schedule,
                    message,
                    session_key: str_param(&ctx.params, "sessionKey"),
                    enabled: ctx
                        .params
                        .get("enabled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true),
                    created_at_ms: now_ms(),
                    last_run_at_ms: None,
                };
                let job = ctx.state.cron.add(job).await.map_err(map_err)?;
                broadcast(
                    &ctx.state,
                    "cron",
                    json!({"type": "job.added", "jobId": job.id.clone()}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true, "job": job}))
            })
        }),
    );

    reg.register(
        "cron.update",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                let job = ctx
                    .state
                    .cron
                    .update(&id, &ctx.params)
                    .await
                    .map_err(map_err)?;
                broadcast(
                    &ctx.state,
                    "cron",
                    json!({"type": "job.updated", "jobId": id.clone()}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true, "job": job}))
            })
        }),
    );

    reg.register(
        "cron.remove",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                ctx.state.cron.remove(&id).await.map_err(map_err)?;
                broadcast(
                    &ctx.state,
                    "cron",
                    json!({"type": "job.removed", "jobId": id.clone()}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true, "id": id}))
            })
        }),
    );

    reg.register(
        "cron.run",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                let job = ctx
                    .state
                    .cron
                    .get(&id)
                    .await
                    .ok_or_else(|| ErrorShape::not_found(format!("cron job not found: {id}")))?;
                let started = fire_job(&ctx.state, &job).await;
                ctx.state
                    .cron
                    .record_run(&id, if started { "ok" } else { "error" }, None, now_ms())
                    .await;
                broadcast(
                    &ctx.state,
                    "cron",
                    json!({"type": "job.run", "jobId": id.clone(), "started": started}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(json!({"ok": true, "id": id, "started": started}))
            })
        }),
    );

    reg.register(
        "cron.runs",
        Box::new(|ctx| {
            Box::pin(async move {
                let limit = u64_param(&ctx.params, "limit", 50) as usize;
                let runs = ctx.state.cron.runs(limit).await;
                Ok(json!({"runs": runs}))
            })
        }),
    );
}

/// Fire one job: admit its message into the target lane. Busy lanes queue
/// the run like any other submission.
async fn fire_job(state: &Arc<GatewayState>, job: &CronJob) -> bool {
    let session_key = job.session_key.clone().unwrap_or_else(|| "main".into());
    let run_id = format!("cron-{}-{}", job.id, &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let admission = state
        .lanes
        .admit(
            &run_id,
            &session_key,
            json!({"message": job.message.clone(), "sessionKey": session_key.clone()}),
            now_ms(),
        )
        .await;
    match admission {
        Admission::Started => {
            runner::spawn_run(
                Arc::clone(state),
                run_id,
                session_key,
                job.message.clone(),
                None,
            );
            true
        },
        Admission::Queued { .. } => true,
        _ => false,
    }
}
