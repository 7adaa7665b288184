//! Background agent-job execution: runs one admitted item through the
//! agent service, emits chat events, records the trace, and drains the
//! lane FIFO.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, warn};

use {
    tether_agents::{AgentRequest, RunContext},
    tether_protocol::EventFrame,
    tether_sessions::UsageSample,
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    lanes::{JobStatus, LanePendingItem},
    state::{GatewayState, now_ms},
    traces::AgentTrace,
};

/// Rough token estimate for usage accounting (chars / 4).
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn chat_payload(run_id: &str, session_key: &str, state: &str, text: Option<&str>) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "runId": run_id,
        "sessionKey": session_key,
        "state": state,
    });
    if let Some(text) = text
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert(
            "message".into(),
            serde_json::json!({
                "role": "assistant",
                "content": [{"type": "text", "text": text}],
            }),
        );
    }
    payload
}

/// Fan a chat payload out to nodes subscribed to the session.
async fn fanout_to_nodes(state: &Arc<GatewayState>, session_key: &str, payload: &serde_json::Value) {
    let conns = {
        let nodes = state.nodes.read().await;
        nodes.subscribed_conns(session_key)
    };
    if conns.is_empty() {
        return;
    }
    let frame = EventFrame::new("chat", payload.clone(), state.next_seq());
    let Ok(json) = serde_json::to_string(&frame) else {
        return;
    };
    for conn_id in conns {
        if !state.send_to_conn(&conn_id, &json).await {
            debug!(conn_id = %conn_id, "chat fan-out target gone");
        }
    }
}

async fn emit_chat(state: &Arc<GatewayState>, payload: serde_json::Value) {
    broadcast(state, "chat", payload, BroadcastOpts::operators()).await;
}

/// Spawn one agent run as a detached task. On completion the next pending
/// lane item (if any) is started, preserving per-session admission order.
pub fn spawn_run(
    state: Arc<GatewayState>,
    run_id: String,
    session_key: String,
    message: String,
    agent_id: Option<String>,
) {
    tokio::spawn(run_agent_job(state, run_id, session_key, message, agent_id));
}

async fn run_agent_job(
    state: Arc<GatewayState>,
    run_id: String,
    session_key: String,
    message: String,
    agent_id: Option<String>,
) {
    let started_at = now_ms();
    state
        .sessions
        .append_message(&session_key, "user", &message, started_at)
        .await;

    broadcast(
        &state,
        "agent",
        serde_json::json!({"runId": run_id.clone(), "sessionKey": session_key.clone(), "state": "started"}),
        BroadcastOpts::operators(),
    )
    .await;
    // Empty-text delta prelude so clients can render the pending run.
    emit_chat(&state, chat_payload(&run_id, &session_key, "delta", Some(""))).await;

    let abort_flag = state.abort_flag(&run_id);
    let flag = Arc::clone(&abort_flag);
    let ctx = RunContext::new(run_id.clone(), Box::new(move || flag.load(Ordering::Relaxed)));

    let request = AgentRequest {
        message: message.clone(),
        session_key: session_key.clone(),
        agent_id,
    };
    let outcome = state.agent.process_direct(request, ctx).await;
    let ended_at = now_ms();
    state.clear_abort(&run_id);

    let (status, payload, error, fan_out) = match outcome {
        Ok(reply) if reply.aborted => {
            let payload = chat_payload(&run_id, &session_key, "aborted", None);
            (JobStatus::Aborted, payload, None, true)
        },
        Ok(reply) => {
            state
                .sessions
                .append_message(&session_key, "assistant", &reply.response, ended_at)
                .await;
            state
                .sessions
                .record_usage(&session_key, UsageSample {
                    ts_ms: ended_at,
                    input_tokens: estimate_tokens(&message),
                    output_tokens: estimate_tokens(&reply.response),
                    cost_usd: 0.0,
                })
                .await;
            let payload = chat_payload(&run_id, &session_key, "final", Some(&reply.response));
            (JobStatus::Ok, payload, None, true)
        },
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "agent run failed");
            let error_text = e.to_string();
            let mut payload = chat_payload(&run_id, &session_key, "error", None);
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("error".into(), serde_json::json!(error_text.clone()));
            }
            (JobStatus::Error, payload, Some(error_text), false)
        },
    };

    // Trace lands before completion waiters wake, so a successful
    // `agent.wait` can always see it.
    state
        .traces
        .record(AgentTrace {
            trace_id: run_id.clone(),
            session_key: session_key.clone(),
            status: status.as_str().to_string(),
            started_at_ms: started_at,
            ended_at_ms: ended_at,
            error_text: error.clone(),
            steps_json: "[]".into(),
            tools_used: Vec::new(),
            message_preview: message.clone(),
        })
        .await;

    // Terminal chat event goes out before the next queued run can start,
    // so per-session event order matches admission order.
    emit_chat(&state, payload.clone()).await;
    if fan_out {
        fanout_to_nodes(&state, &session_key, &payload).await;
    }

    let result = matches!(status, JobStatus::Ok | JobStatus::Aborted).then(|| payload.clone());
    let next = state
        .lanes
        .complete(&run_id, status, result, error, ended_at)
        .await;

    broadcast(
        &state,
        "agent",
        serde_json::json!({
            "runId": run_id.clone(),
            "sessionKey": session_key.clone(),
            "state": "completed",
            "status": status.as_str(),
        }),
        BroadcastOpts::operators(),
    )
    .await;

    broadcast(
        &state,
        "lanes.completed",
        serde_json::json!({"sessionKey": session_key.clone(), "runId": run_id.clone(), "status": status.as_str()}),
        BroadcastOpts::operators(),
    )
    .await;

    if let Some(item) = next {
        start_dequeued(&state, item).await;
    }
}

/// Start a lane item that was waiting behind a completed run.
pub async fn start_dequeued(state: &Arc<GatewayState>, item: LanePendingItem) {
    let now = now_ms();
    state.lanes.start_dequeued(&item, now).await;
    broadcast(
        state,
        "lanes.dequeued",
        serde_json::json!({"sessionKey": item.session_key, "runId": item.run_id}),
        BroadcastOpts::operators(),
    )
    .await;
    broadcast(
        state,
        "lanes.depth.changed",
        state.lanes.lane_status(&item.session_key, now).await,
        BroadcastOpts::operators(),
    )
    .await;

    let message = item
        .params
        .get("message")
        .or_else(|| item.params.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let agent_id = item
        .params
        .get("agentId")
        .and_then(|v| v.as_str())
        .map(String::from);
    if message.is_empty() {
        // Queued item lost its payload; fail it without invoking the agent.
        let next = state
            .lanes
            .complete(
                &item.run_id,
                JobStatus::Error,
                None,
                Some("queued item missing message".into()),
                now_ms(),
            )
            .await;
        if let Some(next) = next {
            Box::pin(start_dequeued(state, next)).await;
        }
        return;
    }
    spawn_run(
        Arc::clone(state),
        item.run_id,
        item.session_key,
        message,
        agent_id,
    );
}
