//! Control-plane state methods: skills, voicewake, wizard, tts, channels,
//! talk config, plugins surface, web login.

use serde_json::json;

use {tether_protocol::ErrorShape, tether_storage::slots};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    state::now_ms,
};

use super::{MethodRegistry, require_str, str_param, u64_param};

pub(super) fn register(reg: &mut MethodRegistry) {
    // ── skills ───────────────────────────────────────────────────────────

    // Skills execute inside the agent loop; the gateway only tracks the
    // toggle state.
    reg.register(
        "skills.status",
        Box::new(|_ctx| {
            Box::pin(async move { Ok(json!({"ok": true, "skills": [], "entries": {}})) })
        }),
    );

    reg.register(
        "skills.update",
        Box::new(|ctx| {
            Box::pin(async move {
                let skill_key = str_param(&ctx.params, "skillKey")
                    .or_else(|| str_param(&ctx.params, "name"))
                    .ok_or_else(|| ErrorShape::invalid("skills.update requires skillKey"))?;
                Ok(json!({"ok": true, "skillKey": skill_key}))
            })
        }),
    );

    reg.register(
        "skills.install",
        Box::new(|_ctx| {
            Box::pin(async move { Ok(json!({"ok": true, "message": "install queued"})) })
        }),
    );

    // ── talk / voicewake / wizard / tts ──────────────────────────────────

    reg.register(
        "talk.config",
        Box::new(|ctx| {
            Box::pin(async move {
                let mut state = ctx
                    .state
                    .storage
                    .load(slots::TALK_CONFIG, json!({"enabled": true, "voice": "default"}))
                    .await;
                let updates: Vec<(String, serde_json::Value)> = ctx
                    .params
                    .as_object()
                    .map(|params| {
                        params
                            .iter()
                            .filter(|(k, _)| {
                                matches!(k.as_str(), "enabled" | "voice" | "language" | "speed")
                            })
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                if !updates.is_empty()
                    && let Some(obj) = state.as_object_mut()
                {
                    for (k, v) in updates {
                        obj.insert(k, v);
                    }
                    ctx.state.storage.save(slots::TALK_CONFIG, &state).await;
                }
                Ok(state)
            })
        }),
    );

    reg.register(
        "voicewake.get",
        Box::new(|ctx| {
            Box::pin(async move {
                Ok(ctx
                    .state
                    .storage
                    .load(slots::VOICEWAKE, json!({"enabled": false, "keyword": "hey tether"}))
                    .await)
            })
        }),
    );

    reg.register(
        "voicewake.set",
        Box::new(|ctx| {
            Box::pin(async move {
                let mut state = ctx
                    .state
                    .storage
                    .load(slots::VOICEWAKE, json!({"enabled": false, "keyword": "hey tether"}))
                    .await;
                if let Some(obj) = state.as_object_mut() {
                    if let Some(enabled) = ctx.params.get("enabled").and_then(|v| v.as_bool()) {
                        obj.insert("enabled".into(), json!(enabled));
                    }
                    if let Some(keyword) = str_param(&ctx.params, "keyword") {
                        obj.insert("keyword".into(), json!(keyword));
                    }
                }
                ctx.state.storage.save(slots::VOICEWAKE, &state).await;
                broadcast(
                    &ctx.state,
                    "health",
                    json!({"voicewake": state}),
                    BroadcastOpts::operators(),
                )
                .await;
                Ok(state)
            })
        }),
    );

    reg.register(
        "wizard.start",
        Box::new(|ctx| {
            Box::pin(async move {
                let state = json!({"step": 0, "startedAtMs": now_ms(), "done": false});
                ctx.state.storage.save(slots::WIZARD, &state).await;
                Ok(state)
            })
        }),
    );

    reg.register(
        "wizard.next",
        Box::new(|ctx| {
            Box::pin(async move {
                let mut state = ctx
                    .state
                    .storage
                    .load(slots::WIZARD, json!({"step": 0, "done": false}))
                    .await;
                let step = state.get("step").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                if let Some(obj) = state.as_object_mut() {
                    obj.insert("step".into(), json!(step));
                    obj.insert("done".into(), json!(step >= 3));
                    obj.insert("updatedAtMs".into(), json!(now_ms()));
                }
                ctx.state.storage.save(slots::WIZARD, &state).await;
                Ok(state)
            })
        }),
    );

    reg.register(
        "tts.status",
        Box::new(|ctx| {
            Box::pin(async move {
                Ok(ctx
                    .state
                    .storage
                    .load(slots::TTS, json!({"enabled": false, "provider": "none"}))
                    .await)
            })
        }),
    );

    reg.register(
        "tts.providers",
        Box::new(|_ctx| {
            Box::pin(async move {
                Ok(json!({"providers": [{"id": "none", "name": "Disabled"}], "default": "none"}))
            })
        }),
    );

    for (method, enabled) in [("tts.enable", true), ("tts.disable", false)] {
        reg.register(
            method,
            Box::new(move |ctx| {
                Box::pin(async move {
                    let mut state = ctx
                        .state
                        .storage
                        .load(slots::TTS, json!({"enabled": false, "provider": "none"}))
                        .await;
                    if let Some(obj) = state.as_object_mut() {
                        obj.insert("enabled".into(), json!(enabled));
                    }
                    ctx.state.storage.save(slots::TTS, &state).await;
                    let mut out = json!({"ok": true});
                    if let (Some(out_obj), Some(state_obj)) =
                        (out.as_object_mut(), state.as_object())
                    {
                        for (k, v) in state_obj {
                            out_obj.insert(k.clone(), v.clone());
                        }
                    }
                    Ok(out)
                })
            }),
        );
    }

    reg.register(
        "tts.convert",
        Box::new(|ctx| {
            Box::pin(async move {
                require_str(&ctx.params, "text")?;
                Ok(json!({
                    "ok": true,
                    "audioBase64": "",
                    "format": "wav",
                    "message": "tts provider not configured",
                }))
            })
        }),
    );

    // ── channels ─────────────────────────────────────────────────────────

    reg.register(
        "channels.status",
        Box::new(|ctx| {
            Box::pin(async move { Ok(ctx.state.services.channels.snapshot(now_ms()).await) })
        }),
    );

    reg.register(
        "channels.logout",
        Box::new(|ctx| {
            Box::pin(async move {
                let channel = require_str(&ctx.params, "channel")?;
                ctx.state
                    .services
                    .channels
                    .logout(&channel)
                    .await
                    .map_err(ErrorShape::unavailable)
            })
        }),
    );

    // ── plugins ──────────────────────────────────────────────────────────

    reg.register(
        "plugins.list",
        Box::new(|ctx| Box::pin(async move { Ok(ctx.state.services.plugins.list().await) })),
    );

    reg.register(
        "plugins.info",
        Box::new(|ctx| {
            Box::pin(async move {
                let id = require_str(&ctx.params, "id")?;
                ctx.state
                    .services
                    .plugins
                    .info(&id)
                    .await
                    .map_err(ErrorShape::not_found)
            })
        }),
    );

    reg.register(
        "plugins.doctor",
        Box::new(|ctx| Box::pin(async move { Ok(ctx.state.services.plugins.doctor().await) })),
    );

    reg.register(
        "plugins.status",
        Box::new(|ctx| {
            Box::pin(async move {
                let methods = ctx.state.services.plugins.gateway_methods().await;
                Ok(json!({"ok": true, "gatewayMethods": methods}))
            })
        }),
    );

    reg.register(
        "plugins.reload",
        Box::new(|ctx| {
            Box::pin(async move {
                ctx.state
                    .services
                    .plugins
                    .reload()
                    .await
                    .map_err(ErrorShape::unavailable)
            })
        }),
    );

    reg.register(
        "plugins.gateway.methods",
        Box::new(|ctx| {
            Box::pin(async move {
                let methods = ctx.state.services.plugins.gateway_methods().await;
                Ok(json!({"methods": methods}))
            })
        }),
    );

    reg.register(
        "plugins.http.dispatch",
        Box::new(|ctx| {
            Box::pin(async move {
                let method = require_str(&ctx.params, "method")?;
                let params = ctx.params.get("params").cloned().unwrap_or(json!({}));
                ctx.state
                    .services
                    .plugins
                    .dispatch(&method, &params)
                    .await
                    .map_err(ErrorShape::unavailable)
            })
        }),
    );

    reg.register(
        "plugins.cli.list",
        Box::new(|_ctx| Box::pin(async move { Ok(json!({"commands": []})) })),
    );

    reg.register(
        "plugins.cli.invoke",
        Box::new(|ctx| {
            Box::pin(async move {
                let command = require_str(&ctx.params, "command")?;
                Err(ErrorShape::unavailable(format!(
                    "plugin cli command not available: {command}"
                )))
            })
        }),
    );

    for method in [
        "plugins.channels.list",
        "plugins.providers.list",
        "plugins.hooks.list",
    ] {
        reg.register(
            method,
            Box::new(|_ctx| Box::pin(async move { Ok(json!({"items": []})) })),
        );
    }

    for method in ["plugins.services.start", "plugins.services.stop"] {
        reg.register(
            method,
            Box::new(|ctx| {
                Box::pin(async move {
                    let id = require_str(&ctx.params, "id")?;
                    Err(ErrorShape::unavailable(format!(
                        "plugin service not available: {id}"
                    )))
                })
            }),
        );
    }

    reg.register(
        "plugins.setup_host",
        Box::new(|_ctx| {
            Box::pin(async move { Ok(json!({"ok": true, "message": "plugin host not configured"})) })
        }),
    );

    // ── web login ────────────────────────────────────────────────────────

    reg.register(
        "web.login.start",
        Box::new(|ctx| {
            Box::pin(async move {
                let timeout_ms = u64_param(&ctx.params, "timeoutMs", 30_000);
                let result = ctx
                    .state
                    .services
                    .web_login
                    .start(timeout_ms)
                    .await
                    .map_err(ErrorShape::unavailable)?;
                ctx.state
                    .storage
                    .save(
                        slots::WHATSAPP_LOGIN,
                        &json!({
                            "lastQr": result.get("qrDataUrl"),
                            "connected": result.get("connected").and_then(|v| v.as_bool()).unwrap_or(false),
                            "updatedAtMs": now_ms(),
                        }),
                    )
                    .await;
                Ok(result)
            })
        }),
    );

    reg.register(
        "web.login.wait",
        Box::new(|ctx| {
            Box::pin(async move {
                let timeout_ms = u64_param(&ctx.params, "timeoutMs", 120_000);
                let result = ctx
                    .state
                    .services
                    .web_login
                    .wait(timeout_ms)
                    .await
                    .map_err(ErrorShape::unavailable)?;
                ctx.state
                    .storage
                    .save(
                        slots::WHATSAPP_LOGIN,
                        &json!({
                            "lastQr": null,
                            "connected": result.get("connected").and_then(|v| v.as_bool()).unwrap_or(false),
                            "updatedAtMs": now_ms(),
                        }),
                    )
                    .await;
                Ok(result)
            })
        }),
    );
}
