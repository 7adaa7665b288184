//! Gateway server wiring: axum router, WS upgrade, tick loop.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
    },
    tokio::net::TcpListener,
    tracing::info,
};

use crate::{broadcast, methods::MethodRegistry, state::{GatewayState, now_ms}, ws};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

/// Build the router and finish state assembly (method list, self
/// presence).
pub async fn build_app(gateway: Arc<GatewayState>) -> AppState {
    let methods = Arc::new(MethodRegistry::new());
    *gateway.method_names.write().await = methods.method_names();
    {
        let (host, port) = {
            let config = gateway.config.read().await;
            (config.gateway.host.clone(), config.gateway.port)
        };
        gateway
            .presence
            .write()
            .await
            .register_gateway(&host, port, now_ms());
    }
    AppState { gateway, methods }
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(app)
}

async fn ws_upgrade(
    State(app): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| {
        ws::handle_connection(socket, app.gateway, app.methods, addr)
    })
}

async fn health(State(app): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "ok": true,
        "version": app.gateway.version,
        "uptimeSeconds": app.gateway.uptime_seconds(),
        "clients": app.gateway.client_count().await,
    }))
}

/// Periodic maintenance: tick broadcast plus the approval sweeper, so
/// expired approvals cannot linger under zero traffic.
pub fn spawn_tick_loop(gateway: Arc<GatewayState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            tether_protocol::TICK_INTERVAL_MS,
        ));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            broadcast::broadcast_tick(&gateway, now_ms()).await;
            crate::methods::sweep_approvals(&gateway).await;
        }
    })
}

/// Serve until the listener fails. Binds the configured host/port.
pub async fn serve(gateway: Arc<GatewayState>) -> anyhow::Result<()> {
    let (host, port) = {
        let config = gateway.config.read().await;
        (config.gateway.host.clone(), config.gateway.port)
    };
    let app = build_app(Arc::clone(&gateway)).await;
    let tick = spawn_tick_loop(Arc::clone(&gateway));

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");
    let result = axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    tick.abort();
    result.map_err(Into::into)
}
