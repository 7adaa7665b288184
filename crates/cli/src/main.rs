//! tether CLI: run the gateway, query a running instance.

use std::sync::Arc;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::info,
};

use {
    tether_agents::NoopAgentService,
    tether_gateway::{server, services::GatewayServices, state::GatewayState},
    tether_storage::FileSlotStore,
};

#[derive(Parser)]
#[command(name = "tether", version, about = "Control-plane RPC gateway for chat-agent orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway in the foreground.
    Run {
        /// Bind host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Query a running gateway's health endpoint.
    Status {
        /// Gateway base URL.
        #[arg(long, default_value = "http://127.0.0.1:18790")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { host, port } => {
            let mut config = tether_config::discover_and_load();
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let storage = Arc::new(FileSlotStore::default_path().context("slot store")?);
            let state = GatewayState::new(
                config,
                storage,
                GatewayServices::default(),
                Arc::new(NoopAgentService),
            );
            info!(version = %state.version, "starting gateway");
            server::serve(state).await
        },
        Command::Status { url } => {
            let response = reqwest::get(format!("{}/health", url.trim_end_matches('/')))
                .await
                .context("gateway unreachable")?;
            let body: serde_json::Value = response.json().await.context("invalid health payload")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        },
    }
}
