//! Gateway configuration: schema, discovery, env overrides.

mod loader;
mod schema;

pub use {
    loader::{config_hash, discover_and_load, find_config_file, load_config, save_config},
    schema::{
        AlertsConfig, ApprovalForwardTarget, ApprovalsConfig, AuthConfig, ExecApprovalsConfig,
        GatewayConfig, LanesConfig, NodesConfig, RateLimitConfig, TetherConfig,
    },
};

/// Env var that overrides the shared control token.
pub const ENV_CONTROL_TOKEN: &str = "TETHER_CONTROL_TOKEN";
/// Env var that overrides the control password.
pub const ENV_CONTROL_PASSWORD: &str = "TETHER_CONTROL_PASSWORD";
/// Env var that overrides the derived canvas host URL.
pub const ENV_CANVAS_HOST_URL: &str = "TETHER_CANVAS_HOST_URL";
/// Env var holding the default-wallet unlock password, consumed at startup.
pub const ENV_WALLET_PASSWORD: &str = "TETHER_WALLET_PASSWORD";
