use std::path::{Path, PathBuf};

use {
    sha2::{Digest, Sha256},
    tracing::{debug, warn},
};

use crate::schema::TetherConfig;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["tether.toml", "tether.json5", "tether.json"];

/// Load config from the given path (format picked by extension).
pub fn load_config(path: &Path) -> anyhow::Result<TetherConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&raw, path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<TetherConfig> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let cfg = match ext.as_str() {
        "toml" => toml::from_str(raw)?,
        "json5" => json5::from_str(raw)?,
        _ => serde_json::from_str(raw)?,
    };
    Ok(apply_env_overrides(cfg))
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./tether.{toml,json5,json}` (project-local)
/// 2. `~/.config/tether/tether.{toml,json5,json}` (user-global)
///
/// Returns `TetherConfig::default()` (with env overrides) when no file is
/// found or the file fails to parse.
pub fn discover_and_load() -> TetherConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    apply_env_overrides(TetherConfig::default())
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }
    if let Some(dirs) = directories::ProjectDirs::from("", "", "tether") {
        for name in CONFIG_FILENAMES {
            let p = dirs.config_dir().join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Persist config as pretty JSON next to the discovered file (or the
/// project-local default when none exists yet).
pub fn save_config(cfg: &TetherConfig) -> anyhow::Result<()> {
    let path = find_config_file().unwrap_or_else(|| PathBuf::from("tether.json"));
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let raw = match ext.as_str() {
        "toml" => toml::to_string_pretty(cfg)?,
        _ => serde_json::to_string_pretty(cfg)?,
    };
    std::fs::write(&path, raw)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", path.display()))?;
    Ok(())
}

fn apply_env_overrides(mut cfg: TetherConfig) -> TetherConfig {
    if let Ok(token) = std::env::var(crate::ENV_CONTROL_TOKEN)
        && !token.trim().is_empty()
    {
        cfg.auth.token = Some(token.trim().to_string());
    }
    if let Ok(password) = std::env::var(crate::ENV_CONTROL_PASSWORD)
        && !password.trim().is_empty()
    {
        cfg.auth.password = Some(password.trim().to_string());
    }
    cfg
}

/// Stable hash over the canonical JSON serialization. `config.get` returns
/// it and `config.set` round-trips against it.
pub fn config_hash(cfg: &TetherConfig) -> String {
    let canonical = serde_json::to_string(cfg).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg = parse_config("", Path::new("tether.toml")).unwrap();
        assert_eq!(cfg.gateway.port, 18790);
        assert_eq!(cfg.lanes.max_pending_per_lane, 100);
        assert!(cfg.gateway.rpc_enabled);
    }

    #[test]
    fn partial_toml_overrides_one_section() {
        let raw = "[lanes]\nmax_pending_per_lane = 5\n";
        let cfg = parse_config(raw, Path::new("tether.toml")).unwrap();
        assert_eq!(cfg.lanes.max_pending_per_lane, 5);
        assert_eq!(cfg.rate_limit.max_attempts, 10);
    }

    #[test]
    fn json_round_trip_preserves_hash() {
        let cfg = TetherConfig::default();
        let raw = serde_json::to_string(&cfg).unwrap();
        let parsed: TetherConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config_hash(&cfg), config_hash(&parsed));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = TetherConfig::default();
        let mut b = TetherConfig::default();
        b.gateway.port = 9999;
        assert_ne!(config_hash(&a), config_hash(&b));
    }
}
