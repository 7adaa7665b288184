//! Connect-time authentication: sliding-window rate limiting per
//! (scope, peer ip) with lockout, credential checks, scope resolution.

use std::collections::HashMap;

use {
    sha2::{Digest, Sha256},
    tokio::sync::Mutex,
};

use {tether_config::TetherConfig, tether_protocol::scopes};

pub const RATE_SCOPE_SHARED_SECRET: &str = "shared-secret";
pub const RATE_SCOPE_DEVICE_TOKEN: &str = "device-token";

pub fn is_loopback(ip: &str) -> bool {
    matches!(ip.trim(), "127.0.0.1" | "::1" | "localhost")
}

/// Hex sha-256 of a pairing/device token. Raw tokens never touch disk.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time hex digest comparison.
pub fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RateLimitEntry {
    /// Attempt timestamps (ms) inside the sliding window.
    attempts: Vec<u64>,
    locked_until: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_ms: u64,
}

/// Sliding-window auth attempt limiter keyed by `scope:ip`.
pub struct AuthRateLimiter {
    max_attempts: u32,
    window_ms: u64,
    lockout_ms: u64,
    exempt_loopback: bool,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl AuthRateLimiter {
    pub fn new(max_attempts: u32, window_ms: u64, lockout_ms: u64, exempt_loopback: bool) -> Self {
        Self {
            max_attempts,
            window_ms,
            lockout_ms,
            exempt_loopback,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &TetherConfig) -> Self {
        Self::new(
            cfg.rate_limit.max_attempts,
            cfg.rate_limit.window_ms,
            cfg.rate_limit.lockout_ms,
            cfg.auth.rate_limit_exempt_loopback,
        )
    }

    fn key(ip: &str, scope: &str) -> String {
        let ip = ip.trim();
        let ip = if ip.is_empty() { "unknown" } else { ip };
        format!("{scope}:{ip}")
    }

    fn slide(&self, entry: &mut RateLimitEntry, now: u64) {
        let cutoff = now.saturating_sub(self.window_ms);
        entry.attempts.retain(|t| *t > cutoff);
    }

    pub async fn check(&self, ip: &str, scope: &str, now: u64) -> RateLimitCheck {
        if self.exempt_loopback && is_loopback(ip) {
            return RateLimitCheck {
                allowed: true,
                remaining: self.max_attempts,
                retry_after_ms: 0,
            };
        }
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&Self::key(ip, scope)) else {
            return RateLimitCheck {
                allowed: true,
                remaining: self.max_attempts,
                retry_after_ms: 0,
            };
        };
        if let Some(until) = entry.locked_until {
            if now < until {
                return RateLimitCheck {
                    allowed: false,
                    remaining: 0,
                    retry_after_ms: until - now,
                };
            }
            entry.locked_until = None;
            entry.attempts.clear();
        }
        self.slide(entry, now);
        let remaining = self.max_attempts.saturating_sub(entry.attempts.len() as u32);
        RateLimitCheck {
            allowed: remaining > 0,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub async fn record_failure(&self, ip: &str, scope: &str, now: u64) {
        if self.exempt_loopback && is_loopback(ip) {
            return;
        }
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(Self::key(ip, scope)).or_default();
        if let Some(until) = entry.locked_until
            && now < until
        {
            return;
        }
        self.slide(entry, now);
        entry.attempts.push(now);
        if entry.attempts.len() as u32 >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout_ms);
        }
    }

    pub async fn reset(&self, ip: &str, scope: &str) {
        self.entries.lock().await.remove(&Self::key(ip, scope));
    }

    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }
}

// ── Credential resolution ────────────────────────────────────────────────────

/// Which credential satisfied the connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialKind {
    SharedToken,
    Password,
    DeviceToken,
    Insecure,
}

/// Check shared-secret style credentials against config.
pub fn check_shared_credentials(
    cfg: &TetherConfig,
    token: Option<&str>,
    password: Option<&str>,
) -> Option<CredentialKind> {
    if let (Some(expected), Some(given)) = (cfg.auth.token.as_deref(), token)
        && !expected.is_empty()
        && digest_eq(&hash_token(expected), &hash_token(given))
    {
        return Some(CredentialKind::SharedToken);
    }
    if let (Some(expected), Some(given)) = (cfg.auth.password.as_deref(), password)
        && !expected.is_empty()
        && digest_eq(&hash_token(expected), &hash_token(given))
    {
        return Some(CredentialKind::Password);
    }
    if cfg.auth.allow_insecure_auth {
        return Some(CredentialKind::Insecure);
    }
    None
}

/// Scope grant: intersection of the request with what the device holds.
/// An empty request falls back to the grant set itself (or the configured
/// default set for shared-secret connects).
pub fn resolve_scopes(requested: Option<&[String]>, granted: &[String]) -> Vec<String> {
    match requested {
        Some(req) if !req.is_empty() => req
            .iter()
            .filter(|s| granted.iter().any(|g| g == *s))
            .cloned()
            .collect(),
        _ => granted.to_vec(),
    }
}

/// Scope set handed to shared-secret operator connects.
pub fn operator_grant() -> Vec<String> {
    scopes::default_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 60_000;
    const LOCKOUT: u64 = 300_000;

    fn limiter() -> AuthRateLimiter {
        AuthRateLimiter::new(3, WINDOW, LOCKOUT, true)
    }

    #[tokio::test]
    async fn failures_consume_window_then_lock() {
        let rl = limiter();
        let ip = "203.0.113.9";
        for t in 0..3u64 {
            assert!(rl.check(ip, RATE_SCOPE_SHARED_SECRET, t).await.allowed);
            rl.record_failure(ip, RATE_SCOPE_SHARED_SECRET, t).await;
        }
        let check = rl.check(ip, RATE_SCOPE_SHARED_SECRET, 10).await;
        assert!(!check.allowed);
        assert!(check.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn lockout_expires() {
        let rl = limiter();
        let ip = "203.0.113.9";
        for t in 0..3u64 {
            rl.record_failure(ip, RATE_SCOPE_SHARED_SECRET, t).await;
        }
        assert!(!rl.check(ip, RATE_SCOPE_SHARED_SECRET, 100).await.allowed);
        let after = rl.check(ip, RATE_SCOPE_SHARED_SECRET, 2 + LOCKOUT + 1).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 3);
    }

    #[tokio::test]
    async fn window_slides() {
        let rl = limiter();
        let ip = "203.0.113.9";
        rl.record_failure(ip, RATE_SCOPE_DEVICE_TOKEN, 0).await;
        rl.record_failure(ip, RATE_SCOPE_DEVICE_TOKEN, 1).await;
        // Both attempts age out of the window.
        let check = rl.check(ip, RATE_SCOPE_DEVICE_TOKEN, WINDOW + 10).await;
        assert_eq!(check.remaining, 3);
    }

    #[tokio::test]
    async fn loopback_is_exempt() {
        let rl = limiter();
        for t in 0..10u64 {
            rl.record_failure("127.0.0.1", RATE_SCOPE_SHARED_SECRET, t).await;
        }
        assert!(rl.check("127.0.0.1", RATE_SCOPE_SHARED_SECRET, 20).await.allowed);
        assert_eq!(rl.size().await, 0);
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let rl = limiter();
        let ip = "203.0.113.9";
        for t in 0..3u64 {
            rl.record_failure(ip, RATE_SCOPE_SHARED_SECRET, t).await;
        }
        assert!(rl.check(ip, RATE_SCOPE_DEVICE_TOKEN, 10).await.allowed);
    }

    #[test]
    fn token_check_matches_exact() {
        let mut cfg = TetherConfig::default();
        cfg.auth.token = Some("secret".into());
        assert_eq!(
            check_shared_credentials(&cfg, Some("secret"), None),
            Some(CredentialKind::SharedToken)
        );
        assert_eq!(check_shared_credentials(&cfg, Some("wrong"), None), None);
    }

    #[test]
    fn insecure_auth_accepts_anything() {
        let mut cfg = TetherConfig::default();
        cfg.auth.allow_insecure_auth = true;
        assert_eq!(
            check_shared_credentials(&cfg, None, None),
            Some(CredentialKind::Insecure)
        );
    }

    #[test]
    fn scope_resolution_intersects() {
        let granted = vec!["operator.read".to_string(), "operator.write".to_string()];
        let requested = vec!["operator.read".to_string(), "operator.admin".to_string()];
        assert_eq!(
            resolve_scopes(Some(&requested), &granted),
            vec!["operator.read".to_string()]
        );
        assert_eq!(resolve_scopes(None, &granted), granted);
    }

    #[test]
    fn digest_compare_rejects_len_mismatch() {
        assert!(!digest_eq("ab", "abc"));
        assert!(digest_eq(&hash_token("x"), &hash_token("x")));
    }
}
