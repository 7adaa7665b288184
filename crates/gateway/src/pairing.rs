//! Device and node pairing over the persisted `rpc.device_pairs` and
//! `rpc.node_tokens` slots. Raw tokens are returned to the caller exactly
//! once, on creation or rotation; only hex digests are stored.

use std::sync::Arc;

use serde_json::{Value, json};

use {
    crate::auth::{digest_eq, hash_token},
    tether_storage::{SlotStore, slots},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown requestId")]
    UnknownRequest,

    #[error("device not paired")]
    NotPaired,
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_operator_scopes() -> Vec<String> {
    vec![
        "operator.read".into(),
        "operator.write".into(),
        "operator.admin".into(),
    ]
}

pub struct PairingStore {
    storage: Arc<dyn SlotStore>,
}

impl PairingStore {
    pub fn new(storage: Arc<dyn SlotStore>) -> Self {
        Self { storage }
    }

    /// Normalized device-pairs slot: `{ pending: [], paired: [] }`.
    pub async fn load_pairs(&self) -> Value {
        let raw = self
            .storage
            .load(slots::DEVICE_PAIRS, json!({"pending": [], "paired": []}))
            .await;
        let pending = raw.get("pending").and_then(|v| v.as_array()).cloned();
        let paired = raw.get("paired").and_then(|v| v.as_array()).cloned();
        json!({
            "pending": pending.unwrap_or_default(),
            "paired": paired.unwrap_or_default(),
        })
    }

    async fn save_pairs(&self, pending: Vec<Value>, paired: Vec<Value>) {
        self.storage
            .save(
                slots::DEVICE_PAIRS,
                &json!({"pending": pending, "paired": paired}),
            )
            .await;
    }

    fn split(pairs: Value) -> (Vec<Value>, Vec<Value>) {
        let pending = pairs
            .get("pending")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let paired = pairs
            .get("paired")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        (pending, paired)
    }

    pub async fn paired_device(&self, device_id: &str) -> Option<Value> {
        let pairs = self.load_pairs().await;
        pairs
            .get("paired")
            .and_then(|v| v.as_array())
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("deviceId").and_then(|v| v.as_str()) == Some(device_id))
            })
            .cloned()
    }

    /// True when the device is paired with the `node` role.
    pub async fn is_paired_node(&self, device_id: &str) -> bool {
        let Some(entry) = self.paired_device(device_id).await else {
            return false;
        };
        let roles = entry.get("roles").and_then(|v| v.as_array());
        roles
            .map(|r| r.iter().any(|v| v.as_str() == Some("node")))
            .unwrap_or(false)
            || entry.get("role").and_then(|v| v.as_str()) == Some("node")
    }

    /// Verify a raw device token against the stored digest for any role.
    /// Returns `(role, scopes)` on success.
    pub async fn verify_device_token(
        &self,
        device_id: &str,
        token: &str,
    ) -> Option<(String, Vec<String>)> {
        let entry = self.paired_device(device_id).await?;
        let tokens = entry.get("tokens").and_then(|v| v.as_object())?;
        let given_hash = hash_token(token);
        for (role, record) in tokens {
            if record.get("revokedAtMs").map(|v| !v.is_null()).unwrap_or(false) {
                continue;
            }
            let stored = record.get("tokenHash").and_then(|v| v.as_str()).unwrap_or("");
            if !stored.is_empty() && digest_eq(stored, &given_hash) {
                let scopes = record
                    .get("scopes")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_else(default_operator_scopes);
                return Some((role.clone(), scopes));
            }
        }
        None
    }

    // ── Device pairing ───────────────────────────────────────────────────

    /// Queue a pairing request for an unknown device. Returns the request
    /// row (existing row when the device already asked).
    pub async fn request_device_pair(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        platform: Option<&str>,
        now_ms: u64,
    ) -> (Value, bool) {
        let (mut pending, paired) = Self::split(self.load_pairs().await);
        if let Some(existing) = pending
            .iter()
            .find(|row| row.get("deviceId").and_then(|v| v.as_str()) == Some(device_id))
        {
            return (existing.clone(), false);
        }
        let request = json!({
            "requestId": format!("dpr_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            "deviceId": device_id,
            "displayName": display_name,
            "platform": platform,
            "roles": ["operator"],
            "requestedAtMs": now_ms,
        });
        pending.push(request.clone());
        self.save_pairs(pending, paired).await;
        (request, true)
    }

    /// Approve a pending device request; issues an operator token.
    /// An unknown requestId only prunes nothing and reports no token.
    pub async fn approve_device(&self, request_id: &str, now_ms: u64) -> Option<Value> {
        let (pending, mut paired) = Self::split(self.load_pairs().await);
        let mut matched = None;
        let mut left = Vec::with_capacity(pending.len());
        for row in pending {
            if row.get("requestId").and_then(|v| v.as_str()) == Some(request_id) {
                matched = Some(row);
            } else {
                left.push(row);
            }
        }
        let Some(matched) = matched else {
            self.save_pairs(left, paired).await;
            return None;
        };
        let device_id = matched
            .get("deviceId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let scopes = matched
            .get("scopes")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_operator_scopes);
        let token = format!("tok_{}", uuid::Uuid::new_v4().simple());
        paired.push(json!({
            "deviceId": device_id.clone(),
            "displayName": matched.get("displayName"),
            "roles": ["operator"],
            "scopes": scopes.clone(),
            "approvedAtMs": now_ms,
            "tokens": {
                "operator": {
                    "tokenHash": hash_token(&token),
                    "scopes": scopes.clone(),
                    "createdAtMs": now_ms,
                    "lastUsedAtMs": null,
                    "revokedAtMs": null,
                },
            },
        }));
        self.save_pairs(left, paired).await;
        Some(json!({
            "ok": true,
            "token": token,
            "deviceId": device_id,
            "role": "operator",
            "scopes": scopes,
        }))
    }

    pub async fn reject_device(&self, request_id: &str) {
        let (pending, paired) = Self::split(self.load_pairs().await);
        let left: Vec<Value> = pending
            .into_iter()
            .filter(|row| row.get("requestId").and_then(|v| v.as_str()) != Some(request_id))
            .collect();
        self.save_pairs(left, paired).await;
    }

    /// Update the stored display name for a paired device. Returns false
    /// when the device is not paired.
    pub async fn rename_device(&self, device_id: &str, display_name: &str) -> bool {
        let (pending, mut paired) = Self::split(self.load_pairs().await);
        let mut updated = false;
        for entry in paired.iter_mut() {
            if entry.get("deviceId").and_then(|v| v.as_str()) == Some(device_id)
                && let Some(obj) = entry.as_object_mut()
            {
                obj.insert("displayName".into(), json!(display_name));
                updated = true;
            }
        }
        if updated {
            self.save_pairs(pending, paired).await;
        }
        updated
    }

    pub async fn remove_device(&self, device_id: &str) {
        let (pending, paired) = Self::split(self.load_pairs().await);
        let pending: Vec<Value> = pending
            .into_iter()
            .filter(|row| row.get("deviceId").and_then(|v| v.as_str()) != Some(device_id))
            .collect();
        let paired: Vec<Value> = paired
            .into_iter()
            .filter(|row| row.get("deviceId").and_then(|v| v.as_str()) != Some(device_id))
            .collect();
        self.save_pairs(pending, paired).await;
    }

    /// Rotate a role token: revoke the old digest, issue a fresh token.
    pub async fn rotate_token(
        &self,
        device_id: &str,
        role: &str,
        scopes: Option<Vec<String>>,
        now_ms: u64,
    ) -> Result<Value> {
        let (pending, mut paired) = Self::split(self.load_pairs().await);
        let index = paired
            .iter()
            .position(|entry| entry.get("deviceId").and_then(|v| v.as_str()) == Some(device_id))
            .ok_or(Error::NotPaired)?;
        let token = format!("tok_{}", uuid::Uuid::new_v4().simple());
        let scopes = {
            let Some(obj) = paired[index].as_object_mut() else {
                return Err(Error::NotPaired);
            };
            let mut tokens = obj
                .get("tokens")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            let existing = tokens.get(role).cloned();
            let scopes = scopes
                .or_else(|| {
                    existing.as_ref().and_then(|e| {
                        e.get("scopes").and_then(|v| v.as_array()).map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        })
                    })
                })
                .unwrap_or_else(default_operator_scopes);
            tokens.insert(
                role.to_string(),
                json!({
                    "tokenHash": hash_token(&token),
                    "scopes": scopes.clone(),
                    "createdAtMs": existing
                        .as_ref()
                        .and_then(|e| e.get("createdAtMs"))
                        .cloned()
                        .unwrap_or(json!(now_ms)),
                    "rotatedAtMs": now_ms,
                    "lastUsedAtMs": existing.as_ref().and_then(|e| e.get("lastUsedAtMs")).cloned(),
                    "revokedAtMs": null,
                }),
            );
            obj.insert("tokens".into(), Value::Object(tokens));
            scopes
        };
        self.save_pairs(pending, paired).await;
        Ok(json!({
            "token": token,
            "deviceId": device_id,
            "role": role,
            "scopes": scopes,
        }))
    }

    pub async fn revoke_token(&self, device_id: &str, role: &str, now_ms: u64) {
        let (pending, mut paired) = Self::split(self.load_pairs().await);
        for entry in paired.iter_mut() {
            if entry.get("deviceId").and_then(|v| v.as_str()) != Some(device_id) {
                continue;
            }
            if let Some(record) = entry
                .get_mut("tokens")
                .and_then(|t| t.get_mut(role))
                .and_then(|r| r.as_object_mut())
            {
                record.insert("revokedAtMs".into(), json!(now_ms));
            }
        }
        self.save_pairs(pending, paired).await;
    }

    // ── Node pairing ─────────────────────────────────────────────────────

    /// Submit (or re-read) a node pairing request.
    pub async fn request_node_pair(&self, node_id: &str, params: &Value, now_ms: u64) -> Value {
        let (mut pending, paired) = Self::split(self.load_pairs().await);
        let already_paired = paired
            .iter()
            .any(|row| row.get("deviceId").and_then(|v| v.as_str()) == Some(node_id));
        if already_paired {
            return json!({"status": "paired", "created": false});
        }
        if let Some(existing) = pending
            .iter()
            .find(|row| row.get("deviceId").and_then(|v| v.as_str()) == Some(node_id))
        {
            return json!({"status": "pending", "created": false, "request": existing});
        }
        let request = json!({
            "requestId": format!("npr_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            "deviceId": node_id,
            "displayName": params.get("displayName"),
            "platform": params.get("platform"),
            "version": params.get("version"),
            "deviceFamily": params.get("deviceFamily"),
            "caps": params.get("caps").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            "commands": params.get("commands").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            "permissions": params.get("permissions"),
            "remoteIp": params.get("remoteIp"),
            "roles": ["node"],
            "requestedAtMs": now_ms,
        });
        pending.push(request.clone());
        self.save_pairs(pending, paired).await;
        json!({"status": "pending", "created": true, "request": request})
    }

    /// Pending + paired rows restricted to the node role.
    pub async fn node_pair_list(&self) -> Value {
        let pairs = self.load_pairs().await;
        let role_is_node = |row: &Value| {
            row.get("roles")
                .and_then(|v| v.as_array())
                .map(|r| r.iter().any(|v| v.as_str() == Some("node")))
                .unwrap_or(false)
                || row.get("role").and_then(|v| v.as_str()) == Some("node")
        };
        let pending: Vec<Value> = pairs
            .get("pending")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter(|r| role_is_node(r)).cloned().collect())
            .unwrap_or_default();
        let paired: Vec<Value> = pairs
            .get("paired")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter(|r| role_is_node(r)).cloned().collect())
            .unwrap_or_default();
        json!({"pending": pending, "paired": paired})
    }

    /// Approve a node pairing request; issues and stores the node token
    /// hash in `rpc.node_tokens`.
    pub async fn approve_node(&self, request_id: &str, now_ms: u64) -> Result<Value> {
        let (pending, paired) = Self::split(self.load_pairs().await);
        let mut matched = None;
        let mut left = Vec::with_capacity(pending.len());
        for row in pending {
            if row.get("requestId").and_then(|v| v.as_str()) == Some(request_id) {
                matched = Some(row);
            } else {
                left.push(row);
            }
        }
        let Some(approved) = matched else {
            return Err(Error::UnknownRequest);
        };
        let node_id = approved
            .get("deviceId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let token = format!("node_tok_{}", uuid::Uuid::new_v4().simple());
        let entry = json!({
            "deviceId": node_id.clone(),
            "displayName": approved.get("displayName"),
            "platform": approved.get("platform"),
            "version": approved.get("version"),
            "deviceFamily": approved.get("deviceFamily"),
            "remoteIp": approved.get("remoteIp"),
            "caps": approved.get("caps").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            "commands": approved.get("commands").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
            "permissions": approved.get("permissions"),
            "roles": ["node"],
            "role": "node",
            "scopes": ["operator.read"],
            "approvedAtMs": now_ms,
        });
        let mut paired: Vec<Value> = paired
            .into_iter()
            .filter(|row| row.get("deviceId").and_then(|v| v.as_str()) != Some(node_id.as_str()))
            .collect();
        paired.push(entry.clone());

        let mut tokens = self
            .storage
            .load(slots::NODE_TOKENS, json!({}))
            .await
            .as_object()
            .cloned()
            .unwrap_or_default();
        tokens.insert(
            node_id.clone(),
            json!({"hash": hash_token(&token), "updatedAtMs": now_ms}),
        );
        self.storage
            .save(slots::NODE_TOKENS, &Value::Object(tokens))
            .await;
        self.save_pairs(left, paired).await;
        Ok(json!({"ok": true, "node": entry, "token": token, "nodeId": node_id}))
    }

    pub async fn reject_node(&self, request_id: &str) -> Result<Value> {
        let (pending, paired) = Self::split(self.load_pairs().await);
        let matched = pending
            .iter()
            .find(|row| row.get("requestId").and_then(|v| v.as_str()) == Some(request_id))
            .cloned()
            .ok_or(Error::UnknownRequest)?;
        let left: Vec<Value> = pending
            .into_iter()
            .filter(|row| row.get("requestId").and_then(|v| v.as_str()) != Some(request_id))
            .collect();
        self.save_pairs(left, paired).await;
        Ok(json!({
            "requestId": request_id,
            "nodeId": matched.get("deviceId"),
            "decision": "rejected",
        }))
    }

    /// Constant-time verification of a node token against the stored hash.
    pub async fn verify_node_token(&self, node_id: &str, token: &str) -> bool {
        let tokens = self.storage.load(slots::NODE_TOKENS, json!({})).await;
        let Some(record) = tokens.get(node_id) else {
            return false;
        };
        let stored = record.get("hash").and_then(|v| v.as_str()).unwrap_or("");
        !stored.is_empty() && digest_eq(stored, &hash_token(token))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tether_storage::MemorySlotStore;

    fn store() -> PairingStore {
        PairingStore::new(Arc::new(MemorySlotStore::new()))
    }

    #[tokio::test]
    async fn device_pair_flow_issues_usable_token() {
        let pairing = store();
        let (request, created) = pairing
            .request_device_pair("dev-1", Some("Laptop"), Some("macos"), 1)
            .await;
        assert!(created);
        let request_id = request["requestId"].as_str().unwrap().to_string();
        let approved = pairing.approve_device(&request_id, 2).await.unwrap();
        let token = approved["token"].as_str().unwrap();
        let (role, scopes) = pairing.verify_device_token("dev-1", token).await.unwrap();
        assert_eq!(role, "operator");
        assert!(scopes.iter().any(|s| s == "operator.admin"));
        assert!(pairing.verify_device_token("dev-1", "wrong").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_pair_request_returns_existing() {
        let pairing = store();
        let (first, created) = pairing.request_device_pair("dev-1", None, None, 1).await;
        assert!(created);
        let (second, created) = pairing.request_device_pair("dev-1", None, None, 2).await;
        assert!(!created);
        assert_eq!(first["requestId"], second["requestId"]);
    }

    #[tokio::test]
    async fn rotate_invalidates_old_token() {
        let pairing = store();
        let (request, _) = pairing.request_device_pair("dev-1", None, None, 1).await;
        let approved = pairing
            .approve_device(request["requestId"].as_str().unwrap(), 2)
            .await
            .unwrap();
        let old_token = approved["token"].as_str().unwrap().to_string();
        let rotated = pairing
            .rotate_token("dev-1", "operator", None, 3)
            .await
            .unwrap();
        let new_token = rotated["token"].as_str().unwrap();
        assert!(pairing.verify_device_token("dev-1", &old_token).await.is_none());
        assert!(pairing.verify_device_token("dev-1", new_token).await.is_some());
    }

    #[tokio::test]
    async fn revoke_disables_token() {
        let pairing = store();
        let (request, _) = pairing.request_device_pair("dev-1", None, None, 1).await;
        let approved = pairing
            .approve_device(request["requestId"].as_str().unwrap(), 2)
            .await
            .unwrap();
        let token = approved["token"].as_str().unwrap().to_string();
        pairing.revoke_token("dev-1", "operator", 3).await;
        assert!(pairing.verify_device_token("dev-1", &token).await.is_none());
    }

    #[tokio::test]
    async fn node_pair_flow() {
        let pairing = store();
        let result = pairing
            .request_node_pair(
                "mac-1",
                &json!({"platform": "macos", "commands": ["system.run"]}),
                1,
            )
            .await;
        assert_eq!(result["status"], json!("pending"));
        let request_id = result["request"]["requestId"].as_str().unwrap().to_string();
        let approved = pairing.approve_node(&request_id, 2).await.unwrap();
        let token = approved["token"].as_str().unwrap();
        assert!(pairing.verify_node_token("mac-1", token).await);
        assert!(!pairing.verify_node_token("mac-1", "bad").await);
        assert!(pairing.is_paired_node("mac-1").await);
        // Re-request after pairing reports paired.
        let again = pairing.request_node_pair("mac-1", &json!({}), 3).await;
        assert_eq!(again["status"], json!("paired"));
    }

    #[tokio::test]
    async fn reject_node_requires_known_request() {
        let pairing = store();
        assert!(matches!(
            pairing.reject_node("nope").await,
            Err(Error::UnknownRequest)
        ));
    }

    #[tokio::test]
    async fn remove_device_clears_both_lists() {
        let pairing = store();
        let (request, _) = pairing.request_device_pair("dev-1", None, None, 1).await;
        pairing
            .approve_device(request["requestId"].as_str().unwrap(), 2)
            .await;
        pairing.remove_device("dev-1").await;
        assert!(pairing.paired_device("dev-1").await.is_none());
    }
}
