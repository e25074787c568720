//! Opaque API key issuance, hashed storage, expiry, and revocation.
//!
//! A raw token is returned exactly once, at issuance. Afterward only its
//! SHA-256 hash is stored; validation hashes the presented token and looks
//! up by hash equality.

#![forbid(unsafe_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const TOKEN_PREFIX: &str = "sk_";
const TOKEN_RANDOM_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("api key not found")]
    NotFound,
    #[error("api key expired")]
    Expired,
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Stored metadata for an issued API key. Never carries the raw token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Registry of opaque API keys, keyed internally by token hash.
pub struct ApiKeyStore {
    // key_id -> record
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    store: JsonStore,
}

impl ApiKeyStore {
    pub fn open(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "api_keys");
        let keys: HashMap<String, ApiKeyRecord> = store.load();
        info!(key_count = keys.len(), "api key store opened");
        Self {
            keys: RwLock::new(keys),
            store,
        }
    }

    fn snapshot(&self, keys: &HashMap<String, ApiKeyRecord>) {
        if let Err(e) = self.store.save(keys) {
            warn!(error = %e, "failed to snapshot api key store");
        }
    }

    /// Issue a new key. Returns the raw token (shown only this once) and its
    /// metadata record. `ttl_days = 0` issues a key that is already expired.
    pub fn generate(&self, user_id: Uuid, name: &str, ttl_days: i64) -> (String, ApiKeyRecord) {
        let mut random = [0u8; TOKEN_RANDOM_BYTES];
        OsRng.fill_bytes(&mut random);
        let raw_token = format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(random));
        let token_hash = sha256_hex(&raw_token);

        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::days(ttl_days);

        let record = ApiKeyRecord {
            key_id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            token_hash,
            created_at,
            expires_at,
            last_used: None,
        };

        let mut keys = self.keys.write();
        keys.insert(record.key_id.to_string(), record.clone());
        self.snapshot(&keys);
        info!(key_id = %record.key_id, user_id = %user_id, "api key issued");

        (raw_token, record)
    }

    /// Validate a raw token. Returns `None` if absent or expired.
    pub fn validate(&self, raw_token: &str) -> Option<ApiKeyRecord> {
        let hash = sha256_hex(raw_token);
        let mut keys = self.keys.write();
        let key_id = keys
            .values()
            .find(|k| k.token_hash == hash)
            .map(|k| k.key_id.to_string())?;

        let record = keys.get(&key_id)?;
        if Utc::now() >= record.expires_at {
            return None;
        }

        let updated = {
            let record = keys.get_mut(&key_id)?;
            record.last_used = Some(Utc::now());
            record.clone()
        };
        self.snapshot(&keys);
        Some(updated)
    }

    /// Revoke a key by raw token. Idempotent — returns `true` only if a key
    /// was actually removed.
    pub fn revoke(&self, raw_token: &str) -> bool {
        let hash = sha256_hex(raw_token);
        let mut keys = self.keys.write();
        let key_id = keys
            .values()
            .find(|k| k.token_hash == hash)
            .map(|k| k.key_id.to_string());

        match key_id {
            Some(id) => {
                keys.remove(&id);
                self.snapshot(&keys);
                true
            }
            None => false,
        }
    }

    /// List metadata for a user's keys. Never exposes the raw token or hash.
    pub fn list(&self, user_id: Uuid) -> Vec<ApiKeyRecord> {
        self.keys
            .read()
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ApiKeyStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ApiKeyStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn generate_and_validate_round_trip() {
        let (_dir, store) = store();
        let user_id = Uuid::new_v4();
        let (raw, record) = store.generate(user_id, "ci key", 365);
        assert!(raw.starts_with("sk_"));

        let validated = store.validate(&raw).expect("valid");
        assert_eq!(validated.key_id, record.key_id);
    }

    #[test]
    fn ttl_zero_is_immediately_expired() {
        let (_dir, store) = store();
        let (raw, _) = store.generate(Uuid::new_v4(), "short lived", 0);
        assert!(store.validate(&raw).is_none());
    }

    #[test]
    fn revoke_invalidates_key() {
        let (_dir, store) = store();
        let (raw, _) = store.generate(Uuid::new_v4(), "revocable", 30);
        assert!(store.revoke(&raw));
        assert!(store.validate(&raw).is_none());
    }

    #[test]
    fn revoke_is_idempotent() {
        let (_dir, store) = store();
        let (raw, _) = store.generate(Uuid::new_v4(), "once", 30);
        assert!(store.revoke(&raw));
        assert!(!store.revoke(&raw));
    }

    #[test]
    fn unknown_token_does_not_validate() {
        let (_dir, store) = store();
        assert!(store.validate("sk_not-a-real-token").is_none());
    }

    #[test]
    fn list_never_exposes_raw_token() {
        let (_dir, store) = store();
        let user_id = Uuid::new_v4();
        let (raw, _) = store.generate(user_id, "listed", 30);
        let keys = store.list(user_id);
        assert_eq!(keys.len(), 1);
        let serialized = serde_json::to_string(&keys[0]).unwrap();
        assert!(!serialized.contains(&raw));
    }
}
