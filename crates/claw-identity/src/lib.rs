//! User identity store: scrypt password hashing and channel-id mapping.
//!
//! Holds the set of users, verifies credentials, and resolves external
//! channel identities (Telegram, Discord, ...) to a local user id.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use scrypt::Params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// scrypt N parameter, expressed as log2(N); N = 2^14.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_DK_LEN: usize = 64;
const SALT_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("username already exists: {0}")]
    AlreadyExists(String),
    #[error("password hashing failed: {0}")]
    HashingFailed(String),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// A registered user. `password_hash` and `salt` are never exposed through
/// `Debug` or logging — only through explicit accessors used by
/// [`IdentityStore::authenticate`].
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role_name: String,
    password_hash: String,
    salt: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    /// `channel name -> external id` owned by this user.
    pub channels: HashMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("role_name", &self.role_name)
            .field("password_hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("last_login", &self.last_login)
            .field("channels", &self.channels)
            .finish()
    }
}

fn hash_password(password: &str, salt: &[u8]) -> Result<String> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_DK_LEN)
        .map_err(|e| IdentityError::HashingFailed(e.to_string()))?;
    let mut out = [0u8; SCRYPT_DK_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut out)
        .map_err(|e| IdentityError::HashingFailed(e.to_string()))?;
    Ok(hex::encode(out))
}

/// Constant-time byte comparison; does not short-circuit on first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// In-memory, `JsonStore`-backed registry of users.
pub struct IdentityStore {
    users: RwLock<HashMap<String, User>>,
    store: JsonStore,
}

impl IdentityStore {
    pub fn open(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "identity_users");
        let users: HashMap<String, User> = store.load();
        info!(user_count = users.len(), "identity store opened");
        Self {
            users: RwLock::new(users),
            store,
        }
    }

    fn snapshot(&self, users: &HashMap<String, User>) {
        if let Err(e) = self.store.save(users) {
            warn!(error = %e, "failed to snapshot identity store");
        }
    }

    /// Create a new user. `role_exists` is supplied by the caller (the role
    /// registry is a separate component; identity does not hold role data).
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role_name: &str,
        role_exists: bool,
    ) -> Result<User> {
        if !role_exists {
            return Err(IdentityError::NotFound(format!("role {role_name}")));
        }

        let mut users = self.users.write();
        if users.values().any(|u| u.username == username) {
            return Err(IdentityError::AlreadyExists(username.to_string()));
        }

        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let salt_hex = hex::encode(salt);
        let password_hash = hash_password(password, &salt)?;

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            role_name: role_name.to_string(),
            password_hash,
            salt: salt_hex,
            active: true,
            created_at: Utc::now(),
            last_login: None,
            channels: HashMap::new(),
            metadata: serde_json::Value::Null,
        };

        info!(user_id = %user.id, username = %username, "user created");
        users.insert(user.id.to_string(), user.clone());
        self.snapshot(&users);
        Ok(user)
    }

    /// Authenticate by username and password. Returns `None` for any
    /// failure mode (unknown user, wrong password, inactive user) — callers
    /// cannot distinguish them.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        let found = {
            let users = self.users.read();
            users.values().find(|u| u.username == username).cloned()
        };

        let Some(user) = found else {
            return None;
        };

        let salt = match hex::decode(&user.salt) {
            Ok(s) => s,
            Err(_) => return None,
        };
        let computed = match hash_password(password, &salt) {
            Ok(h) => h,
            Err(_) => return None,
        };
        let matches = constant_time_eq(computed.as_bytes(), user.password_hash.as_bytes());

        if !matches || !user.active {
            return None;
        }

        let mut users = self.users.write();
        if let Some(stored) = users.get_mut(&user.id.to_string()) {
            stored.last_login = Some(Utc::now());
        }
        let updated = users.get(&user.id.to_string()).cloned();
        self.snapshot(&users);
        updated
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<User> {
        self.users.read().get(&id.to_string()).cloned()
    }

    pub fn get_by_username(&self, username: &str) -> Option<User> {
        self.users
            .read()
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    /// Resolve `"<channel>:<external_id>"` to a user.
    pub fn get_by_channel(&self, channel: &str, external_id: &str) -> Option<User> {
        self.users
            .read()
            .values()
            .find(|u| u.channels.get(channel).map(|e| e.as_str()) == Some(external_id))
            .cloned()
    }

    /// Link a channel identity to a user. Overwrites any existing mapping
    /// for that user's channel entry (last linker wins); re-linking a
    /// channel id already owned by a different user silently moves it —
    /// callers that need an audit trail of this must log it themselves.
    pub fn link_channel(&self, user_id: Uuid, channel: &str, external_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id.to_string())
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))?;
        user.channels
            .insert(channel.to_string(), external_id.to_string());
        self.snapshot(&users);
        Ok(())
    }

    pub fn list(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    pub fn update_role(&self, user_id: Uuid, role_name: &str, role_exists: bool) -> Result<()> {
        if !role_exists {
            return Err(IdentityError::NotFound(format!("role {role_name}")));
        }
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id.to_string())
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))?;
        user.role_name = role_name.to_string();
        self.snapshot(&users);
        Ok(())
    }

    pub fn deactivate(&self, user_id: Uuid) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id.to_string())
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))?;
        user.active = false;
        self.snapshot(&users);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, IdentityStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = IdentityStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn create_and_authenticate() {
        let (_dir, store) = store();
        store
            .create_user("alice", "alice@example.com", "hunter2", "user", true)
            .expect("create");

        let authed = store.authenticate("alice", "hunter2");
        assert!(authed.is_some());
        assert_eq!(authed.unwrap().username, "alice");
    }

    #[test]
    fn wrong_password_returns_none() {
        let (_dir, store) = store();
        store
            .create_user("bob", "bob@example.com", "correct-horse", "user", true)
            .unwrap();
        assert!(store.authenticate("bob", "wrong").is_none());
    }

    #[test]
    fn unknown_user_returns_none() {
        let (_dir, store) = store();
        assert!(store.authenticate("nobody", "whatever").is_none());
    }

    #[test]
    fn deactivated_user_cannot_authenticate() {
        let (_dir, store) = store();
        let user = store
            .create_user("carol", "carol@example.com", "pw", "user", true)
            .unwrap();
        store.deactivate(user.id).unwrap();
        assert!(store.authenticate("carol", "pw").is_none());
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, store) = store();
        store
            .create_user("dave", "d1@example.com", "pw", "user", true)
            .unwrap();
        let result = store.create_user("dave", "d2@example.com", "pw2", "user", true);
        assert!(matches!(result, Err(IdentityError::AlreadyExists(_))));
    }

    #[test]
    fn unknown_role_rejected() {
        let (_dir, store) = store();
        let result = store.create_user("erin", "e@example.com", "pw", "ghost", false);
        assert!(matches!(result, Err(IdentityError::NotFound(_))));
    }

    #[test]
    fn channel_link_and_lookup() {
        let (_dir, store) = store();
        let user = store
            .create_user("frank", "f@example.com", "pw", "user", true)
            .unwrap();
        store.link_channel(user.id, "telegram", "tg-123").unwrap();

        let found = store.get_by_channel("telegram", "tg-123").unwrap();
        assert_eq!(found.id, user.id);
    }

    #[test]
    fn relinking_channel_moves_ownership() {
        let (_dir, store) = store();
        let u1 = store
            .create_user("gina", "g@example.com", "pw", "user", true)
            .unwrap();
        let u2 = store
            .create_user("hank", "h@example.com", "pw", "user", true)
            .unwrap();
        store.link_channel(u1.id, "discord", "d-1").unwrap();
        store.link_channel(u2.id, "discord", "d-1").unwrap();

        // u1's channel map still holds the stale entry; lookup by the
        // external id now resolves to u2, the last linker.
        let found = store.get_by_channel("discord", "d-1").unwrap();
        assert_eq!(found.id, u2.id);
    }

    #[test]
    fn password_hash_not_in_debug_output() {
        let (_dir, store) = store();
        let user = store
            .create_user("iris", "i@example.com", "super-secret", "user", true)
            .unwrap();
        let debug_str = format!("{user:?}");
        assert!(!debug_str.contains("super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }
}
