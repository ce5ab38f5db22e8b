//!
//! confide user store
//! ------------------
//! This module implements the durable user store for confide. Records live in
//! memory behind a mutex and every mutation is written through to a single
//! `users.json` snapshot under the configured root folder before the call
//! returns. Lookups go through two indexes: username for local accounts and
//! (provider, subject id) for federated accounts.
//!
//! Key responsibilities:
//! - Registration with a unique-username constraint.
//! - Federated identity linking with insert-if-absent semantics, so repeated
//!   callbacks for one provider subject always resolve to one record.
//! - Appending user secrets and serving the public secrets wall.
//!
//! The public API centers around the `UserStore` type, which is usually
//! wrapped in a thread-safe `SharedUserStore` (`Arc<Mutex<UserStore>>`)
//! elsewhere in the codebase.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;

/// Third-party identity providers supported for federated sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Github,
    Twitter,
    Facebook,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Github => "github",
            Provider::Twitter => "twitter",
            Provider::Facebook => "facebook",
        }
    }

    pub const ALL: [Provider; 4] = [Provider::Google, Provider::Github, Provider::Twitter, Provider::Facebook];
}

impl FromStr for Provider {
    type Err = AppError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(Provider::Google),
            "github" => Ok(Provider::Github),
            "twitter" => Ok(Provider::Twitter),
            "facebook" => Ok(Provider::Facebook),
            other => Err(AppError::not_found("unknown_provider", other)),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored credential material. The active encoding is a deployment-wide
/// choice; a single store only ever holds one variant for local accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialMaterial {
    Plaintext { secret: String },
    /// AES-256-GCM ciphertext and nonce, both base64.
    Encrypted { ciphertext: String, nonce: String },
    /// Argon2id hash in PHC string format (salt and parameters embedded).
    Hashed { phc: String },
}

/// One user account: local (username + credential), federated (provider
/// subject ids), or both once identities are linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<CredentialMaterial>,
    /// Provider name -> provider-assigned subject id. Written at most once
    /// per pair; repeated federated logins resolve to the same record.
    #[serde(default)]
    pub provider_ids: BTreeMap<Provider, String>,
    /// Free-text secrets contributed after authentication, in insert order.
    #[serde(default)]
    pub secrets: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("no matching user")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateIdentity(who) => AppError::conflict("duplicate_identity".to_string(), format!("username already taken: {}", who)),
            StoreError::NotFound => AppError::not_found("user_not_found", "no matching user"),
            StoreError::Unavailable(msg) => AppError::store("store_unavailable".to_string(), msg),
        }
    }
}

/// On-disk snapshot shape. Kept as a bare record list so the file stays
/// hand-inspectable.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    users: Vec<UserRecord>,
}

/// Durable user store rooted at a filesystem folder.
pub struct UserStore {
    root: PathBuf,
    records: HashMap<Uuid, UserRecord>,
    by_username: HashMap<String, Uuid>,
    by_subject: HashMap<(Provider, String), Uuid>,
}

impl UserStore {
    /// Open (or initialize) a store rooted at the given folder. An existing
    /// `users.json` snapshot is loaded and indexed.
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let mut store = Self {
            root,
            records: HashMap::new(),
            by_username: HashMap::new(),
            by_subject: HashMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("users.json")
    }

    fn load(&mut self) -> anyhow::Result<()> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path)?;
        let snap: Snapshot = serde_json::from_slice(&bytes)?;
        for rec in snap.users {
            if let Some(name) = rec.username.clone() {
                self.by_username.insert(name, rec.id);
            }
            for (prov, subject) in rec.provider_ids.iter() {
                self.by_subject.insert((*prov, subject.clone()), rec.id);
            }
            self.records.insert(rec.id, rec);
        }
        debug!(target: "confide::store", "loaded {} user record(s) from {}", self.records.len(), path.display());
        Ok(())
    }

    /// Write the full snapshot to disk. Called after every mutation so the
    /// change is durable before the mutating call returns.
    fn persist(&self) -> Result<(), StoreError> {
        let mut users: Vec<UserRecord> = self.records.values().cloned().collect();
        users.sort_by_key(|r| (r.created_at, r.id));
        let snap = Snapshot { users };
        let bytes = serde_json::to_vec_pretty(&snap)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        fs::write(self.snapshot_path(), bytes)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Create a local account. The username must be unused.
    pub fn create_user(&mut self, username: &str, credential: CredentialMaterial) -> Result<UserRecord, StoreError> {
        if self.by_username.contains_key(username) {
            return Err(StoreError::DuplicateIdentity(username.to_string()));
        }
        let now = Utc::now().timestamp_millis();
        let rec = UserRecord {
            id: Uuid::new_v4(),
            username: Some(username.to_string()),
            credential: Some(credential),
            provider_ids: BTreeMap::new(),
            secrets: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.by_username.insert(username.to_string(), rec.id);
        self.records.insert(rec.id, rec.clone());
        self.persist()?;
        debug!(target: "confide::store", "created local user '{}' id={}", username, rec.id);
        Ok(rec)
    }

    pub fn find_by_username(&self, username: &str) -> Result<UserRecord, StoreError> {
        self.by_username
            .get(username)
            .and_then(|id| self.records.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn find_by_provider_id(&self, provider: Provider, subject: &str) -> Result<UserRecord, StoreError> {
        self.by_subject
            .get(&(provider, subject.to_string()))
            .and_then(|id| self.records.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Insert-if-absent on the (provider, subject) key. Callers racing on the
    /// same subject all resolve to the record the first one created; the
    /// store mutex makes the check-then-insert atomic.
    pub fn find_or_create_by_provider_id(&mut self, provider: Provider, subject: &str) -> Result<UserRecord, StoreError> {
        if let Ok(existing) = self.find_by_provider_id(provider, subject) {
            return Ok(existing);
        }
        let now = Utc::now().timestamp_millis();
        let mut provider_ids = BTreeMap::new();
        provider_ids.insert(provider, subject.to_string());
        let rec = UserRecord {
            id: Uuid::new_v4(),
            username: None,
            credential: None,
            provider_ids,
            secrets: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.by_subject.insert((provider, subject.to_string()), rec.id);
        self.records.insert(rec.id, rec.clone());
        self.persist()?;
        debug!(target: "confide::store", "created federated user {}:{} id={}", provider, subject, rec.id);
        Ok(rec)
    }

    pub fn append_secret(&mut self, user_id: Uuid, text: &str) -> Result<(), StoreError> {
        let rec = self.records.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        rec.secrets.push(text.to_string());
        rec.updated_at = Utc::now().timestamp_millis();
        self.persist()
    }

    pub fn get(&self, user_id: Uuid) -> Option<UserRecord> {
        self.records.get(&user_id).cloned()
    }

    /// All secrets across users, oldest account first. Users with an empty
    /// secrets list do not appear on the wall.
    pub fn secrets_wall(&self) -> Vec<String> {
        let mut users: Vec<&UserRecord> = self.records.values().filter(|r| !r.secrets.is_empty()).collect();
        users.sort_by_key(|r| (r.created_at, r.id));
        users.iter().flat_map(|r| r.secrets.iter().cloned()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.records.len()
    }
}

/// Thread-safe handle shared across request handlers.
#[derive(Clone)]
pub struct SharedUserStore(pub Arc<Mutex<UserStore>>);

impl SharedUserStore {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(UserStore::new(root)?))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plain(secret: &str) -> CredentialMaterial {
        CredentialMaterial::Plaintext { secret: secret.to_string() }
    }

    #[test]
    fn create_then_find_roundtrip() {
        let tmp = tempdir().unwrap();
        let mut store = UserStore::new(tmp.path()).unwrap();
        let rec = store.create_user("alice", plain("secret1")).unwrap();
        let found = store.find_by_username("alice").unwrap();
        assert_eq!(found.id, rec.id);
        assert_eq!(found.credential, Some(plain("secret1")));
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let tmp = tempdir().unwrap();
        let mut store = UserStore::new(tmp.path()).unwrap();
        store.create_user("alice", plain("a")).unwrap();
        let err = store.create_user("alice", plain("b")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(_)));
    }

    #[test]
    fn unknown_username_is_not_found() {
        let tmp = tempdir().unwrap();
        let store = UserStore::new(tmp.path()).unwrap();
        assert!(matches!(store.find_by_username("bob"), Err(StoreError::NotFound)));
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let tmp = tempdir().unwrap();
        let mut store = UserStore::new(tmp.path()).unwrap();
        let first = store.find_or_create_by_provider_id(Provider::Google, "g-123").unwrap();
        let second = store.find_or_create_by_provider_id(Provider::Google, "g-123").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.user_count(), 1);
        // Same subject under a different provider is a different identity
        let other = store.find_or_create_by_provider_id(Provider::Github, "g-123").unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(store.user_count(), 2);
    }

    #[test]
    fn append_secret_and_wall() {
        let tmp = tempdir().unwrap();
        let mut store = UserStore::new(tmp.path()).unwrap();
        let alice = store.create_user("alice", plain("pw")).unwrap();
        store.create_user("quiet", plain("pw")).unwrap();
        store.append_secret(alice.id, "i sing in the shower").unwrap();
        store.append_secret(alice.id, "i skip standup").unwrap();
        let wall = store.secrets_wall();
        assert_eq!(wall, vec!["i sing in the shower".to_string(), "i skip standup".to_string()]);
        // Appending to a vanished user reports NotFound
        assert!(matches!(store.append_secret(Uuid::new_v4(), "x"), Err(StoreError::NotFound)));
    }

    #[test]
    fn mutations_survive_reopen() {
        let tmp = tempdir().unwrap();
        let alice_id;
        {
            let mut store = UserStore::new(tmp.path()).unwrap();
            let alice = store.create_user("alice", plain("pw")).unwrap();
            alice_id = alice.id;
            store.append_secret(alice.id, "persisted").unwrap();
            store.find_or_create_by_provider_id(Provider::Facebook, "fb-9").unwrap();
        }
        let store = UserStore::new(tmp.path()).unwrap();
        assert_eq!(store.user_count(), 2);
        let alice = store.find_by_username("alice").unwrap();
        assert_eq!(alice.id, alice_id);
        assert_eq!(alice.secrets, vec!["persisted".to_string()]);
        assert!(store.find_by_provider_id(Provider::Facebook, "fb-9").is_ok());
    }
}
