//! Credential store
//!
//! Stored accounts live under `accounts/`:
//!
//! ```text
//! accounts/accounts.json        index + active pointer
//! accounts/<accountId>/auth.json
//! ```
//!
//! The active account is materialized into the host credential home (the
//! directory mounted into the agent container). A marker file there names
//! the account it came from, so refreshed tokens are only ever synced back
//! onto the account that was actually applied.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use yard_foundation::{Error, JsonStore, Result};

pub const ACCOUNTS_INDEX_FILE: &str = "accounts.json";
pub const AUTH_FILE: &str = "auth.json";

/// Names the account currently materialized in the host credential home
pub const ACCOUNT_MARKER_FILE: &str = ".yard-account";

/// Stored credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// `accounts.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_account_id: Option<String>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl AccountIndex {
    pub fn active(&self) -> Option<&Account> {
        let id = self.active_account_id.as_deref()?;
        self.accounts.iter().find(|a| a.id == id)
    }
}

/// Credential operations the engine consumes
pub trait CredentialStore: Send + Sync {
    fn active_account(&self) -> Result<Option<Account>>;

    /// Advance the active pointer round-robin; returns the new active account
    fn rotate_active_account(&self) -> Result<Option<Account>>;

    fn count_accounts(&self) -> Result<usize>;

    /// Materialize the active credential into the host credential home
    fn apply_active_account(&self) -> Result<Option<Account>>;

    /// Persist refreshed token material from the host home back onto
    /// `account_id`; `Ok(false)` when nothing was written
    fn sync_account_from_host(&self, account_id: &str) -> Result<bool>;

    /// Host directory mounted as the agent's credential home
    fn credential_home(&self) -> PathBuf;
}

/// File-backed store
pub struct FileCredentialStore {
    store: JsonStore,
    host_home: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(accounts_dir: impl Into<PathBuf>, host_home: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(accounts_dir.into()),
            host_home: host_home.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_index(&self) -> Result<AccountIndex> {
        Ok(self
            .store
            .load_optional::<AccountIndex>(ACCOUNTS_INDEX_FILE)?
            .unwrap_or_default())
    }

    pub fn account_dir(&self, account_id: &str) -> PathBuf {
        self.store.base_dir().join(account_id)
    }

    pub fn account_auth_path(&self, account_id: &str) -> PathBuf {
        self.account_dir(account_id).join(AUTH_FILE)
    }

    pub fn list(&self) -> Result<Vec<Account>> {
        let _guard = self.lock.lock();
        Ok(self.load_index()?.accounts)
    }

    /// Manual switch of the active pointer
    pub fn activate(&self, account_id: &str) -> Result<Account> {
        let _guard = self.lock.lock();
        let mut index = self.load_index()?;
        let account = index
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Account {}", account_id)))?;
        index.active_account_id = Some(account.id.clone());
        self.store.save(ACCOUNTS_INDEX_FILE, &index)?;
        info!(account = %account.id, "Activated account");
        Ok(account)
    }

    /// Account currently materialized in the host home, per its marker
    pub fn applied_account_id(&self) -> Option<String> {
        std::fs::read_to_string(self.host_home.join(ACCOUNT_MARKER_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl CredentialStore for FileCredentialStore {
    fn active_account(&self) -> Result<Option<Account>> {
        let _guard = self.lock.lock();
        Ok(self.load_index()?.active().cloned())
    }

    fn rotate_active_account(&self) -> Result<Option<Account>> {
        let _guard = self.lock.lock();
        let mut index = self.load_index()?;
        if index.accounts.is_empty() {
            return Ok(None);
        }
        let next = match index
            .active_account_id
            .as_deref()
            .and_then(|id| index.accounts.iter().position(|a| a.id == id))
        {
            Some(pos) => (pos + 1) % index.accounts.len(),
            None => 0,
        };
        let account = index.accounts[next].clone();
        index.active_account_id = Some(account.id.clone());
        self.store.save(ACCOUNTS_INDEX_FILE, &index)?;
        info!(account = %account.id, "Rotated active account");
        Ok(Some(account))
    }

    fn count_accounts(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        Ok(self.load_index()?.accounts.len())
    }

    fn apply_active_account(&self) -> Result<Option<Account>> {
        let _guard = self.lock.lock();
        let Some(account) = self.load_index()?.active().cloned() else {
            return Ok(None);
        };
        let source = self.account_auth_path(&account.id);
        let content = std::fs::read(&source).map_err(|e| {
            Error::Storage(format!("Failed to read {}: {}", source.display(), e))
        })?;

        std::fs::create_dir_all(&self.host_home)?;
        write_atomic(&self.host_home.join(AUTH_FILE), &content)?;
        write_atomic(
            &self.host_home.join(ACCOUNT_MARKER_FILE),
            account.id.as_bytes(),
        )?;
        debug!(account = %account.id, home = %self.host_home.display(), "Applied account");
        Ok(Some(account))
    }

    fn sync_account_from_host(&self, account_id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        if self.applied_account_id().as_deref() != Some(account_id) {
            debug!(account = account_id, "Host credential belongs to another account; skipping sync");
            return Ok(false);
        }
        let host_auth = match std::fs::read(self.host_home.join(AUTH_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let target = self.account_auth_path(account_id);
        if !self.account_dir(account_id).is_dir() {
            return Err(Error::not_found(format!("Account {}", account_id)));
        }
        if std::fs::read(&target).ok().as_deref() == Some(host_auth.as_slice()) {
            return Ok(false);
        }
        write_atomic(&target, &host_auth)?;
        info!(account = account_id, "Synced refreshed credential from host");
        Ok(true)
    }

    fn credential_home(&self) -> PathBuf {
        self.host_home.clone()
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(ids: &[&str]) -> (tempfile::TempDir, FileCredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let accounts_dir = dir.path().join("accounts");
        let index = AccountIndex {
            active_account_id: ids.first().map(|s| s.to_string()),
            accounts: ids
                .iter()
                .map(|id| Account {
                    id: id.to_string(),
                    label: format!("{} label", id),
                    created_at: None,
                })
                .collect(),
        };
        JsonStore::new(&accounts_dir)
            .save(ACCOUNTS_INDEX_FILE, &index)
            .unwrap();
        for id in ids {
            std::fs::create_dir_all(accounts_dir.join(id)).unwrap();
            std::fs::write(accounts_dir.join(id).join(AUTH_FILE), format!("{{\"token\":\"{}\"}}", id))
                .unwrap();
        }
        let store = FileCredentialStore::new(&accounts_dir, dir.path().join("host-home"));
        (dir, store)
    }

    #[test]
    fn test_rotation_is_round_robin() {
        let (_dir, store) = seeded(&["a", "b", "c"]);
        assert_eq!(store.count_accounts().unwrap(), 3);
        assert_eq!(store.rotate_active_account().unwrap().unwrap().id, "b");
        assert_eq!(store.rotate_active_account().unwrap().unwrap().id, "c");
        assert_eq!(store.rotate_active_account().unwrap().unwrap().id, "a");
    }

    #[test]
    fn test_apply_writes_marker() {
        let (_dir, store) = seeded(&["a", "b"]);
        let applied = store.apply_active_account().unwrap().unwrap();
        assert_eq!(applied.id, "a");
        assert_eq!(store.applied_account_id().as_deref(), Some("a"));
        let host = std::fs::read_to_string(store.credential_home().join(AUTH_FILE)).unwrap();
        assert_eq!(host, "{\"token\":\"a\"}");
    }

    #[test]
    fn test_sync_targets_only_the_applied_account() {
        let (_dir, store) = seeded(&["a", "b"]);
        store.apply_active_account().unwrap();
        std::fs::write(store.credential_home().join(AUTH_FILE), "{\"token\":\"a2\"}").unwrap();

        assert!(!store.sync_account_from_host("b").unwrap());
        assert_eq!(
            std::fs::read_to_string(store.account_auth_path("b")).unwrap(),
            "{\"token\":\"b\"}"
        );

        assert!(store.sync_account_from_host("a").unwrap());
        assert_eq!(
            std::fs::read_to_string(store.account_auth_path("a")).unwrap(),
            "{\"token\":\"a2\"}"
        );
        assert!(!store.sync_account_from_host("a").unwrap());
    }

    #[test]
    fn test_activate_unknown_account() {
        let (_dir, store) = seeded(&["a"]);
        assert!(matches!(store.activate("zzz"), Err(Error::NotFound(_))));
        assert_eq!(store.activate("a").unwrap().id, "a");
    }

    #[test]
    fn test_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("accounts"), dir.path().join("home"));
        assert_eq!(store.count_accounts().unwrap(), 0);
        assert!(store.active_account().unwrap().is_none());
        assert!(store.apply_active_account().unwrap().is_none());
        assert!(store.rotate_active_account().unwrap().is_none());
    }
}
