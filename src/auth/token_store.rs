//! OIDC token cache
//!
//! Persists one [`TokenRecord`] per client id in a single JSON file
//! (`~/.muon/auth_tokens` by default). Saving merges by key, so records of
//! other clients are left untouched. There is no file locking: concurrent
//! invocations race and the last writer wins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use crate::Result;

/// Seconds subtracted from every expiry at write time to absorb clock skew
/// and the latency of the token request itself.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 5;

/// Current time as epoch seconds
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Cached OIDC tokens for one client
///
/// Both expiries are absolute epoch seconds with the safety margin already
/// applied. The field names match the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: String,

    /// Absolute expiry of the access token
    pub expires_in: i64,

    /// Absolute expiry of the refresh token
    #[serde(default)]
    pub refresh_expires_in: i64,
}

impl TokenRecord {
    /// Build a record from relative lifetimes reported by the token endpoint
    pub fn from_lifetimes(
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
        refresh_expires_in_secs: i64,
        now: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in: now + expires_in_secs - EXPIRY_SAFETY_MARGIN_SECS,
            refresh_expires_in: now + refresh_expires_in_secs - EXPIRY_SAFETY_MARGIN_SECS,
        }
    }

    pub fn is_access_expired(&self, now: i64) -> bool {
        self.expires_in < now
    }

    /// Whether the refresh token outlives `now` by more than `buffer_secs`
    pub fn can_refresh(&self, now: i64, buffer_secs: i64) -> bool {
        !self.refresh_token.is_empty() && self.refresh_expires_in > now + buffer_secs
    }
}

/// File-backed token cache keyed by client id
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location under the muon config directory
    pub fn default_location() -> Self {
        Self::new(crate::config::token_cache_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record for `client_id`
    ///
    /// A missing file, a malformed file, or an entry that does not look
    /// like a token record all yield `None`.
    pub fn load(&self, client_id: &str) -> Result<Option<TokenRecord>> {
        let entries = self.read_entries()?;
        let record = entries
            .get(client_id)
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        Ok(record)
    }

    /// Save `record` under `client_id`, preserving all other entries
    pub fn save(&self, client_id: &str, record: &TokenRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = self.read_entries()?;
        entries.insert(client_id.to_string(), serde_json::to_value(record)?);

        let content = serde_json::to_string_pretty(&Value::Object(entries))?;
        std::fs::write(&self.path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }

        tracing::debug!("Saved tokens for {} to {:?}", client_id, self.path);
        Ok(())
    }

    fn read_entries(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let bytes = std::fs::read(&self.path)?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                tracing::warn!("Ignoring malformed token cache at {:?}", self.path);
                Ok(Map::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(token: &str) -> TokenRecord {
        TokenRecord {
            access_token: token.to_string(),
            refresh_token: format!("{}-refresh", token),
            expires_in: 1_700_000_300,
            refresh_expires_in: 1_700_001_800,
        }
    }

    #[test]
    fn test_from_lifetimes_applies_margin() {
        let rec = TokenRecord::from_lifetimes("a".into(), "r".into(), 300, 1800, 1_000);
        assert_eq!(rec.expires_in, 1_295);
        assert_eq!(rec.refresh_expires_in, 2_795);
    }

    #[test]
    fn test_expiry_checks() {
        let rec = record("a");
        assert!(!rec.is_access_expired(1_700_000_300));
        assert!(rec.is_access_expired(1_700_000_301));
        assert!(rec.can_refresh(1_700_001_789, 10));
        assert!(!rec.can_refresh(1_700_001_790, 10));
    }

    #[test]
    fn test_missing_file_loads_none() {
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("auth_tokens"));
        assert!(store.load("vm-cli").unwrap().is_none());
    }

    #[test]
    fn test_save_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("nested").join("auth_tokens"));
        store.save("vm-cli", &record("a")).unwrap();
        assert_eq!(store.load("vm-cli").unwrap(), Some(record("a")));
    }

    #[test]
    fn test_save_preserves_other_clients() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_tokens");
        std::fs::write(
            &path,
            r#"{"a": {"access_token": "x", "refresh_token": "y", "expires_in": 1, "refresh_expires_in": 2, "token_type": "Bearer"},
                "b": {"something": "else"}}"#,
        )
        .unwrap();

        let store = TokenStore::new(&path);
        store.save("c", &record("c")).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["a"]["token_type"], "Bearer");
        assert_eq!(raw["b"]["something"], "else");
        assert_eq!(store.load("a").unwrap().unwrap().access_token, "x");
        assert_eq!(store.load("c").unwrap(), Some(record("c")));
    }

    #[test]
    fn test_save_overwrites_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("auth_tokens"));
        store.save("vm-cli", &record("old")).unwrap();
        store.save("vm-cli", &record("new")).unwrap();
        assert_eq!(store.load("vm-cli").unwrap().unwrap().access_token, "new");
    }

    #[test]
    fn test_malformed_file_is_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_tokens");
        std::fs::write(&path, "{not json").unwrap();

        let store = TokenStore::new(&path);
        assert!(store.load("vm-cli").unwrap().is_none());

        store.save("vm-cli", &record("a")).unwrap();
        assert_eq!(store.load("vm-cli").unwrap(), Some(record("a")));
    }

    #[test]
    fn test_non_utf8_file_is_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_tokens");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        let store = TokenStore::new(&path);
        assert!(store.load("vm-cli").unwrap().is_none());

        store.save("vm-cli", &record("a")).unwrap();
        assert_eq!(store.load("vm-cli").unwrap(), Some(record("a")));
    }

    #[test]
    fn test_unrecognized_entry_loads_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth_tokens");
        std::fs::write(&path, r#"{"vm-cli": {"access_token": "x"}}"#).unwrap();

        let store = TokenStore::new(&path);
        assert!(store.load("vm-cli").unwrap().is_none());
    }
}
