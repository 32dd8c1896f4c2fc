//! File-backed API-key authentication.
//!
//! Keys live in a JSON file mapping opaque api-key strings to user records.
//! The file is reloaded when its mtime changes, so operators can add or
//! revoke keys without restarting the gateway.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppError;

/// A user record stored against an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Display name; doubles as the scheduler's user id.
    pub name: String,
    /// Contact address.
    pub email: String,
    /// Creation date (`YYYY-MM-DD`).
    pub created: String,
    /// Requests today (operator-reset, never automatic).
    #[serde(default)]
    pub requests_today: u64,
    /// Requests over the key's lifetime.
    #[serde(default)]
    pub total_requests: u64,
    /// Timestamp of the most recent request.
    #[serde(default)]
    pub last_request: Option<DateTime<Utc>>,
}

/// On-disk shape of the key file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeysFile {
    /// Mapping of API keys to user records.
    #[serde(default)]
    pub api_keys: HashMap<String, UserInfo>,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// The key that authenticated the request.
    pub api_key: String,
    /// The matching user record.
    pub user: UserInfo,
}

impl AuthenticatedUser {
    /// The scheduler-visible user id.
    pub fn name(&self) -> &str {
        &self.user.name
    }
}

#[derive(Debug)]
struct CachedKeys {
    data: ApiKeysFile,
    file_mtime: Option<SystemTime>,
}

/// Validates API keys against the JSON key file.
#[derive(Debug)]
pub struct ApiKeyStore {
    path: PathBuf,
    cache: Mutex<Option<CachedKeys>>,
}

impl ApiKeyStore {
    /// Creates a store backed by `path`. The file may not exist yet.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
        }
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
    }

    fn load(&self) -> Result<ApiKeysFile, AppError> {
        let mtime = self.file_mtime();

        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.file_mtime == mtime && mtime.is_some() {
                    return Ok(cached.data.clone());
                }
            }
        }

        let data = if self.path.exists() {
            let raw = fs::read_to_string(&self.path)
                .map_err(|err| AppError::Config(format!("Failed to read API keys file: {err}")))?;
            serde_json::from_str(&raw)
                .map_err(|err| AppError::Config(format!("Invalid API keys file format: {err}")))?
        } else {
            warn!(path = %self.path.display(), "API keys file not found");
            ApiKeysFile::default()
        };

        let mut cache = self.cache.lock();
        *cache = Some(CachedKeys {
            data: data.clone(),
            file_mtime: mtime,
        });

        Ok(data)
    }

    fn save(&self, data: &ApiKeysFile) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    AppError::Config(format!("Failed to create key file directory: {err}"))
                })?;
            }
        }

        let raw = serde_json::to_string_pretty(data)
            .map_err(|err| AppError::Internal(err.to_string()))?;
        fs::write(&self.path, raw)
            .map_err(|err| AppError::Config(format!("Failed to write API keys file: {err}")))?;

        let mut cache = self.cache.lock();
        *cache = Some(CachedKeys {
            data: data.clone(),
            file_mtime: self.file_mtime(),
        });

        Ok(())
    }

    /// Validates an API key; returns the matching user when known.
    pub fn validate(&self, api_key: &str) -> Result<Option<AuthenticatedUser>, AppError> {
        if api_key.trim().is_empty() {
            return Ok(None);
        }

        let data = self.load()?;
        Ok(data.api_keys.get(api_key).map(|user| {
            debug!(user = %user.name, "Valid API key");
            AuthenticatedUser {
                api_key: api_key.to_string(),
                user: user.clone(),
            }
        }))
    }

    /// Bumps the usage counters for a key and persists them.
    ///
    /// Counter persistence is best-effort; callers log and carry on when it
    /// fails so a read-only key file never breaks requests.
    pub fn record_usage(&self, api_key: &str) -> Result<(), AppError> {
        let mut data = self.load()?;

        let Some(user) = data.api_keys.get_mut(api_key) else {
            return Ok(());
        };

        user.total_requests += 1;
        user.requests_today += 1;
        user.last_request = Some(Utc::now());

        self.save(&data)
    }

    /// Adds a key; false when the key already exists.
    pub fn add_user(&self, api_key: &str, name: &str, email: &str) -> Result<bool, AppError> {
        let mut data = self.load()?;

        if data.api_keys.contains_key(api_key) {
            return Ok(false);
        }

        drop(data.api_keys.insert(
            api_key.to_string(),
            UserInfo {
                name: name.to_string(),
                email: email.to_string(),
                created: Utc::now().format("%Y-%m-%d").to_string(),
                requests_today: 0,
                total_requests: 0,
                last_request: None,
            },
        ));

        self.save(&data)?;
        Ok(true)
    }

    /// Removes a key; false when it was not present.
    pub fn remove_user(&self, api_key: &str) -> Result<bool, AppError> {
        let mut data = self.load()?;

        if data.api_keys.remove(api_key).is_none() {
            return Ok(false);
        }

        self.save(&data)?;
        Ok(true)
    }
}

/// Pulls the bearer token out of an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticates a request against the key store.
///
/// Missing credentials and unknown keys are distinct errors so the response
/// taxonomy stays faithful; both surface as 401 with a bearer challenge.
pub fn authenticate(store: &ApiKeyStore, headers: &HeaderMap) -> Result<AuthenticatedUser, AppError> {
    let token = bearer_token(headers).ok_or(AppError::AuthMissing)?;

    let user = store.validate(token)?.ok_or(AppError::AuthInvalid)?;

    if let Err(err) = store.record_usage(token) {
        warn!(error = %err, "Failed to update user stats");
    }

    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn store_with_key(dir: &tempfile::TempDir, key: &str, name: &str) -> ApiKeyStore {
        let path = dir.path().join("api_keys.json");
        let store = ApiKeyStore::new(path);
        assert!(store.add_user(key, name, "user@example.org").expect("add"));
        store
    }

    #[test]
    fn validate_accepts_known_keys_and_rejects_unknown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_key(&dir, "sk-valid", "alice");

        let user = store.validate("sk-valid").expect("validate").expect("user");
        assert_eq!(user.name(), "alice");

        assert!(store.validate("sk-wrong").expect("validate").is_none());
        assert!(store.validate("").expect("validate").is_none());
    }

    #[test]
    fn record_usage_bumps_and_persists_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_key(&dir, "sk-valid", "alice");

        store.record_usage("sk-valid").expect("record");
        store.record_usage("sk-valid").expect("record");

        // A fresh store reads the persisted counters back.
        let fresh = ApiKeyStore::new(dir.path().join("api_keys.json"));
        let user = fresh.validate("sk-valid").expect("validate").expect("user");
        assert_eq!(user.user.total_requests, 2);
        assert_eq!(user.user.requests_today, 2);
        assert!(user.user.last_request.is_some());
    }

    #[test]
    fn add_user_refuses_duplicate_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_key(&dir, "sk-valid", "alice");

        assert!(!store.add_user("sk-valid", "bob", "bob@example.org").expect("add"));
        assert!(store.remove_user("sk-valid").expect("remove"));
        assert!(!store.remove_user("sk-valid").expect("remove"));
    }

    #[test]
    fn missing_file_behaves_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ApiKeyStore::new(dir.path().join("nope.json"));
        assert!(store.validate("sk-anything").expect("validate").is_none());
    }

    #[test]
    fn bearer_extraction_handles_malformed_headers() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        drop(headers.insert(AUTHORIZATION, "Token abc".parse().expect("header")));
        assert!(bearer_token(&headers).is_none());

        drop(headers.insert(AUTHORIZATION, "Bearer sk-123".parse().expect("header")));
        assert_eq!(bearer_token(&headers), Some("sk-123"));
    }

    #[test]
    fn authenticate_distinguishes_missing_from_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_key(&dir, "sk-valid", "alice");

        let headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&store, &headers).expect_err("missing"),
            AppError::AuthMissing
        ));

        let mut headers = HeaderMap::new();
        drop(headers.insert(AUTHORIZATION, "Bearer sk-wrong".parse().expect("header")));
        assert!(matches!(
            authenticate(&store, &headers).expect_err("invalid"),
            AppError::AuthInvalid
        ));

        let mut headers = HeaderMap::new();
        drop(headers.insert(AUTHORIZATION, "Bearer sk-valid".parse().expect("header")));
        let user = authenticate(&store, &headers).expect("authenticate");
        assert_eq!(user.name(), "alice");
    }
}
