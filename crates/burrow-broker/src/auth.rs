//! Token store for control-plane authentication.
//!
//! Tokens are bearer secrets handed to tunnel clients. Only the SHA-256 of
//! the plaintext is persisted; the plaintext is returned exactly once at
//! creation. The backing file is a JSON array rewritten atomically
//! (write-tmp-then-rename) with owner-only permissions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

/// Display prefix length kept from the plaintext.
const PREFIX_LEN: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub name: String,
    /// Lowercase hex SHA-256 of the plaintext.
    pub hash: String,
    /// First characters of the plaintext, for listing.
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revoked: bool,
}

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("token with name {0:?} already exists")]
    DuplicateName(String),
    #[error("token {0:?} not found or already revoked")]
    NotFound(String),
}

/// Persisted sequence of token records. Disabled (accepting everything) when
/// no path is configured.
pub struct TokenStore {
    path: Option<PathBuf>,
    records: RwLock<Vec<TokenRecord>>,
}

impl TokenStore {
    /// A store with no backing file: authentication is off and every
    /// connection is accepted.
    pub fn disabled() -> Self {
        Self {
            path: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Open (or start) the store at `path`, creating the parent directory
    /// with owner-only permissions.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        let path = path.into();

        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }

        let records = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<Vec<TokenRecord>>(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "token store file not found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let active = records.iter().filter(|r| !r.revoked).count();
        info!(
            path = %path.display(),
            total_tokens = records.len(),
            active_tokens = active,
            "token store loaded"
        );

        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Mint a token under `name`. The name must be unique among active
    /// records. Returns the plaintext, which is never stored.
    pub fn create(&self, name: &str) -> Result<String, TokenStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());

        if records.iter().any(|r| r.name == name && !r.revoked) {
            return Err(TokenStoreError::DuplicateName(name.to_string()));
        }

        let plaintext = generate_token();
        let record = TokenRecord {
            name: name.to_string(),
            hash: hash_token(&plaintext),
            prefix: plaintext[..PREFIX_LEN].to_string(),
            created_at: Utc::now(),
            revoked: false,
        };
        records.push(record);

        if let Err(e) = self.save(&records) {
            records.pop();
            return Err(e);
        }

        info!(name, prefix = &plaintext[..PREFIX_LEN], "token created");
        Ok(plaintext)
    }

    /// Mark the active record named `name` as revoked.
    pub fn revoke(&self, name: &str) -> Result<(), TokenStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());

        let record = records
            .iter_mut()
            .find(|r| r.name == name && !r.revoked)
            .ok_or_else(|| TokenStoreError::NotFound(name.to_string()))?;
        record.revoked = true;

        self.save(&records)?;
        info!(name, "token revoked");
        Ok(())
    }

    /// Active (non-revoked) records.
    pub fn list(&self) -> Vec<TokenRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| !r.revoked)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| !r.revoked)
            .count()
    }

    /// Check a plaintext against the active records with a constant-time
    /// hash compare. A disabled store accepts everything.
    pub fn verify(&self, plaintext: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        if plaintext.is_empty() {
            return false;
        }

        let hash = hash_token(plaintext);
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| !r.revoked)
            .any(|r| bool::from(r.hash.as_bytes().ct_eq(hash.as_bytes())))
    }

    fn save(&self, records: &[TokenRecord]) -> Result<(), TokenStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("tmp");
        write_private_file(&tmp, &data)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            warn!(path = %path.display(), error = %e, "token store rename failed");
            return Err(e.into());
        }
        Ok(())
    }
}

/// Pull the bearer token out of an `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("sk_{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> TokenStore {
        TokenStore::open(dir.path().join("tokens.json")).unwrap()
    }

    #[test]
    fn disabled_store_accepts_anything() {
        let store = TokenStore::disabled();
        assert!(!store.is_enabled());
        assert!(store.verify("whatever"));
        assert!(store.verify(""));
    }

    #[test]
    fn create_and_verify() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let token = store.create("ci").unwrap();
        assert!(token.starts_with("sk_"));
        assert!(store.verify(&token));
        assert!(!store.verify("sk_not-the-token"));
        assert!(!store.verify(""));
    }

    #[test]
    fn plaintext_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let token = store.create("ci").unwrap();

        let on_disk = fs::read_to_string(dir.path().join("tokens.json")).unwrap();
        assert!(!on_disk.contains(&token));
        assert!(on_disk.contains(&token[..PREFIX_LEN]));
    }

    #[test]
    fn duplicate_active_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("ci").unwrap();
        assert!(matches!(
            store.create("ci"),
            Err(TokenStoreError::DuplicateName(_))
        ));
    }

    #[test]
    fn revoked_token_no_longer_verifies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let token = store.create("ci").unwrap();

        store.revoke("ci").unwrap();
        assert!(!store.verify(&token));
        assert_eq!(store.count(), 0);

        // the name is free again
        store.create("ci").unwrap();
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn revoking_unknown_name_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.revoke("ghost"),
            Err(TokenStoreError::NotFound(_))
        ));
    }

    #[test]
    fn store_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let token = {
            let store = store(&dir);
            store.create("ci").unwrap()
        };

        let reopened = store(&dir);
        assert_eq!(reopened.count(), 1);
        assert!(reopened.verify(&token));
        assert_eq!(reopened.list()[0].name, "ci");
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create("ci").unwrap();

        let mode = fs::metadata(dir.path().join("tokens.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer sk_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk_abc".to_string()));

        headers.insert(AUTHORIZATION, "BEARER sk_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("sk_abc".to_string()));

        headers.insert(AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
