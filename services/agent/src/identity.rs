//! On-disk device identity.
//!
//! The identity (device id + access key) is obtained once at registration
//! and stored as JSON under the state directory. It is written atomically
//! (temp file + fsync + rename) with owner-only permissions and is never
//! rewritten afterwards.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use deviceplane_id::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Identity file name within the state directory.
pub const IDENTITY_FILE: &str = "identity.json";

/// Errors from identity store operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("identity file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("a different identity is already stored at {path:?}")]
    AlreadyExists { path: PathBuf },
}

/// Secret used as the HTTP Basic username for authenticated calls.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the raw key. Avoid logging the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(<redacted>)")
    }
}

/// Device identity obtained at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub device_id: DeviceId,
    pub access_key: AccessKey,
}

/// File-backed identity store.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Create a store for `<state_dir>/identity.json`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(IDENTITY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored identity, or `None` if the device never registered.
    pub async fn load(&self) -> Result<Option<Identity>, IdentityError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| IdentityError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Persist the identity.
    ///
    /// Saving the same identity twice is a no-op; saving a different one
    /// over an existing identity fails.
    pub async fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        if let Some(existing) = self.load().await? {
            if &existing == identity {
                return Ok(());
            }
            return Err(IdentityError::AlreadyExists {
                path: self.path.clone(),
            });
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let contents = serde_json::to_vec_pretty(identity).map_err(|source| {
            IdentityError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        // Temp file in the same directory so the rename stays atomic.
        let temp_path = self.path.with_extension("json.tmp");

        {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options
                .open(&temp_path)
                .await
                .map_err(|e| self.io_error(e))?;
            file.write_all(&contents)
                .await
                .map_err(|e| self.io_error(e))?;
            file.sync_all().await.map_err(|e| self.io_error(e))?;
        }

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        debug!(path = ?self.path, device_id = %identity.device_id, "Identity persisted");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(device: &str, key: &str) -> Identity {
        Identity {
            device_id: DeviceId::parse(device).unwrap(),
            access_key: AccessKey::new(key),
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("nested"));

        let id = identity("d", "k");
        store.save(&id).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, id);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_bytes_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.save(&identity("d", "k")).await.unwrap();
        let first = std::fs::read(store.path()).unwrap();

        // Simulates a restart: new store, same state dir, idempotent save.
        let reopened = IdentityStore::new(dir.path());
        reopened.save(&identity("d", "k")).await.unwrap();
        let second = std::fs::read(reopened.path()).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_different_identity_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.save(&identity("d", "k")).await.unwrap();

        let err = store.save(&identity("other", "k2")).await.unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyExists { .. }));
        assert_eq!(store.load().await.unwrap().unwrap(), identity("d", "k"));
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, IdentityError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.save(&identity("d", "k")).await.unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"deviceId": "d", "accessKey": "k"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.save(&identity("d", "k")).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_debug_redacts_access_key() {
        let rendered = format!("{:?}", identity("d", "super-secret"));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("super-secret"));
    }
}
