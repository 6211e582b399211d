//! File-per-session credential store.
//!
//! Layout: `<root>/<session_id>/creds.json`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::credential::{CredentialStore, StoredCredential};
use crate::error::PairingResult;

const CREDS_FILE: &str = "creds.json";

/// Credential store backed by one directory per session
pub struct FileCredentialStore {
    root: PathBuf,
    /// Per-session write locks
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FileCredentialStore {
    /// Open the store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> PairingResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!("Credential store at {}", root.display());
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn creds_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CREDS_FILE)
    }

    fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn read(&self, session_id: &str) -> PairingResult<Option<serde_json::Value>> {
        match tokio::fs::read_to_string(self.creds_path(session_id)).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_if(
        &self,
        session_id: &str,
        credential: &serde_json::Value,
        still_valid: &(dyn Fn() -> bool + Send + Sync),
    ) -> PairingResult<bool> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;
        if !still_valid() {
            debug!("[{}] Credential write skipped", session_id);
            return Ok(false);
        }

        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let data = serde_json::to_string_pretty(credential)?;
        let tmp = dir.join(format!("{}.tmp", CREDS_FILE));
        tokio::fs::write(&tmp, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, self.creds_path(session_id)).await?;
        debug!("[{}] Credentials written", session_id);
        Ok(true)
    }

    async fn delete(&self, session_id: &str) -> PairingResult<bool> {
        let lock = self.lock_for(session_id);
        let removed = {
            let _guard = lock.lock().await;
            match tokio::fs::remove_dir_all(self.session_dir(session_id)).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        // Keep the lock while another writer still holds a clone of it
        drop(lock);
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);

        if removed {
            info!("[{}] Credentials removed", session_id);
        }
        Ok(removed)
    }

    async fn exists(&self, session_id: &str) -> bool {
        tokio::fs::try_exists(self.creds_path(session_id))
            .await
            .unwrap_or(false)
    }

    async fn list(&self) -> PairingResult<Vec<StoredCredential>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut stored = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            let metadata = match tokio::fs::metadata(entry.path().join(CREDS_FILE)).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified_at = match metadata.modified() {
                Ok(time) => DateTime::<Utc>::from(time),
                Err(e) => {
                    warn!("[{}] No modification time: {}", session_id, e);
                    Utc::now()
                }
            };
            stored.push(StoredCredential {
                session_id,
                modified_at,
            });
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_read_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();

        assert!(!store.exists("s1").await);
        assert_eq!(store.read("s1").await.unwrap(), None);

        store.write("s1", &json!({ "v": 1 })).await.unwrap();
        store.write("s1", &json!({ "v": 2 })).await.unwrap();

        assert!(store.exists("s1").await);
        assert_eq!(store.read("s1").await.unwrap(), Some(json!({ "v": 2 })));
        assert!(dir.path().join("s1").join("creds.json").exists());
        assert!(!dir.path().join("s1").join("creds.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();

        store.write("s1", &json!({})).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(!store.exists("s1").await);
    }

    #[tokio::test]
    async fn test_delete_keeps_lock_held_by_waiting_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        store.write("s1", &json!({})).await.unwrap();
        store.write("s2", &json!({})).await.unwrap();

        let waiting = store.lock_for("s1");
        assert!(store.delete("s1").await.unwrap());
        assert!(Arc::ptr_eq(&waiting, &store.lock_for("s1")));

        assert!(store.delete("s2").await.unwrap());
        assert!(!store.locks.contains_key("s2"));
    }

    #[tokio::test]
    async fn test_write_if_checks_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();

        assert!(!store.write_if("s1", &json!({ "v": 1 }), &|| false).await.unwrap());
        assert!(!store.exists("s1").await);
        assert!(!dir.path().join("s1").exists());

        assert!(store.write_if("s1", &json!({ "v": 1 }), &|| true).await.unwrap());
        assert_eq!(store.read("s1").await.unwrap(), Some(json!({ "v": 1 })));
    }

    #[tokio::test]
    async fn test_list_skips_dirs_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();

        store.write("a", &json!({})).await.unwrap();
        store.write("b", &json!({})).await.unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), "x").unwrap();

        let mut ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("bad")).unwrap();
        std::fs::write(dir.path().join("bad").join("creds.json"), "{not json").unwrap();

        let err = store.read("bad").await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }
}
