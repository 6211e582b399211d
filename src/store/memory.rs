//! In-process credential store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::credential::{CredentialStore, StoredCredential};
use crate::error::PairingResult;

/// Credential store kept in memory; contents are lost on exit
#[derive(Default)]
pub struct MemoryCredentialStore {
    documents: DashMap<String, (serde_json::Value, DateTime<Utc>)>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn read(&self, session_id: &str) -> PairingResult<Option<serde_json::Value>> {
        Ok(self.documents.get(session_id).map(|d| d.0.clone()))
    }

    async fn write_if(
        &self,
        session_id: &str,
        credential: &serde_json::Value,
        still_valid: &(dyn Fn() -> bool + Send + Sync),
    ) -> PairingResult<bool> {
        // The entry guard holds the shard lock, which `delete` also takes
        match self.documents.entry(session_id.to_string()) {
            Entry::Occupied(mut slot) => {
                if !still_valid() {
                    return Ok(false);
                }
                slot.insert((credential.clone(), Utc::now()));
            }
            Entry::Vacant(slot) => {
                if !still_valid() {
                    return Ok(false);
                }
                slot.insert((credential.clone(), Utc::now()));
            }
        }
        Ok(true)
    }

    async fn delete(&self, session_id: &str) -> PairingResult<bool> {
        Ok(self.documents.remove(session_id).is_some())
    }

    async fn exists(&self, session_id: &str) -> bool {
        self.documents.contains_key(session_id)
    }

    async fn list(&self) -> PairingResult<Vec<StoredCredential>> {
        Ok(self
            .documents
            .iter()
            .map(|d| StoredCredential {
                session_id: d.key().clone(),
                modified_at: d.value().1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        store.write("s1", &serde_json::json!({ "k": "v" })).await.unwrap();

        assert!(store.exists("s1").await);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert_eq!(store.read("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_if_skips_when_check_fails() {
        let store = MemoryCredentialStore::new();
        let doc = serde_json::json!({ "k": "v" });

        assert!(!store.write_if("s1", &doc, &|| false).await.unwrap());
        assert!(!store.exists("s1").await);

        assert!(store.write_if("s1", &doc, &|| true).await.unwrap());
        assert!(!store
            .write_if("s1", &serde_json::json!({ "k": "w" }), &|| false)
            .await
            .unwrap());
        assert_eq!(store.read("s1").await.unwrap(), Some(doc));
    }
}
