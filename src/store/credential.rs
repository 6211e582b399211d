//! Credential Store Contract
//!
//! Durable keyed storage for one JSON credential document per session id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PairingResult;

/// Listing entry for a stored credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub session_id: String,
    /// When the document was last written
    pub modified_at: DateTime<Utc>,
}

/// Credential store trait
///
/// Writes for the same session id are serialized by the implementation;
/// different ids never coordinate.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the credential document, `None` if absent
    async fn read(&self, session_id: &str) -> PairingResult<Option<serde_json::Value>>;

    /// Write (or overwrite) the credential document
    async fn write(&self, session_id: &str, credential: &serde_json::Value) -> PairingResult<()> {
        self.write_if(session_id, credential, &|| true).await.map(|_| ())
    }

    /// Write the credential document if `still_valid` holds once the per-id
    /// write lock is held. Returns whether the document was written.
    async fn write_if(
        &self,
        session_id: &str,
        credential: &serde_json::Value,
        still_valid: &(dyn Fn() -> bool + Send + Sync),
    ) -> PairingResult<bool>;

    /// Delete the credential document. Returns whether anything was removed.
    async fn delete(&self, session_id: &str) -> PairingResult<bool>;

    /// Whether a credential document exists
    async fn exists(&self, session_id: &str) -> bool;

    /// All stored credentials
    async fn list(&self) -> PairingResult<Vec<StoredCredential>>;
}

/// Extract the phone identifier from a credential document.
///
/// Reads `me.id`, e.g. `2348012345678:12@s.whatsapp.net` -> `2348012345678`.
pub fn phone_hint(credential: &serde_json::Value) -> Option<String> {
    let id = credential.get("me")?.get("id")?.as_str()?;
    let user = id.split(':').next()?;
    let user = user.trim_end_matches("@s.whatsapp.net");
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}
