//! Credential Store Module
//!
//! Keyed blob storage for paired-session credentials:
//! - File-per-session store for production use
//! - In-memory store for tests and ephemeral deployments

pub mod credential;
pub mod file;
pub mod memory;

pub use credential::{phone_hint, CredentialStore, StoredCredential};
pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
