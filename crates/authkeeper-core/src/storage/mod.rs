//! Key-value storage tiers backing the credential store.
//!
//! Two tiers exist per client:
//! - a durable tier that survives restarts (`FileStorage` or `KeyringStorage`)
//! - a session tier that lives as long as the process (`MemoryStorage`)
//!
//! Every tier implements [`KeyValueStore`]. Callers above this layer treat
//! errors as "value absent" rather than propagating them.

pub mod file;
pub mod keychain;
pub mod memory;

pub use file::FileStorage;
pub use keychain::KeyringStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),
}

/// A string key-value surface, the moral equivalent of a browser storage area.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}
