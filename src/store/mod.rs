//! Domain and certificate storage
//!
//! Every backend shares one keyspace, namespaced by prefix:
//! - `domain:<hostname>` -> customer ID
//! - `cert:<key>` -> opaque certificate bundle
//!
//! Stores never case-fold their keys. Callers normalize hostnames with
//! [`crate::hostname::normalize_host`] before any domain operation.

pub mod cached;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub use cached::{CacheStats, CachedStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const DOMAIN_PREFIX: &str = "domain:";
pub const CERT_PREFIX: &str = "cert:";

/// Errors raised by a storage backend.
///
/// A missing key is never an error; lookups report it as `None`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("value stored under {key} is not valid UTF-8")]
    Corrupt { key: String },

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A hostname to customer association, as exposed by the admin surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMapping {
    pub domain: String,
    pub customer_id: String,
}

/// Key-value contract shared by every storage variant.
///
/// Implementations must support concurrent single-key operations. No
/// multi-key atomicity is expected.
#[async_trait]
pub trait Store: Send + Sync {
    /// Customer ID mapped to `hostname`, or `None` when unmapped.
    async fn get_domain(&self, hostname: &str) -> Result<Option<String>, StoreError>;

    /// Upsert a mapping.
    async fn set_domain(&self, hostname: &str, customer_id: &str) -> Result<(), StoreError>;

    /// Remove a mapping. Removing an absent mapping succeeds.
    async fn delete_domain(&self, hostname: &str) -> Result<(), StoreError>;

    /// Snapshot of every mapping, in no particular order.
    async fn list_domains(&self) -> Result<HashMap<String, String>, StoreError>;

    /// Certificate bytes for `key`. `None` is distinct from an empty payload.
    async fn get_cert(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_cert(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    async fn delete_cert(&self, key: &str) -> Result<(), StoreError>;
}

pub fn domain_key(hostname: &str) -> String {
    format!("{}{}", DOMAIN_PREFIX, hostname)
}

pub fn cert_key(key: &str) -> String {
    format!("{}{}", CERT_PREFIX, key)
}

/// Decode a stored customer ID. Empty values read as unmapped.
pub(crate) fn decode_customer_id(key: &str, raw: Vec<u8>) -> Result<Option<String>, StoreError> {
    let customer_id = String::from_utf8(raw).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
    })?;

    if customer_id.is_empty() {
        Ok(None)
    } else {
        Ok(Some(customer_id))
    }
}
