//! Certificate cache adapter
//!
//! Exposes the store's certificate records through the get/put/delete contract
//! an issuance process expects, where a missing record is the distinct
//! [`CertCacheError::Miss`] signal rather than an empty value.

use crate::store::{Store, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertCacheError {
    /// No certificate stored under the key; the issuer should provision one
    #[error("certificate cache miss")]
    Miss,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CertCacheError {
    pub fn is_miss(&self) -> bool {
        matches!(self, CertCacheError::Miss)
    }
}

/// Persistence contract consumed by certificate issuance
#[async_trait]
pub trait CertCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CertCacheError>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CertCacheError>;
    async fn delete(&self, key: &str) -> Result<(), CertCacheError>;
}

/// [`CertCache`] backed by any [`Store`]
#[derive(Clone)]
pub struct StoreCertCache {
    store: Arc<dyn Store>,
}

impl StoreCertCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CertCache for StoreCertCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CertCacheError> {
        self.store.get_cert(key).await?.ok_or(CertCacheError::Miss)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CertCacheError> {
        Ok(self.store.set_cert(key, data).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), CertCacheError> {
        Ok(self.store.delete_cert(key).await?)
    }
}
