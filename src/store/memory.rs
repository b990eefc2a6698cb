//! In-memory store with the same contract as the persistent one

use super::{cert_key, domain_key, Store, StoreError, DOMAIN_PREFIX};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Volatile store, mostly used by tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_domain(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        let key = domain_key(hostname);
        let raw = self.entries.read().get(&key).cloned();
        match raw {
            Some(raw) => super::decode_customer_id(&key, raw),
            None => Ok(None),
        }
    }

    async fn set_domain(&self, hostname: &str, customer_id: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert(domain_key(hostname), customer_id.as_bytes().to_vec());
        Ok(())
    }

    async fn delete_domain(&self, hostname: &str) -> Result<(), StoreError> {
        self.entries.write().remove(&domain_key(hostname));
        Ok(())
    }

    async fn list_domains(&self) -> Result<HashMap<String, String>, StoreError> {
        let entries = self.entries.read();
        let mut domains = HashMap::new();
        for (key, raw) in entries.iter() {
            if let Some(hostname) = key.strip_prefix(DOMAIN_PREFIX) {
                if let Some(customer_id) = super::decode_customer_id(key, raw.clone())? {
                    domains.insert(hostname.to_string(), customer_id);
                }
            }
        }
        Ok(domains)
    }

    async fn get_cert(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(&cert_key(key)).cloned())
    }

    async fn set_cert(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.entries.write().insert(cert_key(key), data.to_vec());
        Ok(())
    }

    async fn delete_cert(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(&cert_key(key));
        Ok(())
    }
}
