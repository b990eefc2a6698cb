//! SQLite-backed store
//! Keeps domains and certificates in a single `kv` table

use super::{cert_key, decode_customer_id, domain_key, Store, StoreError, DOMAIN_PREFIX};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound (exclusive) for keys starting with `domain:`.
/// `;` is the byte right after `:`.
const DOMAIN_PREFIX_END: &str = "domain;";

/// Persistent store on top of one SQLite connection.
///
/// The connection sits behind a mutex and every query runs on tokio's
/// blocking pool, so callers on the async runtime never stall on disk I/O.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database file at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;

        // WAL lets the domains CLI write while the proxy reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path),
        })
    }

    /// Private in-memory database, gone when the store is dropped
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }

    async fn get_raw(&self, key: String) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(move |conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn put_raw(&self, key: String, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_raw(&self, key: String) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_domain(&self, hostname: &str) -> Result<Option<String>, StoreError> {
        let key = domain_key(hostname);
        match self.get_raw(key.clone()).await? {
            Some(raw) => decode_customer_id(&key, raw),
            None => Ok(None),
        }
    }

    async fn set_domain(&self, hostname: &str, customer_id: &str) -> Result<(), StoreError> {
        self.put_raw(domain_key(hostname), customer_id.as_bytes().to_vec())
            .await
    }

    async fn delete_domain(&self, hostname: &str) -> Result<(), StoreError> {
        self.delete_raw(domain_key(hostname)).await
    }

    async fn list_domains(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2")?;
                let rows = stmt
                    .query_map(params![DOMAIN_PREFIX, DOMAIN_PREFIX_END], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut domains = HashMap::with_capacity(rows.len());
        for (key, raw) in rows {
            if let Some(customer_id) = decode_customer_id(&key, raw)? {
                let hostname = key[DOMAIN_PREFIX.len()..].to_string();
                domains.insert(hostname, customer_id);
            }
        }

        Ok(domains)
    }

    async fn get_cert(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_raw(cert_key(key)).await
    }

    async fn set_cert(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.put_raw(cert_key(key), data.to_vec()).await
    }

    async fn delete_cert(&self, key: &str) -> Result<(), StoreError> {
        self.delete_raw(cert_key(key)).await
    }
}
