//! Key-Value Store Client
//!
//! Durable store for workflow checkpoints, keyed by correlation id. The
//! [`KvStore`] trait is the raw string boundary; [`KvClient`] layers typed
//! serde access and key validation on top. Production uses Redis through a
//! single shared connection; tests use the in-memory implementation.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::errors::{Result, ServiceError};

// ============================================================================
// Raw store boundary
// ============================================================================

/// Raw async get/set/delete/exists over string values.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn set_raw(&self, key: &str, value: String) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

// ============================================================================
// Typed client
// ============================================================================

/// Typed wrapper over a shared [`KvStore`].
///
/// Every operation validates the key first: an empty key is always
/// `InvalidKey`, checked before the store is touched.
#[derive(Clone)]
pub struct KvClient {
    store: Arc<dyn KvStore>,
}

impl KvClient {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ServiceError::InvalidKey);
        }
        Ok(())
    }

    /// `Ok(None)` is the explicit "no value" marker, not an error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Self::validate_key(key)?;
        match self.store.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        Self::validate_key(key)?;
        let raw = serde_json::to_string(value)?;
        self.store.set_raw(key, raw).await
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        Self::validate_key(key)?;
        self.store.del(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Self::validate_key(key)?;
        self.store.exists(key).await
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed store over one shared `ConnectionManager`.
///
/// `connect`/`disconnect` are idempotent; operations on a disconnected client
/// fail with `ConnectionError` without touching the network.
pub struct RedisKvStore {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl RedisKvStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| ServiceError::Store(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.conn.lock().unwrap().is_some() {
            return Ok(());
        }
        let manager = self.client.get_connection_manager().await?;
        *self.conn.lock().unwrap() = Some(manager);
        info!("Redis KV store connected");
        Ok(())
    }

    /// No-op when already disconnected.
    pub fn disconnect(&self) {
        if self.conn.lock().unwrap().take().is_some() {
            debug!("Redis KV store disconnected");
        }
    }

    fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        self.conn
            .lock()
            .unwrap()
            .clone()
            .ok_or(ServiceError::ConnectionError)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self.connection()?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        Ok(conn.exists(key).await?)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// HashMap-backed store for tests and single-process demos.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }
}
