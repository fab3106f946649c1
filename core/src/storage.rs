//! Durable storage backends.
//!
//! A [`DurableStorage`] is the flat key/value space owned by one entity. A
//! [`StorageProvider`] hands out that space for an [`EntityId`]; asking twice
//! for the same id yields the same underlying storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::entity::EntityId;
use crate::error::StorageError;

#[async_trait]
pub trait DurableStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;
    /// Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

pub trait StorageProvider: Send + Sync {
    fn storage_for(&self, entity: &EntityId) -> Arc<dyn DurableStorage>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }
}

/// Process-local entities. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryStorageProvider {
    entities: Mutex<HashMap<EntityId, Arc<MemoryStorage>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn storage_for(&self, entity: &EntityId) -> Arc<dyn DurableStorage> {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let storage = entities
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(MemoryStorage::new()))
            .clone();
        storage
    }
}

// ── JSON file per entity ─────────────────────────────────────────────────────

pub fn default_state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudflare-mcp")
        .join("state")
}

/// One JSON object per entity, rewritten atomically on every mutation.
pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, entries: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.load().await?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value);
        self.store(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let existed = entries.remove(key).is_some();
        if existed {
            self.store(&entries).await?;
        }
        Ok(existed)
    }
}

pub struct FileStorageProvider {
    dir: PathBuf,
    entities: Mutex<HashMap<EntityId, Arc<FileStorage>>>,
}

impl FileStorageProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entities: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StorageProvider for FileStorageProvider {
    fn storage_for(&self, entity: &EntityId) -> Arc<dyn DurableStorage> {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let storage = entities
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(FileStorage::new(self.dir.join(format!("{entity}.json")))))
            .clone();
        storage
    }
}

// ── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgStorage {
    pool: PgPool,
    entity_id: String,
}

#[async_trait]
impl DurableStorage for PgStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT value
            FROM durable_kv
            WHERE entity_id = $1 AND key = $2
            "#,
        )
        .bind(&self.entity_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO durable_kv (entity_id, key, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (entity_id, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(&self.entity_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM durable_kv
            WHERE entity_id = $1 AND key = $2
            "#,
        )
        .bind(&self.entity_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgStorageProvider {
    pool: PgPool,
}

impl PgStorageProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_kv (
                entity_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (entity_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl StorageProvider for PgStorageProvider {
    fn storage_for(&self, entity: &EntityId) -> Arc<dyn DurableStorage> {
        Arc::new(PgStorage {
            pool: self.pool.clone(),
            entity_id: entity.to_string(),
        })
    }
}
