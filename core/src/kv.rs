//! Typed, prefix-namespaced key/value store over a [`DurableStorage`].
//!
//! The set of keys and the schema of each value are fixed at construction.
//! Every read and write is checked against that schema; a key outside it is
//! rejected before the backend is touched.
//!
//! Operations on one store are processed in arrival order by a single queue
//! task, so a `get` issued after a `put` always observes it. `put` validates
//! synchronously and returns without waiting for the backend; the write is
//! registered with the store's [`DeferredTasks`] scope instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::deferred::DeferredTasks;
use crate::error::{KvError, StorageError, ValidationError};
use crate::storage::DurableStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    /// RFC 3339 string or epoch milliseconds, normalized to UTC RFC 3339.
    DateTime,
    Object,
    Any,
}

impl ValueKind {
    fn as_str(self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::DateTime => "datetime",
            ValueKind::Object => "object",
            ValueKind::Any => "any value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchema {
    kind: ValueKind,
    nullable: bool,
}

impl KeySchema {
    pub const fn of(kind: ValueKind) -> Self {
        Self {
            kind,
            nullable: false,
        }
    }

    pub const fn string() -> Self {
        Self::of(ValueKind::String)
    }

    pub const fn number() -> Self {
        Self::of(ValueKind::Number)
    }

    pub const fn integer() -> Self {
        Self::of(ValueKind::Integer)
    }

    pub const fn boolean() -> Self {
        Self::of(ValueKind::Boolean)
    }

    pub const fn datetime() -> Self {
        Self::of(ValueKind::DateTime)
    }

    pub const fn object() -> Self {
        Self::of(ValueKind::Object)
    }

    pub const fn any() -> Self {
        Self::of(ValueKind::Any)
    }

    /// Accept an explicit `null`, distinct from "never stored".
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Validate `raw` and return its canonical form.
    pub fn parse(&self, raw: &Value) -> Result<Value, ValidationError> {
        if raw.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err(ValidationError::new(self.kind.as_str(), "null"))
            };
        }

        let expected = self.kind.as_str();
        match (self.kind, raw) {
            (ValueKind::Any, _) => Ok(raw.clone()),
            (ValueKind::String, Value::String(_)) => Ok(raw.clone()),
            (ValueKind::Number, Value::Number(_)) => Ok(raw.clone()),
            (ValueKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            (ValueKind::Boolean, Value::Bool(_)) => Ok(raw.clone()),
            (ValueKind::Object, Value::Object(_)) => Ok(raw.clone()),
            (ValueKind::DateTime, Value::String(text)) => DateTime::parse_from_rfc3339(text)
                .map(|parsed| canonical_datetime(parsed.with_timezone(&Utc)))
                .map_err(|_| ValidationError::new(expected, format!("string '{text}'"))),
            (ValueKind::DateTime, Value::Number(n)) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(canonical_datetime)
                .ok_or_else(|| ValidationError::new(expected, format!("number {n}"))),
            (_, other) => Err(ValidationError::new(expected, json_type_name(other))),
        }
    }
}

fn canonical_datetime(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub type SchemaMap = BTreeMap<&'static str, KeySchema>;

enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<Value>, StorageError>>,
    },
    Put {
        key: String,
        value: Value,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<Result<bool, StorageError>>,
    },
}

pub struct DurableKvStore {
    prefix: String,
    schemas: Arc<SchemaMap>,
    commands: mpsc::UnboundedSender<Command>,
    deferred: DeferredTasks,
}

impl DurableKvStore {
    /// Must be called from within a Tokio runtime: the store's command queue
    /// runs as a spawned task.
    ///
    /// # Panics
    ///
    /// If a declared key is empty or contains `/`. Keys are the last segment
    /// of the storage key, which keeps stores with nested prefixes apart.
    pub fn new(
        storage: Arc<dyn DurableStorage>,
        prefix: impl Into<String>,
        schemas: SchemaMap,
        deferred: DeferredTasks,
    ) -> Self {
        if let Some(key) = schemas
            .keys()
            .find(|key| key.is_empty() || key.contains('/'))
        {
            panic!("store schema declares invalid key '{key}': keys must be non-empty and contain no '/'");
        }
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drive_commands(storage, receiver));
        Self {
            prefix: prefix.into(),
            schemas: Arc::new(schemas),
            commands,
            deferred,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Physical key used in the backing storage.
    pub fn storage_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn schema(&self, key: &str) -> Result<KeySchema, KvError> {
        self.schemas
            .get(key)
            .copied()
            .ok_or_else(|| KvError::UnknownKey(key.to_string()))
    }

    /// `Ok(None)` when nothing is stored; `Ok(Some(Value::Null))` for an
    /// explicitly stored null on a nullable key.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let schema = self.schema(key)?;
        match self.read_raw(key).await? {
            Some(raw) => schema
                .parse(&raw)
                .map(Some)
                .map_err(|source| validation(key, source)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but an unset key yields `schema.parse(default)`.
    /// A stored explicit null is returned as null, not replaced by `default`.
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value, KvError> {
        let schema = self.schema(key)?;
        let raw = self.read_raw(key).await?.unwrap_or(default);
        schema.parse(&raw).map_err(|source| validation(key, source))
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvError> {
        let Some(value) = self.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| KvError::Decode {
                key: key.to_string(),
                source,
            })
    }

    /// Validates `value` and schedules the write. Nothing is written when
    /// validation fails.
    pub fn put(&self, key: &str, value: Value) -> Result<(), KvError> {
        let schema = self.schema(key)?;
        let value = schema
            .parse(&value)
            .map_err(|source| validation(key, source))?;

        let storage_key = self.storage_key(key);
        let (done, settled) = oneshot::channel();
        self.commands
            .send(Command::Put {
                key: storage_key.clone(),
                value,
                done,
            })
            .map_err(|_| StorageError::Closed)?;

        self.deferred.wait_until(async move {
            match settled.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(key = %storage_key, error = %err, "durable write failed");
                }
                Err(_) => {
                    tracing::error!(key = %storage_key, "durable write dropped before completion");
                }
            }
        });
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.schema(key)?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Delete {
                key: self.storage_key(key),
                reply,
            })
            .map_err(|_| StorageError::Closed)?;
        Ok(response.await.map_err(|_| StorageError::Closed)??)
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Value>, KvError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Get {
                key: self.storage_key(key),
                reply,
            })
            .map_err(|_| StorageError::Closed)?;
        Ok(response.await.map_err(|_| StorageError::Closed)??)
    }
}

fn validation(key: &str, source: ValidationError) -> KvError {
    KvError::Validation {
        key: key.to_string(),
        source,
    }
}

async fn drive_commands(
    storage: Arc<dyn DurableStorage>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Get { key, reply } => {
                let _ = reply.send(storage.get(&key).await);
            }
            Command::Put { key, value, done } => {
                let _ = done.send(storage.put(&key, value).await);
            }
            Command::Delete { key, reply } => {
                let _ = reply.send(storage.delete(&key).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    fn schemas() -> SchemaMap {
        SchemaMap::from([
            ("name", KeySchema::string()),
            ("count", KeySchema::integer()),
            ("nickname", KeySchema::string().nullable()),
            ("seen_at", KeySchema::datetime()),
        ])
    }

    fn store_over(storage: Arc<dyn DurableStorage>, prefix: &str) -> (DurableKvStore, DeferredTasks) {
        let deferred = DeferredTasks::new();
        (
            DurableKvStore::new(storage, prefix, schemas(), deferred.clone()),
            deferred,
        )
    }

    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DurableStorage for CountingStorage {
        async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await
        }
    }

    #[test]
    fn schema_parse_rejects_wrong_types_and_null() {
        assert!(KeySchema::string().parse(&json!(5)).is_err());
        assert!(KeySchema::string().parse(&Value::Null).is_err());
        assert_eq!(
            KeySchema::string().nullable().parse(&Value::Null).unwrap(),
            Value::Null
        );
        assert!(KeySchema::integer().parse(&json!(1.5)).is_err());
        assert_eq!(KeySchema::integer().parse(&json!(7)).unwrap(), json!(7));
        assert_eq!(
            KeySchema::any().parse(&json!([1, "a"])).unwrap(),
            json!([1, "a"])
        );
    }

    #[test]
    fn datetime_schema_coerces_strings_and_epoch_millis() {
        let schema = KeySchema::datetime();
        assert_eq!(
            schema.parse(&json!("2024-01-02T03:04:05+02:00")).unwrap(),
            json!("2024-01-02T01:04:05.000Z")
        );
        assert_eq!(
            schema.parse(&json!(0)).unwrap(),
            json!("1970-01-01T00:00:00.000Z")
        );
        let err = schema.parse(&json!("yesterday")).unwrap_err();
        assert_eq!(err.expected, "datetime");
    }

    #[tokio::test]
    async fn get_returns_absent_for_unset_key_not_a_default() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        assert_eq!(store.get("name").await.unwrap(), None);
        assert_eq!(store.get("count").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get_returns_parsed_value() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        store.put("name", json!("alice")).unwrap();
        store
            .put("seen_at", json!("2024-05-06T07:08:09Z"))
            .unwrap();

        assert_eq!(store.get("name").await.unwrap(), Some(json!("alice")));
        assert_eq!(
            store.get("seen_at").await.unwrap(),
            Some(KeySchema::datetime().parse(&json!("2024-05-06T07:08:09Z")).unwrap())
        );
    }

    #[tokio::test]
    async fn later_put_wins() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "");
        for n in 0..20 {
            store.put("count", json!(n)).unwrap();
        }
        assert_eq!(store.get("count").await.unwrap(), Some(json!(19)));
    }

    #[tokio::test]
    async fn unknown_key_fails_before_touching_backend() {
        let storage = Arc::new(CountingStorage::default());
        let (store, deferred) = store_over(storage.clone(), "meta");

        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, KvError::UnknownKey(ref key) if key == "missing"));
        assert!(err.is_configuration_error());
        assert!(matches!(
            store.put("missing", json!("x")),
            Err(KvError::UnknownKey(_))
        ));
        assert!(matches!(
            store.get_or("missing", json!("x")).await,
            Err(KvError::UnknownKey(_))
        ));
        assert!(matches!(
            store.delete("missing").await,
            Err(KvError::UnknownKey(_))
        ));

        deferred.settle().await;
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_put_does_not_write() {
        let storage = Arc::new(CountingStorage::default());
        let (store, deferred) = store_over(storage.clone(), "meta");

        let err = store.put("count", json!("seven")).unwrap_err();
        assert!(matches!(err, KvError::Validation { ref key, .. } if key == "count"));
        assert_eq!(deferred.settle().await, 0);
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_or_uses_parsed_default_only_when_unset() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        assert_eq!(
            store
                .get_or("seen_at", json!("2020-01-01T00:00:00+01:00"))
                .await
                .unwrap(),
            json!("2019-12-31T23:00:00.000Z")
        );

        store.put("nickname", Value::Null).unwrap();
        assert_eq!(
            store.get_or("nickname", json!("fallback")).await.unwrap(),
            Value::Null
        );
        assert_eq!(store.get("nickname").await.unwrap(), Some(Value::Null));
    }

    #[tokio::test]
    async fn get_or_rejects_invalid_default() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        assert!(matches!(
            store.get_or("count", json!("many")).await,
            Err(KvError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn corrupted_stored_value_is_a_validation_error_even_with_default() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put("meta/count", json!("not a number")).await.unwrap();
        let (store, _) = store_over(storage, "meta");

        assert!(matches!(
            store.get("count").await,
            Err(KvError::Validation { .. })
        ));
        assert!(matches!(
            store.get_or("count", json!(1)).await,
            Err(KvError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn delete_reports_whether_value_existed() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        assert!(!store.delete("name").await.unwrap());
        store.put("name", json!("alice")).unwrap();
        assert!(store.delete("name").await.unwrap());
        assert_eq!(store.get("name").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefixes_isolate_stores_over_shared_backend() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let (left, left_scope) = store_over(storage.clone(), "left");
        let (right, right_scope) = store_over(storage.clone(), "right");
        let (bare, bare_scope) = store_over(storage.clone(), "");

        left.put("name", json!("l")).unwrap();
        right.put("name", json!("r")).unwrap();
        left_scope.settle().await;
        right_scope.settle().await;

        assert_eq!(left.get("name").await.unwrap(), Some(json!("l")));
        assert_eq!(right.get("name").await.unwrap(), Some(json!("r")));
        assert_eq!(bare.get("name").await.unwrap(), None);

        bare.put("name", json!("b")).unwrap();
        bare_scope.settle().await;
        assert_eq!(storage.get("name").await.unwrap(), Some(json!("b")));
        assert_eq!(storage.get("left/name").await.unwrap(), Some(json!("l")));
    }

    #[tokio::test]
    async fn nested_prefixes_do_not_share_keys() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let (outer, outer_scope) = store_over(storage.clone(), "a");
        let (inner, inner_scope) = store_over(storage.clone(), "a/name");

        outer.put("name", json!("outer")).unwrap();
        inner.put("name", json!("inner")).unwrap();
        outer_scope.settle().await;
        inner_scope.settle().await;

        assert_eq!(outer.get("name").await.unwrap(), Some(json!("outer")));
        assert_eq!(inner.get("name").await.unwrap(), Some(json!("inner")));
    }

    #[test]
    #[should_panic(expected = "invalid key 'b/c'")]
    fn keys_with_separator_are_rejected_at_construction() {
        let schemas = SchemaMap::from([("b/c", KeySchema::string())]);
        DurableKvStore::new(
            Arc::new(MemoryStorage::new()),
            "a",
            schemas,
            DeferredTasks::new(),
        );
    }

    #[tokio::test]
    async fn settled_scope_guarantees_write_reached_backend() {
        let storage = Arc::new(MemoryStorage::new());
        let (store, deferred) = store_over(storage.clone(), "meta");
        store.put("name", json!("durable")).unwrap();
        drop(store);

        assert_eq!(deferred.settle().await, 1);
        assert_eq!(
            storage.get("meta/name").await.unwrap(),
            Some(json!("durable"))
        );
    }

    #[tokio::test]
    async fn get_as_decodes_typed_values() {
        let (store, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
        store.put("count", json!(3)).unwrap();
        assert_eq!(store.get_as::<u32>("count").await.unwrap(), Some(3));
        assert_eq!(store.get_as::<String>("name").await.unwrap(), None);
        assert!(matches!(
            store.get_as::<String>("count").await,
            Err(KvError::Decode { .. })
        ));
    }

    #[test]
    fn storage_key_applies_prefix_only_when_non_empty() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (prefixed, _) = store_over(Arc::new(MemoryStorage::new()), "meta");
            let (bare, _) = store_over(Arc::new(MemoryStorage::new()), "");
            assert_eq!(prefixed.storage_key("name"), "meta/name");
            assert_eq!(bare.storage_key("name"), "name");
        });
    }
}
