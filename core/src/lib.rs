//! Shared building blocks for the Cloudflare MCP servers: per-entity durable
//! state, the bounded polling helper and the analytics event mapper.

pub mod deferred;
pub mod entity;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod poll;
pub mod storage;
pub mod user_details;

pub use deferred::DeferredTasks;
pub use entity::EntityId;
pub use error::{KvError, MetricsError, PollError, StorageError, ValidationError};
pub use kv::{DurableKvStore, KeySchema, SchemaMap, ValueKind};
pub use metrics::{AnalyticsSink, DataPoint, MetricsEvent, MetricsTracker, ServerInfo};
pub use poll::{PollConfig, poll_until_ready, poll_until_some};
pub use storage::{DurableStorage, StorageProvider};
pub use user_details::UserDetails;
