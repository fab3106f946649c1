use serde_json::Value;

use crate::deferred::DeferredTasks;
use crate::entity::EntityId;
use crate::error::KvError;
use crate::kv::{DurableKvStore, KeySchema, SchemaMap};
use crate::storage::StorageProvider;

pub const USER_DETAILS_NAMESPACE: &str = "user_details";
const USER_DETAILS_PREFIX: &str = "meta";
const ACTIVE_ACCOUNT_ID: &str = "active_account_id";

/// Session-spanning state for one user: the account they last selected.
///
/// Created lazily on first access. The same user id always opens the same
/// entity, so separate connections agree on the active account. Writes are
/// last-write-wins.
pub struct UserDetails {
    user_id: String,
    store: DurableKvStore,
}

impl UserDetails {
    pub fn open(provider: &dyn StorageProvider, user_id: &str, deferred: DeferredTasks) -> Self {
        let entity = EntityId::from_name(USER_DETAILS_NAMESPACE, user_id);
        let schemas = SchemaMap::from([(ACTIVE_ACCOUNT_ID, KeySchema::string())]);
        Self {
            user_id: user_id.to_string(),
            store: DurableKvStore::new(
                provider.storage_for(&entity),
                USER_DETAILS_PREFIX,
                schemas,
                deferred,
            ),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn active_account_id(&self) -> Result<Option<String>, KvError> {
        self.store.get_as(ACTIVE_ACCOUNT_ID).await
    }

    pub fn set_active_account_id(&self, account_id: &str) -> Result<(), KvError> {
        self.store
            .put(ACTIVE_ACCOUNT_ID, Value::String(account_id.to_string()))
    }
}
