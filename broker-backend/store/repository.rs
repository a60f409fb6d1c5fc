use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::broker::BrokerAction;

/// A record a `Repository` can hold, keyed by a string id.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection name; also the subdirectory used by the file backend.
    const KIND: &'static str;

    fn entity_id(&self) -> &str;
}

/// CRUD store for one entity type.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Insert or replace by `entity_id()`.
    async fn save(&self, entity: T) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;
    async fn find_all(&self) -> Result<Vec<T>>;
    /// Returns whether a record existed.
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn load_all(&self) -> Result<()>;
}

/// Append-only store for the action log.
#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn append(&self, action: BrokerAction) -> Result<()>;
    /// Entries for one operation id, oldest first.
    async fn find_by_id(&self, id: &str) -> Result<Vec<BrokerAction>>;
    async fn find_all(&self) -> Result<Vec<BrokerAction>>;
    async fn load_all(&self) -> Result<()>;
}
