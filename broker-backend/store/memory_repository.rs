use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::broker::BrokerAction;

use super::repository::{ActionRepository, Entity, Repository};

/// Volatile store. Used by tests and `--ephemeral` runs.
pub struct MemoryRepository<T: Entity> {
    records: RwLock<HashMap<String, T>>,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn save(&self, entity: T) -> Result<()> {
        self.records
            .write()
            .await
            .insert(entity.entity_id().to_string(), entity);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn load_all(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryActionRepository {
    actions: RwLock<Vec<BrokerAction>>,
}

impl MemoryActionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionRepository for MemoryActionRepository {
    async fn append(&self, action: BrokerAction) -> Result<()> {
        self.actions.write().await.push(action);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Vec<BrokerAction>> {
        Ok(self
            .actions
            .read()
            .await
            .iter()
            .filter(|a| a.id == id)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<BrokerAction>> {
        Ok(self.actions.read().await.clone())
    }

    async fn load_all(&self) -> Result<()> {
        Ok(())
    }
}
