pub mod file_repository;
pub mod memory_repository;
pub mod repository;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::broker::{SanitizeScript, ServiceInstance, ServiceInstanceBinding};
use file_repository::{FileActionRepository, FileRepository};
use memory_repository::{MemoryActionRepository, MemoryRepository};
use repository::{ActionRepository, Repository};

/// The repositories the broker runs on.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn Repository<ServiceInstance>>,
    pub bindings: Arc<dyn Repository<ServiceInstanceBinding>>,
    pub actions: Arc<dyn ActionRepository>,
    pub scripts: Arc<dyn Repository<SanitizeScript>>,
}

impl Stores {
    /// File-backed stores under `data_dir`, loaded from disk.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let stores = Self {
            instances: Arc::new(FileRepository::<ServiceInstance>::new(data_dir)),
            bindings: Arc::new(FileRepository::<ServiceInstanceBinding>::new(data_dir)),
            actions: Arc::new(FileActionRepository::new(data_dir)),
            scripts: Arc::new(FileRepository::<SanitizeScript>::new(data_dir)),
        };
        stores
            .instances
            .load_all()
            .await
            .context("failed to load service instances")?;
        stores
            .bindings
            .load_all()
            .await
            .context("failed to load bindings")?;
        stores
            .actions
            .load_all()
            .await
            .context("failed to load action log")?;
        stores
            .scripts
            .load_all()
            .await
            .context("failed to load sanitize script")?;
        Ok(stores)
    }

    pub fn in_memory() -> Self {
        Self {
            instances: Arc::new(MemoryRepository::<ServiceInstance>::new()),
            bindings: Arc::new(MemoryRepository::<ServiceInstanceBinding>::new()),
            actions: Arc::new(MemoryActionRepository::new()),
            scripts: Arc::new(MemoryRepository::<SanitizeScript>::new()),
        }
    }
}
