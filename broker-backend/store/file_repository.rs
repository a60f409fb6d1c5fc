use std::collections::HashMap;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::broker::BrokerAction;

use super::repository::{ActionRepository, Entity, Repository};

/// Ids become file names, so anything that could leave the directory is refused.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        bail!("invalid record id: {id:?}");
    }
    Ok(())
}

/// File-based store: in-memory `RwLock<HashMap>` backed by one JSON file per
/// record at `{base_dir}/{KIND}/{id}.json`.
pub struct FileRepository<T: Entity> {
    records: RwLock<HashMap<String, T>>,
    dir: PathBuf,
    _kind: PhantomData<T>,
}

impl<T: Entity> FileRepository<T> {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: base_dir.as_ref().join(T::KIND),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for FileRepository<T> {
    async fn save(&self, entity: T) -> Result<()> {
        let id = entity.entity_id().to_string();
        check_id(&id)?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {} dir: {}", T::KIND, self.dir.display()))?;
        let path = self.dir.join(format!("{id}.json"));
        let content = serde_json::to_string_pretty(&entity)
            .with_context(|| format!("failed to serialize {} record {id}", T::KIND))?;

        // Atomic write via temp file + rename
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename {}", tmp_path.display()))?;

        self.records.write().await.insert(id, entity);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<T>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        check_id(id)?;
        let path = self.dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
        }
        Ok(self.records.write().await.remove(id).is_some())
    }

    /// Load all JSON files from disk into the in-memory map.
    async fn load_all(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create {} dir: {}", T::KIND, self.dir.display()))?;
            return Ok(());
        }

        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<T>(&content) {
                    Ok(record) => {
                        map.insert(record.entity_id().to_string(), record);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, kind = T::KIND, "failed to parse record file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, kind = T::KIND, "failed to read record file");
                }
            }
        }

        tracing::info!(count = map.len(), kind = T::KIND, "loaded records");
        *self.records.write().await = map;
        Ok(())
    }
}

/// Action log as JSON lines at `{base_dir}/actions.jsonl`, mirrored in memory.
pub struct FileActionRepository {
    actions: RwLock<Vec<BrokerAction>>,
    path: PathBuf,
}

impl FileActionRepository {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            actions: RwLock::new(Vec::new()),
            path: base_dir.as_ref().join("actions.jsonl"),
        }
    }
}

#[async_trait]
impl ActionRepository for FileActionRepository {
    async fn append(&self, action: BrokerAction) -> Result<()> {
        let mut line = serde_json::to_string(&action).context("failed to serialize action")?;
        line.push('\n');

        // Hold the write lock across the file append so lines never interleave.
        let mut actions = self.actions.write().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        actions.push(action);
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
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };

        let mut loaded = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BrokerAction>(line) {
                Ok(action) => loaded.push(action),
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "skipping malformed action log line");
                }
            }
        }

        tracing::info!(count = loaded.len(), "loaded action log");
        *self.actions.write().await = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerActionState, InstanceState, ServiceInstance};
    use chrono::Utc;

    fn instance(id: &str, state: InstanceState) -> ServiceInstance {
        ServiceInstance {
            service_instance_id: id.to_string(),
            copy_id: Some(format!("copy-{id}")),
            source_instance_id: "src-A".to_string(),
            state,
            message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_instance_crud() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepository::<ServiceInstance>::new(tmp.path());
        repo.load_all().await.unwrap();

        repo.save(instance("svc-1", InstanceState::InProgress)).await.unwrap();
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
        assert!(tmp.path().join("instances").join("svc-1.json").exists());

        let mut fetched = repo.find_by_id("svc-1").await.unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::InProgress);

        fetched.state = InstanceState::Succeeded;
        repo.save(fetched).await.unwrap();
        let fetched = repo.find_by_id("svc-1").await.unwrap().unwrap();
        assert_eq!(fetched.state, InstanceState::Succeeded);

        assert!(repo.delete("svc-1").await.unwrap());
        assert!(!repo.delete("svc-1").await.unwrap());
        assert!(repo.find_by_id("svc-1").await.unwrap().is_none());
        assert!(!tmp.path().join("instances").join("svc-1.json").exists());
    }

    #[tokio::test]
    async fn test_instance_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepository::<ServiceInstance>::new(tmp.path());
        repo.load_all().await.unwrap();
        repo.save(instance("svc-1", InstanceState::Gone)).await.unwrap();

        let reloaded = FileRepository::<ServiceInstance>::new(tmp.path());
        reloaded.load_all().await.unwrap();
        let loaded = reloaded.find_by_id("svc-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, InstanceState::Gone);
        assert_eq!(loaded.copy_id.as_deref(), Some("copy-svc-1"));
    }

    #[tokio::test]
    async fn test_load_skips_unparseable_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("instances");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let repo = FileRepository::<ServiceInstance>::new(tmp.path());
        repo.load_all().await.unwrap();
        assert!(repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepository::<ServiceInstance>::new(tmp.path());
        assert!(repo.save(instance("../escape", InstanceState::InProgress)).await.is_err());
        assert!(repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_action_log_appends_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileActionRepository::new(tmp.path());
        repo.load_all().await.unwrap();

        repo.append(BrokerAction::new("bind-1", BrokerActionState::InProgress, "binding"))
            .await
            .unwrap();
        repo.append(BrokerAction::new("svc-1", BrokerActionState::InProgress, "provisioning"))
            .await
            .unwrap();
        repo.append(BrokerAction::new("bind-1", BrokerActionState::Complete, "bound"))
            .await
            .unwrap();

        let reloaded = FileActionRepository::new(tmp.path());
        reloaded.load_all().await.unwrap();
        let history = reloaded.find_by_id("bind-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, BrokerActionState::InProgress);
        assert_eq!(history[1].state, BrokerActionState::Complete);
        assert_eq!(reloaded.find_all().await.unwrap().len(), 3);
    }
}
