//! Diagram storage port: where the CLI and engine find diagram files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::fs;

use super::ServiceError;

/// Listing entry for stored diagrams.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DiagramStorage: Send + Sync {
    /// Resolve a diagram id to a readable path.
    async fn find_by_id(&self, id: &str) -> Result<String, ServiceError>;
    async fn read_file(&self, path: &str) -> Result<String, ServiceError>;
    async fn write_file(&self, path: &str, data: &str) -> Result<(), ServiceError>;
    async fn list_files(&self) -> Result<Vec<FileInfo>, ServiceError>;
    async fn delete_file(&self, path: &str) -> Result<(), ServiceError>;
}

/// Filesystem storage: diagrams are `<id>.yaml` / `<id>.json` files under a
/// base directory.
pub struct LocalDiagramStorage {
    base_dir: PathBuf,
}

impl LocalDiagramStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }
}

#[async_trait]
impl DiagramStorage for LocalDiagramStorage {
    async fn find_by_id(&self, id: &str) -> Result<String, ServiceError> {
        for extension in ["yaml", "yml", "json"] {
            let candidate = self.base_dir.join(format!("{id}.{extension}"));
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate.to_string_lossy().into_owned());
            }
        }
        Err(ServiceError::NotFound(format!("diagram '{id}'")))
    }

    async fn read_file(&self, path: &str) -> Result<String, ServiceError> {
        fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(path.to_string())
            } else {
                ServiceError::Io(e)
            }
        })
    }

    async fn write_file(&self, path: &str, data: &str) -> Result<(), ServiceError> {
        let full = PathBuf::from(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, data).await?;
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, ServiceError> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(ServiceError::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(FileInfo {
                path: entry.path().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::from),
            });
        }
        Ok(entries)
    }

    async fn delete_file(&self, path: &str) -> Result<(), ServiceError> {
        fs::remove_file(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(path.to_string())
            } else {
                ServiceError::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_by_id_tries_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDiagramStorage::new(dir.path());

        let path = dir.path().join("flow.yaml");
        fs::write(&path, "nodes: []").await.unwrap();

        let found = storage.find_by_id("flow").await.unwrap();
        assert!(found.ends_with("flow.yaml"));
        assert!(storage.find_by_id("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDiagramStorage::new(dir.path());
        storage
            .write_file(&dir.path().join("a.json").to_string_lossy(), "{}")
            .await
            .unwrap();

        let files = storage.list_files().await.unwrap();
        assert_eq!(files.len(), 1);

        storage.delete_file(&files[0].path).await.unwrap();
        assert!(storage.list_files().await.unwrap().is_empty());
    }
}
