//! Local filesystem service with base-directory sandboxing.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::ServiceError;

/// Narrow file port used by the `db` and `end` handlers.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, ServiceError>;
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, ServiceError>;
    /// Write, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<(), ServiceError>;
    async fn append(&self, path: &str, content: &str) -> Result<(), ServiceError>;
    async fn exists(&self, path: &str) -> bool;
}

/// Filesystem implementation rooted at a base directory. Relative paths are
/// resolved under the base; absolute paths and `..` components are rejected
/// so diagram-controlled paths cannot escape it.
pub struct LocalFileService {
    base_dir: PathBuf,
}

impl LocalFileService {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ServiceError> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(ServiceError::PathEscapes(path.to_string()));
        }
        for component in candidate.components() {
            if matches!(component, Component::ParentDir) {
                return Err(ServiceError::PathEscapes(path.to_string()));
            }
        }
        Ok(self.base_dir.join(candidate))
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn read(&self, path: &str) -> Result<String, ServiceError> {
        let full = self.resolve(path)?;
        fs::read_to_string(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(path.to_string())
            } else {
                ServiceError::Io(e)
            }
        })
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>, ServiceError> {
        let full = self.resolve(path)?;
        fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(path.to_string())
            } else {
                ServiceError::Io(e)
            }
        })
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), ServiceError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, content).await?;
        Ok(())
    }

    async fn append(&self, path: &str, content: &str) -> Result<(), ServiceError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut existing = match fs::read_to_string(&full).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(ServiceError::Io(e)),
        };
        existing.push_str(content);
        fs::write(&full, existing).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, LocalFileService) {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalFileService::new(dir.path());
        (dir, service)
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let (_dir, service) = service();
        service.write("nested/deep/out.txt", "HI").await.unwrap();
        assert_eq!(service.read("nested/deep/out.txt").await.unwrap(), "HI");
    }

    #[tokio::test]
    async fn test_append_to_missing_file_creates_it() {
        let (_dir, service) = service();
        service.append("log.txt", "a").await.unwrap();
        service.append("log.txt", "b").await.unwrap();
        assert_eq!(service.read("log.txt").await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, service) = service();
        assert!(matches!(
            service.read("../outside.txt").await,
            Err(ServiceError::PathEscapes(_))
        ));
        assert!(matches!(
            service.write("/etc/hosts", "x").await,
            Err(ServiceError::PathEscapes(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_dir, service) = service();
        assert!(matches!(service.read("ghost.txt").await, Err(ServiceError::NotFound(_))));
        assert!(!service.exists("ghost.txt").await);
    }
}
