use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Writes to a sibling temp file and renames it over `path`, so readers
    /// see either the old content, nothing, or the complete new content.
    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        let tmp = format!("{}.tmp-{}", path, uuid::Uuid::new_v4().simple());
        self.write(&tmp, content).await?;
        if let Err(e) = self.rename(&tmp, path).await {
            let _ = self.delete(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Reads and parses a JSON file through any storage backend.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    storage: &dyn Storage,
    path: &str,
) -> Result<T> {
    let bytes = storage.read(path).await?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path))
}

/// Serializes `value` as pretty JSON and publishes it atomically.
pub async fn write_json<T: serde::Serialize + ?Sized>(
    storage: &dyn Storage,
    path: &str,
    value: &T,
) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    storage.write_atomic(path, content.as_bytes()).await
}

pub fn join(base: &str, parts: &[&str]) -> String {
    let mut path = Path::new(base).to_path_buf();
    for part in parts {
        path.push(part);
    }
    path.to_string_lossy().to_string()
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to rename {} to {}", from, to))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if path.exists() {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let target = join(&dir.path().to_string_lossy(), &["nested", "out.json"]);

        storage.write_atomic(&target, b"{\"a\":1}").await?;
        storage.write_atomic(&target, b"{\"a\":2}").await?;

        assert_eq!(storage.read(&target).await?, b"{\"a\":2}");
        let parent = join(&dir.path().to_string_lossy(), &["nested"]);
        let entries = storage.list(&parent).await?;
        assert_eq!(entries.len(), 1, "unexpected files: {:?}", entries);
        Ok(())
    }

    #[tokio::test]
    async fn test_json_round_trip_through_helpers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = join(&dir.path().to_string_lossy(), &["list.json"]);

        write_json(&storage, &path, &vec![1, 2, 3]).await?;
        let back: Vec<u32> = read_json(&storage, &path).await?;
        assert_eq!(back, vec![1, 2, 3]);
        Ok(())
    }
}
