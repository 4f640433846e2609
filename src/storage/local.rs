use crate::error::PkiError;
use crate::storage::traits::Storage;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const VALUE_SUFFIX: &str = ".val";
const TEMP_SUFFIX: &str = ".tmp";

/// File-per-key store rooted at a directory.
///
/// Values live at `<base>/<key>.val` so that a key and a sub-tree of the same
/// name (`acme/<id>` and `acme/<id>/orders/...`) can coexist.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn check_key(key: &str) -> Result<()> {
        // Reject rather than rewrite, so list() can always reproduce the key.
        let valid_chars = key.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ':' | '@')
        });
        if !valid_chars
            || key.starts_with('/')
            || key.split('/').any(|seg| seg == ".." || seg == ".")
        {
            return Err(PkiError::Storage(format!("invalid storage key: {key}")));
        }
        Ok(())
    }

    fn value_path(&self, key: &str) -> Result<PathBuf> {
        Self::check_key(key)?;
        if key.is_empty() || key.ends_with('/') {
            return Err(PkiError::Storage(format!("invalid storage key: {key:?}")));
        }
        Ok(self.base_path.join(format!("{key}{VALUE_SUFFIX}")))
    }

    fn dir_path(&self, prefix: &str) -> Result<PathBuf> {
        Self::check_key(prefix)?;
        Ok(self.base_path.join(prefix.trim_end_matches('/')))
    }

    /// Removes now-empty directories between `path` and the base directory.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.value_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.value_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers never see a partially written value.
        let tmp = path.with_extension(format!("val{TEMP_SUFFIX}"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.value_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.dir_path(prefix)?;
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if entry.file_type().await?.is_dir() {
                results.push(format!("{name}/"));
            } else if let Some(stem) = name.strip_suffix(VALUE_SUFFIX) {
                results.push(stem.to_string());
            }
        }

        results.sort();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        let serial = "certs/1a:2b:3c";
        storage.put(serial, Bytes::from_static(b"der")).await.unwrap();
        assert_eq!(storage.get(serial).await.unwrap(), Some(Bytes::from_static(b"der")));
        assert_eq!(storage.list("certs/").await.unwrap(), vec!["1a:2b:3c"]);

        storage.delete(serial).await.unwrap();
        assert_eq!(storage.get(serial).await.unwrap(), None);
        assert!(storage.list("certs/").await.unwrap().is_empty());
        storage.delete(serial).await.unwrap();
    }

    #[tokio::test]
    async fn test_key_and_subtree_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        storage.put("acme/acct1", Bytes::from_static(b"{}")).await.unwrap();
        storage
            .put("acme/acct1/orders/o1", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(storage.list("acme/").await.unwrap(), vec!["acct1", "acct1/"]);
        assert_eq!(storage.list("acme/acct1/orders/").await.unwrap(), vec!["o1"]);
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).unwrap();

        assert!(storage.get("../etc/passwd").await.is_err());
        assert!(storage.get("/abs").await.is_err());
        assert!(storage.put("role/a b", Bytes::new()).await.is_err());
    }
}
