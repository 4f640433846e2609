use crate::storage::traits::{children_of, Storage};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local store used by tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let keys = entries
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        Ok(children_of(keys, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_list() {
        let store = InMemoryStorage::new();
        store.put("certs/01", Bytes::from_static(b"a")).await.unwrap();
        store.put("certs/02", Bytes::from_static(b"b")).await.unwrap();
        store.put("revoked/01", Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(store.get("certs/01").await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(store.list("certs/").await.unwrap(), vec!["01", "02"]);

        store.delete("certs/01").await.unwrap();
        store.delete("certs/missing").await.unwrap();
        assert_eq!(store.get("certs/01").await.unwrap(), None);
        assert_eq!(store.list("certs/").await.unwrap(), vec!["02"]);
        assert_eq!(store.len(), 2);
    }
}
