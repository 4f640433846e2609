use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Durable key/value store backing the engine.
///
/// Keys are `/`-separated paths. A `put` returns only after the value is durable.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Immediate children of `prefix` with the prefix stripped; sub-trees end in `/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Shared helper for backends that keep a flat, ordered key space.
pub(crate) fn children_of<'a>(keys: impl Iterator<Item = &'a str>, prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let child = match rest.find('/') {
            Some(idx) => &rest[..=idx],
            None => rest,
        };
        if !out.iter().any(|c| c == child) {
            out.push(child.to_string());
        }
    }
    out
}
