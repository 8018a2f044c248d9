//! Persisted KV store: an embedded, ordered-key store for everything that
//! isn't the desired-config JSON — OAuth tokens, tool-call history, and
//! truncation-cache payloads.

use std::{path::Path, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use sled::Tree;

use crate::error::McpResult;

/// Logical bucket names, mirrored 1:1 onto `sled::Tree`s (§6 "Persisted
/// state layout").
pub const BUCKET_SERVERS: &str = "servers";
pub const BUCKET_TOOL_CALLS: &str = "tool_calls";
pub const BUCKET_CACHE: &str = "cache";

fn tokens_bucket(server: &str) -> String {
    format!("tokens-{server}")
}

fn cache_bucket(content_hash: &str) -> String {
    format!("cache-{content_hash}")
}

/// Thin wrapper over a `sled::Db` exposing JSON-valued, ordered-key trees.
/// Keys that encode an integer (tool-call ids, cache record offsets) use
/// big-endian bytes so lexicographic sled ordering matches numeric order.
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(data_dir: &Path) -> McpResult<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join("state.sled"))?;
        Ok(Arc::new(Self { db }))
    }

    fn tree(&self, name: &str) -> McpResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Big-endian encodes `n` for use as a sled key so that iteration
    /// order matches numeric order.
    pub fn be_key(n: u64) -> [u8; 8] {
        n.to_be_bytes()
    }

    pub fn put_json<T: Serialize>(&self, bucket: &str, key: &[u8], value: &T) -> McpResult<()> {
        let tree = self.tree(bucket)?;
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key, bytes)?;
        tree.flush()?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, bucket: &str, key: &[u8]) -> McpResult<Option<T>> {
        let tree = self.tree(bucket)?;
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, bucket: &str, key: &[u8]) -> McpResult<()> {
        let tree = self.tree(bucket)?;
        tree.remove(key)?;
        Ok(())
    }

    /// Iterates `[start, end)` over `bucket` in key order, deserializing
    /// each value as `T`. Used for paged tool-call history queries.
    pub fn range_json<T: DeserializeOwned>(
        &self,
        bucket: &str,
        start: &[u8],
        end: &[u8],
    ) -> McpResult<Vec<T>> {
        let tree = self.tree(bucket)?;
        let mut out = Vec::new();
        for item in tree.range(start.to_vec()..end.to_vec()) {
            let (_, bytes) = item?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    pub fn server_tokens_put<T: Serialize>(&self, server: &str, token: &T) -> McpResult<()> {
        self.put_json(&tokens_bucket(server), b"token", token)
    }

    pub fn server_tokens_get<T: DeserializeOwned>(&self, server: &str) -> McpResult<Option<T>> {
        self.get_json(&tokens_bucket(server), b"token")
    }

    pub fn server_tokens_clear(&self, server: &str) -> McpResult<()> {
        self.remove(&tokens_bucket(server), b"token")
    }

    pub fn cache_put<T: Serialize>(&self, content_hash: &str, value: &T) -> McpResult<()> {
        self.put_json(&cache_bucket(content_hash), b"payload", value)
    }

    pub fn cache_get<T: DeserializeOwned>(&self, content_hash: &str) -> McpResult<Option<T>> {
        self.get_json(&cache_bucket(content_hash), b"payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn test_put_get_json_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .put_json(BUCKET_SERVERS, b"echo", &Sample { value: 42 })
            .unwrap();
        let got: Option<Sample> = store.get_json(BUCKET_SERVERS, b"echo").unwrap();
        assert_eq!(got, Some(Sample { value: 42 }));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .put_json(BUCKET_SERVERS, b"echo", &Sample { value: 1 })
            .unwrap();
        store.remove(BUCKET_SERVERS, b"echo").unwrap();
        let got: Option<Sample> = store.get_json(BUCKET_SERVERS, b"echo").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_range_json_ordering() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for n in [3u64, 1, 2] {
            store
                .put_json(BUCKET_TOOL_CALLS, &Store::be_key(n), &Sample { value: n as u32 })
                .unwrap();
        }
        let results: Vec<Sample> = store
            .range_json(BUCKET_TOOL_CALLS, &Store::be_key(0), &Store::be_key(100))
            .unwrap();
        assert_eq!(
            results,
            vec![
                Sample { value: 1 },
                Sample { value: 2 },
                Sample { value: 3 },
            ]
        );
    }

    #[test]
    fn test_tokens_and_cache_helpers() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.server_tokens_put("brave", &Sample { value: 7 }).unwrap();
        assert_eq!(
            store.server_tokens_get::<Sample>("brave").unwrap(),
            Some(Sample { value: 7 })
        );
        store.server_tokens_clear("brave").unwrap();
        assert_eq!(store.server_tokens_get::<Sample>("brave").unwrap(), None);

        store.cache_put("abc123", &Sample { value: 9 }).unwrap();
        assert_eq!(
            store.cache_get::<Sample>("abc123").unwrap(),
            Some(Sample { value: 9 })
        );
    }
}
