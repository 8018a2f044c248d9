//! Response truncator + cache (C5): content-hash-addressed pagination for
//! oversize tool responses.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};
use crate::store::Store;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub content_hash: String,
    pub tool_name: String,
    pub original_args: serde_json::Value,
    pub records: Vec<String>,
    pub cached_at_unix: u64,
}

#[derive(Debug, Clone)]
pub struct TruncatedView {
    pub content_hash: Option<String>,
    pub preview: String,
    pub total_records: usize,
    pub shown_records: usize,
}

/// Splits a tool response into logical records: array-valued top-level
/// fields become one record per element, a plain string is split
/// line-wise, anything else is a single record holding its JSON text.
fn split_into_records(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .collect(),
        serde_json::Value::String(s) => s.lines().map(str::to_string).collect(),
        serde_json::Value::Object(map) => {
            if let Some((_, serde_json::Value::Array(items))) =
                map.iter().find(|(_, v)| v.is_array())
            {
                items
                    .iter()
                    .map(|v| serde_json::to_string(v).unwrap_or_default())
                    .collect()
            } else {
                vec![serde_json::to_string(value).unwrap_or_default()]
            }
        }
        other => vec![serde_json::to_string(other).unwrap_or_default()],
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct Truncator {
    store: std::sync::Arc<Store>,
    limit_bytes: usize,
}

impl Truncator {
    pub fn new(store: std::sync::Arc<Store>, limit_bytes: usize) -> Self {
        Self { store, limit_bytes }
    }

    /// Returns `None` if the serialized response already fits under the
    /// limit — no truncation needed.
    pub fn maybe_truncate(
        &self,
        tool_name: &str,
        original_args: &serde_json::Value,
        response: &serde_json::Value,
    ) -> McpResult<Option<TruncatedView>> {
        let serialized = serde_json::to_string(response)?;
        if serialized.len() <= self.limit_bytes {
            return Ok(None);
        }

        let content_hash = blake3::hash(serialized.as_bytes()).to_hex().to_string();
        let records = split_into_records(response);

        let cache_record = CacheRecord {
            content_hash: content_hash.clone(),
            tool_name: tool_name.to_string(),
            original_args: original_args.clone(),
            records: records.clone(),
            cached_at_unix: now_unix(),
        };

        match self.store.cache_put(&content_hash, &cache_record) {
            Ok(()) => {
                let mut shown = 0usize;
                let mut used_bytes = 0usize;
                for record in &records {
                    if used_bytes + record.len() > self.limit_bytes {
                        break;
                    }
                    used_bytes += record.len();
                    shown += 1;
                }
                shown = shown.max(1).min(records.len());
                let preview = records[..shown].join("\n");
                Ok(Some(TruncatedView {
                    content_hash: Some(content_hash.clone()),
                    preview: format!(
                        "{preview}\n\n[truncated {shown}/{total} records. Use read_cache tool: key=\"{content_hash}\"]",
                        total = records.len(),
                    ),
                    total_records: records.len(),
                    shown_records: shown,
                }))
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache store failed, falling back to byte-level truncation");
                let truncated = &serialized[..serialized.len().min(self.limit_bytes)];
                Ok(Some(TruncatedView {
                    content_hash: None,
                    preview: truncated.to_string(),
                    total_records: records.len(),
                    shown_records: 0,
                }))
            }
        }
    }

    /// `read_cache(key, offset, limit)`: returns `[offset, offset+limit)`
    /// records. `1 <= limit <= 1000`, `offset >= 0`.
    pub fn read_cache(&self, key: &str, offset: usize, limit: usize) -> McpResult<Vec<String>> {
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(McpError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        let record: CacheRecord = self
            .store
            .cache_get(key)?
            .ok_or_else(|| McpError::NotFound(format!("cache key '{key}'")))?;

        if self.is_expired(&record) {
            return Err(McpError::NotFound(format!("cache key '{key}' expired")));
        }

        let end = (offset + limit).min(record.records.len());
        if offset >= record.records.len() {
            return Ok(Vec::new());
        }
        Ok(record.records[offset..end].to_vec())
    }

    fn is_expired(&self, record: &CacheRecord) -> bool {
        now_unix().saturating_sub(record.cached_at_unix) > DEFAULT_CACHE_TTL.as_secs()
    }
}
