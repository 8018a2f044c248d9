//! Core types for the tool inventory.

use std::fmt;

use rmcp::model::Tool;
use serde::{Deserialize, Serialize};

use crate::annotations::ToolAnnotations;

/// `hash(server_name + tool_name + description + input_schema)`, used to
/// detect when a re-listed tool's shape actually changed (triggers
/// re-indexing of just that record rather than a full catalogue rebuild).
pub fn fingerprint(server_key: &str, tool: &Tool) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(server_key.as_bytes());
    hasher.update(b"\0");
    hasher.update(tool.name.as_bytes());
    hasher.update(b"\0");
    if let Some(desc) = &tool.description {
        hasher.update(desc.as_bytes());
    }
    hasher.update(b"\0");
    if let Ok(schema) = serde_json::to_vec(&*tool.input_schema) {
        hasher.update(&schema);
    }
    *hasher.finalize().as_bytes()
}

/// Unique tool identifier: `server_key:tool_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedToolName {
    pub server_key: String,
    pub tool_name: String,
}

impl QualifiedToolName {
    pub fn new(server_key: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_key: server_key.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Parse from "server:tool" format.
    pub fn parse(s: &str) -> Option<Self> {
        let (server, tool) = s.split_once(':')?;
        Some(Self::new(server, tool))
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_key, self.tool_name)
    }
}

/// Tool entry with metadata for search ranking and change detection.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub qualified_name: QualifiedToolName,
    pub tool: Tool,
    pub fingerprint: [u8; 32],
    pub annotations: ToolAnnotations,
}

impl ToolEntry {
    pub fn new(qualified_name: QualifiedToolName, tool: Tool) -> Self {
        let fingerprint = fingerprint(&qualified_name.server_key, &tool);
        let annotations = ToolAnnotations::from_rmcp_option(tool.annotations.as_ref());
        Self {
            qualified_name,
            tool,
            fingerprint,
            annotations,
        }
    }

    pub fn from_server_tool(server_key: impl Into<String>, tool: Tool) -> Self {
        let name = tool.name.to_string();
        Self::new(QualifiedToolName::new(server_key, name), tool)
    }

    /// Recompute the fingerprint from the current tool definition. Called
    /// by the catalogue after a re-list to decide whether to re-index.
    pub fn refresh_fingerprint(&mut self) -> bool {
        let new_fp = fingerprint(&self.qualified_name.server_key, &self.tool);
        let changed = new_fp != self.fingerprint;
        self.fingerprint = new_fp;
        changed
    }

    #[must_use]
    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn server_key(&self) -> &str {
        &self.qualified_name.server_key
    }

    pub fn tool_name(&self) -> &str {
        &self.qualified_name.tool_name
    }
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, sync::Arc};

    use super::*;

    fn create_test_tool(name: &str) -> Tool {
        let schema_obj = serde_json::json!({
            "type": "object",
            "properties": {}
        });
        let schema_map = if let serde_json::Value::Object(m) = schema_obj {
            m
        } else {
            serde_json::Map::new()
        };

        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(format!("Test tool: {}", name))),
            input_schema: Arc::new(schema_map),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    #[test]
    fn test_qualified_tool_name() {
        let name = QualifiedToolName::new("server", "tool");
        assert_eq!(name.server_key, "server");
        assert_eq!(name.tool_name, "tool");
        assert_eq!(format!("{}", name), "server:tool");
    }

    #[test]
    fn test_qualified_tool_name_parse() {
        let parsed = QualifiedToolName::parse("brave:web_search").unwrap();
        assert_eq!(parsed.server_key, "brave");
        assert_eq!(parsed.tool_name, "web_search");

        assert!(QualifiedToolName::parse("no_colon").is_none());
    }

    #[test]
    fn test_tool_entry_creation() {
        let tool = create_test_tool("my_tool");
        let entry = ToolEntry::from_server_tool("my_server", tool);

        assert_eq!(entry.server_key(), "my_server");
        assert_eq!(entry.tool_name(), "my_tool");
    }

    #[test]
    fn test_tool_entry_refresh_fingerprint_detects_change() {
        let tool = create_test_tool("my_tool");
        let mut entry = ToolEntry::from_server_tool("my_server", tool);
        let original = entry.fingerprint;

        let mut changed_tool = create_test_tool("my_tool");
        changed_tool.description = Some(std::borrow::Cow::Borrowed("a different description"));
        entry.tool = changed_tool;

        assert!(entry.refresh_fingerprint());
        assert_ne!(entry.fingerprint, original);
        // Calling again with no further change reports no change.
        assert!(!entry.refresh_fingerprint());
    }
}
