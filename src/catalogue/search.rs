//! BM25 ranking over the tool catalogue.
//!
//! No off-the-shelf search crate is pulled in for this — the corpus has
//! none, and the document set (tool descriptions) is small enough that a
//! plain in-memory postings map rebuilt on each catalogue change is simpler
//! than wiring up an external index.

use std::collections::HashMap;

use super::index::ToolInventory;
use super::types::QualifiedToolName;

const K1: f64 = 1.2;
const B: f64 = 0.75;
const MAX_RESULTS: usize = 100;

/// Splits on anything that isn't `[a-z0-9_:]`, lowercasing first. `_` and
/// `:` are kept as part of tokens since they carry meaning in tool names
/// (`server:tool`, `snake_case` words).
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// One scored match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub tool: QualifiedToolName,
    pub score: f64,
}

struct Document {
    tool: QualifiedToolName,
    term_counts: HashMap<String, u32>,
    length: u32,
}

/// A BM25 index snapshot built from the catalogue at a point in time.
/// Rebuild after tools are added/removed/re-fingerprinted; cheap enough
/// (a handful of short documents) to redo on every catalogue mutation
/// rather than maintain incremental postings.
pub struct SearchIndex {
    documents: Vec<Document>,
    document_frequency: HashMap<String, u32>,
    avg_doc_len: f64,
}

impl SearchIndex {
    /// Builds a fresh index from every tool currently in `inventory`,
    /// including its qualified name, description, and top-level schema
    /// property keys as searchable text.
    pub fn build(inventory: &ToolInventory) -> Self {
        let mut documents = Vec::new();
        let mut document_frequency: HashMap<String, u32> = HashMap::new();
        let mut total_len: u64 = 0;

        for (qualified, tool) in inventory.list_tools_qualified() {
            let mut text = format!("{} {} {}", qualified.server_key, qualified.tool_name, qualified);
            if let Some(desc) = &tool.description {
                text.push(' ');
                text.push_str(desc);
            }
            if let Some(obj) = tool.input_schema.get("properties").and_then(|v| v.as_object()) {
                for key in obj.keys() {
                    text.push(' ');
                    text.push_str(key);
                }
            }

            let tokens = tokenize(&text);
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_counts.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_counts.keys() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }

            let length = tokens.len() as u32;
            total_len += u64::from(length);
            documents.push(Document {
                tool: qualified,
                term_counts,
                length,
            });
        }

        let avg_doc_len = if documents.is_empty() {
            0.0
        } else {
            total_len as f64 / documents.len() as f64
        };

        Self {
            documents,
            document_frequency,
            avg_doc_len,
        }
    }

    /// Ranks tools against `query` with the standard Okapi BM25 formula.
    /// Ties break on lexicographic `server:tool` so results are stable
    /// across rebuilds. Caps at 100 hits regardless of `limit`.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let limit = limit.min(MAX_RESULTS);
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.documents.is_empty() {
            return Vec::new();
        }

        let n = self.documents.len() as f64;
        let mut hits: Vec<SearchHit> = Vec::new();

        for doc in &self.documents {
            let mut score = 0.0;
            for term in &query_terms {
                let Some(&count) = doc.term_counts.get(term) else {
                    continue;
                };
                let df = *self.document_frequency.get(term).unwrap_or(&0) as f64;
                if df == 0.0 {
                    continue;
                }
                let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                let tf = count as f64;
                let norm = 1.0 - B + B * (doc.length as f64 / self.avg_doc_len.max(1.0));
                score += idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
            }
            if score > 0.0 {
                hits.push(SearchHit {
                    tool: doc.tool.clone(),
                    score,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool.to_string().cmp(&b.tool.to_string()))
        });
        hits.truncate(limit);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::types::ToolEntry;
    use rmcp::model::Tool;
    use std::borrow::Cow;
    use std::sync::Arc;

    fn tool(name: &str, description: &str) -> Tool {
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(description.to_string())),
            input_schema: Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    fn sample_inventory() -> ToolInventory {
        let inventory = ToolInventory::new();
        inventory.insert_entry(ToolEntry::from_server_tool(
            "brave",
            tool("brave_web_search", "Search the web for current information"),
        ));
        inventory.insert_entry(ToolEntry::from_server_tool(
            "fs",
            tool("read_file", "Read the contents of a file from disk"),
        ));
        inventory.insert_entry(ToolEntry::from_server_tool(
            "fs",
            tool("write_file", "Write content to a file on disk"),
        ));
        inventory
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("brave:brave_web_search Search!"),
            vec!["brave:brave_web_search", "search"]
        );
    }

    #[test]
    fn test_search_ranks_relevant_tool_first() {
        let inventory = sample_inventory();
        let index = SearchIndex::build(&inventory);
        let hits = index.search("web search", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].tool.tool_name, "brave_web_search");
    }

    #[test]
    fn test_search_matches_multiple_docs() {
        let inventory = sample_inventory();
        let index = SearchIndex::build(&inventory);
        let hits = index.search("file disk", 10);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_search_empty_query_returns_nothing() {
        let inventory = sample_inventory();
        let index = SearchIndex::build(&inventory);
        assert!(index.search("", 10).is_empty());
    }

    #[test]
    fn test_search_respects_limit() {
        let inventory = sample_inventory();
        let index = SearchIndex::build(&inventory);
        let hits = index.search("file", 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_search_unmatched_term_scores_nothing() {
        let inventory = sample_inventory();
        let index = SearchIndex::build(&inventory);
        assert!(index.search("nonexistent_xyz", 10).is_empty());
    }
}
