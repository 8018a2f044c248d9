//! Data-flow security engine (C6): per-session origin tracking used to
//! detect internal→external exfiltration.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{FlowPolicyConfig, PolicyMode};
use crate::tenant::SessionId;

pub const DEFAULT_MAX_ENTRIES_PER_SESSION: usize = 10_000;
pub const DEFAULT_HASH_MIN_LENGTH: usize = 20;
pub const DEFAULT_MAX_RESPONSE_HASH_BYTES: usize = 65_536;
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
pub const HOOK_CORRELATION_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerClass {
    Internal,
    External,
    Unknown,
}

/// Classifies an upstream by explicit tag first, falling back to
/// name-substring matching against configured pattern lists.
pub fn classify(server_name: &str, explicit: Option<&str>, internal: &[String], external: &[String]) -> ServerClass {
    if let Some(tag) = explicit {
        return match tag {
            "internal" => ServerClass::Internal,
            "external" => ServerClass::External,
            _ => ServerClass::Unknown,
        };
    }
    let lower = server_name.to_lowercase();
    if internal.iter().any(|p| lower.contains(&p.to_lowercase())) {
        return ServerClass::Internal;
    }
    if external.iter().any(|p| lower.contains(&p.to_lowercase())) {
        return ServerClass::External;
    }
    ServerClass::Unknown
}

pub fn default_internal_patterns() -> Vec<String> {
    vec!["postgres".into(), "db".into(), "internal".into(), "mysql".into(), "redis".into()]
}

pub fn default_external_patterns() -> Vec<String> {
    vec!["slack".into(), "web".into(), "fetch".into(), "http".into(), ".com".into()]
}

#[derive(Debug, Clone)]
pub struct OriginEntry {
    pub server_name: String,
    pub class: ServerClass,
    pub tool_name: String,
    pub first_seen: Instant,
    pub sensitive: bool,
}

/// Bounded, oldest-first-evicted map of `content_hash -> OriginEntry` for
/// one MCP session.
struct OriginMap {
    entries: HashMap<String, OriginEntry>,
    insertion_order: std::collections::VecDeque<String>,
    max_entries: usize,
    last_touched: Instant,
}

impl OriginMap {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: std::collections::VecDeque::new(),
            max_entries,
            last_touched: Instant::now(),
        }
    }

    fn insert(&mut self, hash: String, entry: OriginEntry) {
        self.last_touched = Instant::now();
        if !self.entries.contains_key(&hash) {
            self.insertion_order.push_back(hash.clone());
            while self.insertion_order.len() > self.max_entries {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(hash, entry);
    }

    fn get(&self, hash: &str) -> Option<&OriginEntry> {
        self.entries.get(hash)
    }

    fn is_idle_expired(&self) -> bool {
        self.last_touched.elapsed() > SESSION_IDLE_TTL
    }
}

/// Walks leaf strings in a JSON value (objects/arrays recursively, plain
/// strings directly), hashing each one ≥ `min_length` bytes, up to
/// `max_bytes` processed total. Shared by origin recording (response
/// walk) and policy evaluation (request-argument walk).
pub fn hash_leaf_strings(value: &Value, min_length: usize, max_bytes: usize) -> Vec<String> {
    let mut hashes = Vec::new();
    let mut processed = 0usize;
    let mut stack = vec![value];
    while let Some(current) = stack.pop() {
        if processed >= max_bytes {
            break;
        }
        match current {
            Value::String(s) => {
                if s.len() >= min_length {
                    processed += s.len();
                    hashes.push(blake3::hash(s.as_bytes()).to_hex().to_string());
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => stack.extend(map.values()),
            _ => {}
        }
    }
    hashes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDecision {
    Allow,
    Warn,
    Deny,
}

impl From<PolicyMode> for FlowDecision {
    fn from(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::Allow => FlowDecision::Allow,
            PolicyMode::Warn => FlowDecision::Warn,
            PolicyMode::Deny => FlowDecision::Deny,
        }
    }
}

/// Per-process data-flow engine: one `OriginMap` per active session.
pub struct DataFlowEngine {
    sessions: DashMap<SessionId, Mutex<OriginMap>>,
    max_entries_per_session: usize,
    hash_min_length: usize,
    max_response_hash_bytes: usize,
    policy: FlowPolicyConfig,
    internal_patterns: Vec<String>,
    external_patterns: Vec<String>,
}

impl DataFlowEngine {
    pub fn new(policy: FlowPolicyConfig, internal_patterns: Vec<String>, external_patterns: Vec<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            max_entries_per_session: DEFAULT_MAX_ENTRIES_PER_SESSION,
            hash_min_length: DEFAULT_HASH_MIN_LENGTH,
            max_response_hash_bytes: DEFAULT_MAX_RESPONSE_HASH_BYTES,
            policy,
            internal_patterns,
            external_patterns,
        }
    }

    fn classify_server(&self, server_name: &str, explicit: Option<&str>) -> ServerClass {
        classify(server_name, explicit, &self.internal_patterns, &self.external_patterns)
    }

    /// Records origins for every qualifying leaf string in `response`,
    /// tagging each with `(server_name, class, tool_name)`.
    pub fn record_origin(
        &self,
        session_id: &SessionId,
        server_name: &str,
        server_class_tag: Option<&str>,
        tool_name: &str,
        response: &Value,
    ) {
        let class = self.classify_server(server_name, server_class_tag);
        let hashes = hash_leaf_strings(response, self.hash_min_length, self.max_response_hash_bytes);
        if hashes.is_empty() {
            return;
        }
        let mut map = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Mutex::new(OriginMap::new(self.max_entries_per_session)));
        let mut map = map.lock();
        for hash in hashes {
            map.insert(
                hash,
                OriginEntry {
                    server_name: server_name.to_string(),
                    class,
                    tool_name: tool_name.to_string(),
                    first_seen: Instant::now(),
                    sensitive: false,
                },
            );
        }
    }

    /// Evaluates whether `args` destined for `server_name` (classified
    /// `external`) may proceed, per §4.6. Non-external destinations are
    /// always allowed — the policy only gates internal→external flow.
    pub fn evaluate(
        &self,
        session_id: &SessionId,
        destination_server: &str,
        destination_class_tag: Option<&str>,
        args: &Value,
    ) -> (FlowDecision, Option<String>) {
        let destination_class = self.classify_server(destination_server, destination_class_tag);
        if destination_class != ServerClass::External {
            return (FlowDecision::Allow, None);
        }

        let hashes = hash_leaf_strings(args, self.hash_min_length, self.max_response_hash_bytes);
        let Some(session_map) = self.sessions.get(session_id) else {
            return (FlowDecision::Allow, None);
        };
        let map = session_map.lock();
        for hash in &hashes {
            if let Some(entry) = map.get(hash) {
                if entry.class == ServerClass::Internal {
                    let decision: FlowDecision = self.policy.internal_to_external.clone().into();
                    return (
                        decision,
                        Some(format!(
                            "data flow security: value originated from internal server '{}'",
                            entry.server_name
                        )),
                    );
                }
                if entry.sensitive {
                    let decision: FlowDecision = self.policy.sensitive_data_external.clone().into();
                    return (
                        decision,
                        Some("data flow security: value tagged sensitive".to_string()),
                    );
                }
            }
        }
        (FlowDecision::Allow, None)
    }

    /// Used when the engine itself can't answer (e.g. poisoned lock
    /// recovery upstream): fail-open allows with a warning tag, fail-closed
    /// denies.
    pub fn fail_open(&self) -> bool {
        self.policy.fail_open
    }

    /// Drops sessions idle past `SESSION_IDLE_TTL`; call alongside the
    /// session store's own sweep.
    pub fn sweep(&self) {
        self.sessions.retain(|_, map| !map.lock().is_idle_expired());
    }

    pub fn end_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }
}
