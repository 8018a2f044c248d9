//! Session store (C7): tracks client sessions opened against the proxy's
//! own MCP surface, so tool-call records and the data-flow origin map (C6)
//! can be keyed consistently.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::tenant::SessionId;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub client_name: String,
    pub client_version: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SessionRecord {
    fn new(session_id: SessionId, client_name: String, client_version: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            client_name,
            client_version,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Idle sessions older than this are eligible for eviction by `sweep()`.
/// Mirrors the origin map's 30-minute idle TTL so a session and its
/// data-flow history expire together.
const IDLE_TTL: Duration = Duration::from_secs(30 * 60);

pub struct SessionStore {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers a session the first time it's seen, or refreshes
    /// `last_seen` if it's already known. Called from the MCP transport's
    /// session-registration callback.
    pub fn register(&self, session_id: SessionId, client_name: &str, client_version: &str) {
        self.sessions
            .entry(session_id.clone())
            .and_modify(|record| record.last_seen = Utc::now())
            .or_insert_with(|| {
                SessionRecord::new(session_id, client_name.to_string(), client_version.to_string())
            });
    }

    pub fn touch(&self, session_id: &SessionId) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.last_seen = Utc::now();
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|r| r.clone())
    }

    pub fn end(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops sessions idle longer than `IDLE_TTL`. Call periodically
    /// alongside the supervisor's reconciliation tick.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, record| {
            now.signed_duration_since(record.last_seen)
                .to_std()
                .map(|d| d < IDLE_TTL)
                .unwrap_or(true)
        });
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let store = SessionStore::new();
        let id = SessionId::new("s1");
        store.register(id.clone(), "claude", "1.0");
        let record = store.get(&id).unwrap();
        assert_eq!(record.client_name, "claude");
        assert_eq!(record.client_version, "1.0");
    }

    #[test]
    fn test_register_twice_keeps_first_seen() {
        let store = SessionStore::new();
        let id = SessionId::new("s1");
        store.register(id.clone(), "claude", "1.0");
        let first = store.get(&id).unwrap().first_seen;
        store.register(id.clone(), "claude", "1.0");
        let second = store.get(&id).unwrap().first_seen;
        assert_eq!(first, second);
    }

    #[test]
    fn test_end_removes_session() {
        let store = SessionStore::new();
        let id = SessionId::new("s1");
        store.register(id.clone(), "claude", "1.0");
        store.end(&id);
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }
}
