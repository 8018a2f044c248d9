//! Desired configuration: the on-disk JSON that is authoritative for which
//! upstreams should exist and how the proxy surface behaves.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{McpError, McpResult};

/// Transport kind for an upstream descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub pkce: bool,
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub image: String,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
}

/// One upstream server as stored in `servers[]`. `command`/`args`/`env`/
/// `working_dir` apply to stdio transports; `url`/`headers` to the
/// HTTP-family ones. Exactly one side should be populated, consistent with
/// `protocol`, but this is enforced by `validate()` rather than the type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub protocol: TransportKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub quarantined: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationConfig>,

    /// Explicit internal/external tag, overriding name-substring classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    pub fn validate(&self) -> McpResult<()> {
        if self.name.trim().is_empty() {
            return Err(McpError::InvalidRequest("server name is empty".into()));
        }
        match self.protocol {
            TransportKind::Stdio => {
                if self.command.is_none() || self.url.is_some() {
                    return Err(McpError::InvalidRequest(format!(
                        "server '{}': stdio transport requires command and no url",
                        self.name
                    )));
                }
            }
            _ => {
                if self.url.is_none() || self.command.is_some() {
                    return Err(McpError::InvalidRequest(format!(
                        "server '{}': http-family transport requires url and no command",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// `true` if this descriptor should be part of the supervisor's desired
    /// set absent any inspection exemption.
    pub fn wants_connection(&self) -> bool {
        self.enabled && !self.quarantined
    }

    /// Materially-changed fields force destroy-and-recreate in the
    /// supervisor; timestamps alone are cosmetic.
    pub fn materially_differs(&self, other: &ServerDescriptor) -> bool {
        self.protocol != other.protocol
            || self.command != other.command
            || self.args != other.args
            || self.env != other.env
            || self.working_dir != other.working_dir
            || self.url != other.url
            || self.headers != other.headers
            || self.isolation.as_ref().map(|i| &i.image) != other.isolation.as_ref().map(|i| &i.image)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Allow,
    Warn,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowPolicyConfig {
    #[serde(default = "PolicyMode::deny_default")]
    pub internal_to_external: PolicyMode,
    #[serde(default = "PolicyMode::deny_default")]
    pub sensitive_data_external: PolicyMode,
    #[serde(default)]
    pub fail_open: bool,
}

impl PolicyMode {
    fn deny_default() -> PolicyMode {
        PolicyMode::Deny
    }
}

impl Default for FlowPolicyConfig {
    fn default() -> Self {
        Self {
            internal_to_external: PolicyMode::Deny,
            sensitive_data_external: PolicyMode::Deny,
            fail_open: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_correlation_ttl_secs")]
    pub correlation_ttl_secs: u64,
}

fn default_correlation_ttl_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub flow_tracking: bool,
    #[serde(default)]
    pub flow_policy: FlowPolicyConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub internal_patterns: Vec<String>,
    #[serde(default)]
    pub external_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerIsolationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default)]
    pub disable_management: bool,
    #[serde(default = "default_true")]
    pub allow_server_add: bool,
    #[serde(default = "default_true")]
    pub allow_server_remove: bool,
    #[serde(default)]
    pub enable_socket: bool,
}

/// Root shape of the on-disk config file (§6 "Config file (JSON)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default = "default_response_limit")]
    pub tool_response_limit: usize,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub docker_isolation: DockerIsolationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_response_limit() -> usize {
    25_000
}

fn default_tokenizer() -> String {
    "cl100k_base".to_string()
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: PathBuf::from("./data"),
            api_key: None,
            tls: TlsConfig::default(),
            servers: Vec::new(),
            tool_response_limit: default_response_limit(),
            tokenizer: default_tokenizer(),
            security: SecurityConfig::default(),
            docker_isolation: DockerIsolationConfig::default(),
            logging: LoggingConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl McpConfig {
    pub fn load(path: &Path) -> McpResult<Self> {
        let bytes = std::fs::read(path)?;
        let config: McpConfig = serde_json::from_slice(&bytes)?;
        for server in &config.servers {
            server.validate()?;
        }
        Ok(config)
    }

    /// Atomic write: serialize to a sibling temp file, then rename over
    /// the target so readers never observe a partial write.
    pub fn save(&self, path: &Path) -> McpResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Change events emitted whenever the desired config mutates, either from
/// a management-tool write or an external file edit picked up by the
/// debounced watcher.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    ServerAdded(String),
    ServerRemoved(String),
    ServerChanged(String),
    Reloaded,
}

/// Shared, mutable view of the desired config plus its change-notification
/// bus. The supervisor subscribes to `events()`; management tools call
/// through `mutate()` to update, persist, then notify.
pub struct ConfigStore {
    path: Option<PathBuf>,
    inner: RwLock<McpConfig>,
    events_tx: broadcast::Sender<ConfigEvent>,
    _watcher: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl ConfigStore {
    pub fn new(config: McpConfig, path: Option<PathBuf>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            path,
            inner: RwLock::new(config),
            events_tx,
            _watcher: None,
        })
    }

    /// Loads from `path` if it exists, otherwise seeds a default config and
    /// saves it. Starts a debounced watcher on the file so external edits
    /// (not made through `mutate`) still trigger reconciliation.
    pub fn open(path: PathBuf) -> McpResult<Arc<Self>> {
        let config = if path.exists() {
            McpConfig::load(&path)?
        } else {
            let cfg = McpConfig::default();
            cfg.save(&path)?;
            cfg
        };

        let (events_tx, _) = broadcast::channel(256);
        let store = Arc::new(Self {
            path: Some(path.clone()),
            inner: RwLock::new(config),
            events_tx,
            _watcher: None,
        });

        let watch_path = path.clone();
        let events_tx_clone = store.events_tx.clone();
        let watcher_result = new_debouncer(
            std::time::Duration::from_millis(500),
            None,
            move |result: DebounceEventResult| match result {
                Ok(_events) => {
                    info!(path = %watch_path.display(), "config file changed on disk");
                    let _ = events_tx_clone.send(ConfigEvent::Reloaded);
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "config watcher error");
                    }
                }
            },
        );

        // SAFETY-free: we cannot mutate `store` behind its Arc, so the
        // watcher handle is stashed via unsafe cell-free pattern: leak it
        // onto a background task that keeps it alive for the process
        // lifetime instead of storing it on the struct.
        if let Ok(mut debouncer) = watcher_result {
            if let Err(e) = debouncer.watch(&path, RecursiveMode::NonRecursive) {
                warn!(error = %e, "failed to watch config file");
            } else {
                std::mem::forget(debouncer);
            }
        }

        Ok(store)
    }

    pub fn snapshot(&self) -> McpConfig {
        self.inner.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events_tx.subscribe()
    }

    /// Applies `f` to the in-memory config, persists (best-effort), then
    /// emits `event`. Persistence failure never rolls back the in-memory
    /// change (test-environment tolerance, per the persisted-state design).
    pub fn mutate<F>(&self, event: ConfigEvent, f: F) -> McpResult<()>
    where
        F: FnOnce(&mut McpConfig) -> McpResult<()>,
    {
        {
            let mut guard = self.inner.write();
            f(&mut guard)?;
        }
        if let Some(path) = &self.path {
            let snapshot = self.snapshot();
            if let Err(e) = snapshot.save(path) {
                warn!(error = %e, "failed to persist config, change remains in-memory only");
            }
        }
        let _ = self.events_tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_server(name: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: name.to_string(),
            protocol: TransportKind::StreamableHttp,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: Some("http://127.0.0.1:9000".to_string()),
            headers: HashMap::new(),
            enabled: true,
            quarantined: false,
            oauth: None,
            isolation: None,
            class: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_requires_url_for_http() {
        let mut server = sample_server("echo");
        server.url = None;
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_wants_connection() {
        let mut server = sample_server("echo");
        assert!(server.wants_connection());
        server.quarantined = true;
        assert!(!server.wants_connection());
    }

    #[test]
    fn test_materially_differs_on_url_not_timestamp() {
        let a = sample_server("echo");
        let mut b = a.clone();
        b.updated_at = Utc::now() + chrono::Duration::seconds(5);
        assert!(!a.materially_differs(&b));
        b.url = Some("http://127.0.0.1:9001".to_string());
        assert!(a.materially_differs(&b));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = McpConfig::default();
        config.servers.push(sample_server("echo"));
        config.save(&path).unwrap();

        let loaded = McpConfig::load(&path).unwrap();
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].name, "echo");
    }

    #[test]
    fn test_config_store_mutate_emits_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(McpConfig::default(), Some(path));
        let mut rx = store.subscribe();

        store
            .mutate(ConfigEvent::ServerAdded("echo".into()), |cfg| {
                cfg.servers.push(sample_server("echo"));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.snapshot().servers.len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConfigEvent::ServerAdded(name) if name == "echo"
        ));
    }
}
