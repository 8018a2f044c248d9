//! Supervisor / Reconciler (C2): keeps the live set of upstream clients
//! equal to the desired set implied by config, and arbitrates quarantine
//! inspection exemptions.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock as AsyncRwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalogue::{ToolEntry, ToolInventory};
use crate::client::{ClientState, Transport, UpstreamClient};
use crate::config::{ConfigEvent, ConfigStore, ServerDescriptor, TransportKind};
use crate::error::{McpError, McpResult};
use crate::events::{EventBus, ProxyEvent};
use crate::store::Store;

pub const RECONCILE_TICK: Duration = Duration::from_secs(30);
const INSPECTION_TTL: Duration = Duration::from_secs(60);
const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
const CIRCUIT_BREAKER_WINDOW: Duration = Duration::from_secs(5 * 60);

fn transport_from_descriptor(desc: &ServerDescriptor) -> Transport {
    match desc.protocol {
        TransportKind::Stdio => {
            let command = desc.command.clone().unwrap_or_default();
            let args = desc.args.clone();
            let env = desc.env.clone();
            let working_dir = desc.working_dir.clone();
            match &desc.isolation {
                Some(isolation) => Transport::StdioContainer {
                    command,
                    args,
                    env,
                    working_dir,
                    isolation: isolation.clone(),
                },
                None => Transport::Stdio {
                    command,
                    args,
                    env,
                    working_dir,
                },
            }
        }
        TransportKind::Http => Transport::Http {
            url: desc.url.clone().unwrap_or_default(),
            headers: desc.headers.clone(),
        },
        TransportKind::Sse => Transport::Sse {
            url: desc.url.clone().unwrap_or_default(),
            headers: desc.headers.clone(),
        },
        TransportKind::StreamableHttp => Transport::StreamableHttp {
            url: desc.url.clone().unwrap_or_default(),
            headers: desc.headers.clone(),
        },
    }
}

struct InspectionGrant {
    expires_at: Instant,
}

#[derive(Default)]
struct FailureWindow {
    failures: Vec<Instant>,
}

impl FailureWindow {
    fn record_failure(&mut self) {
        let now = Instant::now();
        self.failures.push(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        self.failures
            .retain(|t| now.duration_since(*t) < CIRCUIT_BREAKER_WINDOW);
    }

    fn reset(&mut self) {
        self.failures.clear();
    }

    fn tripped(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.prune(now);
        if self.failures.len() as u32 >= CIRCUIT_BREAKER_THRESHOLD {
            let oldest = *self.failures.first().unwrap();
            Some(CIRCUIT_BREAKER_WINDOW.saturating_sub(now.duration_since(oldest)))
        } else {
            None
        }
    }
}

/// Owns the live set of `UpstreamClient`s and drives reconciliation
/// against `ConfigStore`'s desired set.
pub struct Supervisor {
    config: Arc<ConfigStore>,
    catalogue: Arc<ToolInventory>,
    events: EventBus,
    store: Option<Arc<Store>>,
    live: AsyncRwLock<HashMap<String, Arc<UpstreamClient>>>,
    descriptors_snapshot: Mutex<HashMap<String, ServerDescriptor>>,
    inspection_exemptions: DashMap<String, InspectionGrant>,
    inspection_failures: DashMap<String, FailureWindow>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        catalogue: Arc<ToolInventory>,
        events: EventBus,
        store: Option<Arc<Store>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            catalogue,
            events,
            store,
            live: AsyncRwLock::new(HashMap::new()),
            descriptors_snapshot: Mutex::new(HashMap::new()),
            inspection_exemptions: DashMap::new(),
            inspection_failures: DashMap::new(),
        })
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        self.live.read().await.get(name).cloned()
    }

    pub async fn live_names(&self) -> Vec<String> {
        self.live.read().await.keys().cloned().collect()
    }

    fn desired_set(&self, descriptors: &[ServerDescriptor]) -> Vec<ServerDescriptor> {
        descriptors
            .iter()
            .filter(|d| d.wants_connection() || self.has_inspection_exemption(&d.name))
            .cloned()
            .collect()
    }

    pub fn has_inspection_exemption(&self, name: &str) -> bool {
        self.inspection_exemptions
            .get(name)
            .map(|g| g.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Runs the reconciliation algorithm of §4.2 once.
    pub async fn reconcile(&self) {
        let config = self.config.snapshot();
        let desired = self.desired_set(&config.servers);
        let desired_names: std::collections::HashSet<String> =
            desired.iter().map(|d| d.name.clone()).collect();

        let mut prior = self.descriptors_snapshot.lock();
        let live_names: Vec<String> = self.live.read().await.keys().cloned().collect();

        // 2. desired-but-not-live: create + connect.
        for descriptor in &desired {
            if !live_names.contains(&descriptor.name) {
                self.spawn_client(descriptor.clone()).await;
            } else if let Some(old) = prior.get(&descriptor.name) {
                if old.materially_differs(descriptor) {
                    self.destroy_client(&descriptor.name).await;
                    self.spawn_client(descriptor.clone()).await;
                } else if let Some(client) = self.live.read().await.get(&descriptor.name) {
                    // A client whose connect() attempts were exhausted sits in
                    // `Error` indefinitely otherwise; re-spawning here gives it
                    // another bounded retry burst on every tick.
                    if client.state() == ClientState::Error {
                        self.destroy_client(&descriptor.name).await;
                        self.spawn_client(descriptor.clone()).await;
                    }
                }
            }
        }

        // 3. live-but-not-desired: disconnect + destroy + purge catalogue.
        for name in &live_names {
            if !desired_names.contains(name) {
                self.destroy_client(name).await;
            }
        }

        prior.clear();
        for descriptor in &config.servers {
            prior.insert(descriptor.name.clone(), descriptor.clone());
        }
    }

    async fn spawn_client(&self, descriptor: ServerDescriptor) {
        let transport = transport_from_descriptor(&descriptor);
        let client = Arc::new(UpstreamClient::new(
            descriptor.name.clone(),
            transport,
            self.store.clone(),
        ));
        self.live
            .write()
            .await
            .insert(descriptor.name.clone(), Arc::clone(&client));

        let events = self.events.clone();
        let catalogue = Arc::clone(&self.catalogue);
        let name = descriptor.name.clone();
        tokio::spawn(async move {
            match client.connect().await {
                Ok(()) => {
                    info!(server = name, "connected");
                    events.publish(ProxyEvent::ServerConnected { server: name.clone() });
                    Self::refresh_tools(&client, &catalogue, &events, &name).await;
                }
                Err(e) => {
                    warn!(server = name, error = %e, "connect failed");
                }
            }
        });
    }

    /// Lists tools from a newly (re)connected client and registers each one
    /// in the catalogue under its qualified name, replacing whatever that
    /// server previously had indexed. Called once right after `connect()`
    /// succeeds; reconnects go through `spawn_client` again so this runs
    /// every time a server comes back up, not just on first connect.
    async fn refresh_tools(
        client: &UpstreamClient,
        catalogue: &ToolInventory,
        events: &EventBus,
        name: &str,
    ) {
        match client.list_tools().await {
            Ok(tools) => {
                catalogue.clear_server_tools(name);
                let count = tools.len();
                for tool in tools {
                    catalogue.insert_entry(ToolEntry::from_server_tool(name, tool));
                }
                info!(server = name, tools = count, "catalogue refreshed");
                events.publish(ProxyEvent::ToolsUpdated {
                    server: name.to_string(),
                    tool_count: count,
                });
            }
            Err(e) => {
                warn!(server = name, error = %e, "list_tools failed after connect");
            }
        }
    }

    /// Disconnects and destroys a live client, instructing the catalogue
    /// to drop all its tools first (§3 ownership rule: catalogue cleanup
    /// happens before the name is considered gone from the live set).
    async fn destroy_client(&self, name: &str) {
        self.catalogue.clear_server_tools(name);
        if let Some(client) = self.live.write().await.remove(name) {
            client.disconnect().await;
        }
        self.events.publish(ProxyEvent::ServerDisconnected {
            server: name.to_string(),
            reason: "removed from desired set".to_string(),
        });
    }

    /// Grants a TTL-bounded inspection exemption for a quarantined
    /// server: the next `reconcile()` will connect it solely so its tools
    /// can be listed for review.
    pub fn request_inspection_exemption(&self, name: &str) -> McpResult<()> {
        if let Some(mut window) = self.inspection_failures.get_mut(name) {
            if let Some(cooldown) = window.tripped() {
                return Err(McpError::InvalidRequest(format!(
                    "inspection circuit open for '{name}', retry in {:?}",
                    cooldown
                )));
            }
        }
        self.inspection_exemptions.insert(
            name.to_string(),
            InspectionGrant {
                expires_at: Instant::now() + INSPECTION_TTL,
            },
        );
        Ok(())
    }

    pub fn revoke_inspection_exemption(&self, name: &str) {
        self.inspection_exemptions.remove(name);
    }

    pub fn record_inspection_result(&self, name: &str, success: bool) {
        if success {
            self.inspection_failures
                .entry(name.to_string())
                .or_default()
                .reset();
        } else {
            self.inspection_failures
                .entry(name.to_string())
                .or_default()
                .record_failure();
        }
    }

    pub fn can_inspect(&self, name: &str) -> Result<(), (String, Duration)> {
        if let Some(mut window) = self.inspection_failures.get_mut(name) {
            if let Some(cooldown) = window.tripped() {
                return Err((
                    format!(
                        "'{name}' exceeded {CIRCUIT_BREAKER_THRESHOLD} inspection failures in the last {:?}",
                        CIRCUIT_BREAKER_WINDOW
                    ),
                    cooldown,
                ));
            }
        }
        Ok(())
    }

    /// Spawns the periodic reconciliation loop; also reconciles
    /// immediately whenever a config change event arrives. Runs until
    /// `cancel` fires.
    pub fn spawn_reconciliation_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let supervisor = Arc::clone(self);
        let mut config_events = self.config.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RECONCILE_TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        supervisor.reconcile().await;
                    }
                    event = config_events.recv() => {
                        if let Ok(ConfigEvent::ServerAdded(_) | ConfigEvent::ServerRemoved(_) | ConfigEvent::ServerChanged(_) | ConfigEvent::Reloaded) = event {
                            supervisor.reconcile().await;
                        }
                    }
                }
            }
        });
    }
}
