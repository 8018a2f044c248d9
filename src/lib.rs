//! An aggregating proxy that federates many upstream Model Context
//! Protocol servers behind one unified MCP endpoint.
//!
//! ## Modules
//!
//! - [`client`]: per-upstream transport, connection state machine, and
//!   reconnect backoff (C1)
//! - [`supervisor`]: reconciles the live connection set against desired
//!   config, arbitrates quarantine inspection (C2)
//! - [`catalogue`]: the live tool/prompt/resource index and BM25 search
//!   over it (C3)
//! - [`router`]: request dispatch — intent declaration, flow policy,
//!   truncation, tool-call recording (C4)
//! - [`truncate`]: content-hash-addressed response cache and pagination (C5)
//! - [`dataflow`]: origin tracking and internal→external flow policy (C6)
//! - [`session`]: client session tracking (C7)
//! - [`config`] / [`store`]: desired configuration and secondary
//!   persisted state (C8)
//! - [`events`]: the broadcast event bus (C9)
//! - [`handler`]: the proxy's own `ServerHandler` surface
//! - [`http`]: the auxiliary status/SSE HTTP surface

pub mod annotations;
pub mod catalogue;
pub mod client;
pub mod config;
pub mod dataflow;
pub mod error;
pub mod events;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tenant;
pub mod truncate;

pub use annotations::ToolAnnotations;
pub use catalogue::{QualifiedToolName, ToolEntry, ToolInventory};
pub use config::{ConfigStore, McpConfig, ServerDescriptor};
pub use error::{McpError, McpResult};
pub use events::{EventBus, ProxyEvent};
pub use handler::ProxyHandler;
pub use router::Router;
pub use session::SessionStore;
pub use store::Store;
pub use supervisor::Supervisor;
pub use tenant::{RateLimits, SessionId, TenantContext, TenantId};
