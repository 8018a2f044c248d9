//! Upstream client (C1): transport, connection state machine, and
//! reconnect backoff for a single federated MCP server.

pub mod backoff;
pub mod state;
pub mod transport;
pub mod upstream;

pub use state::{ClientState, ConnectionInfo};
pub use transport::{McpClient, Transport};
pub use upstream::UpstreamClient;
