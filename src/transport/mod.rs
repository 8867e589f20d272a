//! Transport fronts and the shared connection abstraction.
//!
//! Both fronts (MQTT+UDP, WebSocket) converge on [`Connection`]; the session
//! layer never sees which wire a device arrived on.

pub mod conn;
pub mod registry;
pub mod websocket;

pub use conn::{ConnError, ConnTransport, Connection, TransportKind, CMD_QUEUE_DEPTH};
pub use registry::{DeviceRegistry, ManagedSession};
pub use websocket::WsServer;

use std::sync::Arc;

/// Callback invoked for every freshly established device connection,
/// regardless of transport.
pub type OnNewConnection = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;
