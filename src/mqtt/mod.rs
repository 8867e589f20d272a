//! Embedded MQTT broker and its wire codec.

pub mod broker;
pub mod codec;
pub mod topics;

pub use broker::{parse_mac_from_client_id, Broker};

use std::sync::Arc;

/// Slot holding the currently running broker, if any. The runtime owns the
/// slot; the adapter and publishers read through it so broker restarts are
/// picked up without re-wiring.
pub type SharedBroker = Arc<parking_lot::RwLock<Option<Broker>>>;
