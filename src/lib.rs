#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::return_self_not_must_use)]

//! voxedge - voice-interaction edge server for embedded speech devices.
//!
//! Devices open long-lived sessions over one of two fronts that converge on
//! the same connection abstraction: a direct WebSocket, or an MQTT control
//! channel paired with an AES-CTR-encrypted UDP audio channel. The server
//! drives a VAD → ASR → LLM → TTS pipeline through pooled provider handles
//! and streams synthesized audio back.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing, validation, live store
//! - `core::runtime` - Runtime wiring and shutdown
//! - `telemetry` - Logging bootstrap with reloadable level
//!
//! ## Wire primitives
//! - `codec::crypto` - AES-128-CTR datagram framing
//! - `codec::pcm` - PCM ⇄ f32 conversion
//! - `codec::opus` - Opus TOC inspection
//!
//! ## Transports
//! - `udp` - Encrypted UDP datagram plane with session indexes
//! - `mqtt` - Embedded MQTT broker, codec and topic matching
//! - `adapter` - MQTT-UDP adapter joining control and media planes
//! - `transport` - Connection abstraction, WebSocket front, registry
//!
//! ## Sessions
//! - `chat` - Per-device session shell and pipeline plumbing
//! - `pool` - Provider resource pools
//! - `event` - Event bus and keyed worker routing
//!
//! ## Management
//! - `control` - Backend control-plane RPC client
//! - `plugins` - MCP plugin-manager lifecycle
//! - `reload` - Hot-reload reconciliation and appliers

pub mod adapter;
pub mod chat;
pub mod cli;
pub mod codec;
pub mod control;
pub mod core;
pub mod event;
pub mod mqtt;
pub mod plugins;
pub mod pool;
pub mod reload;
pub mod telemetry;
pub mod transport;
pub mod udp;

// Re-exports for the common wiring surface.
pub use crate::core::{config, runtime};
pub use adapter::MqttUdpAdapter;
pub use control::ControlClient;
pub use event::{EventBus, WorkerPool};
pub use mqtt::Broker;
pub use pool::PoolManager;
pub use transport::{Connection, DeviceRegistry};
pub use udp::UdpPlane;
