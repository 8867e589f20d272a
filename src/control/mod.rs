//! Control-plane connectivity to the administrative backend.

mod client;
mod types;

pub use client::{
    ControlClient, RpcError, RpcHandler, PATH_DEVICE_EVENT, PATH_INJECT_MESSAGE,
    PATH_SYSTEM_CONFIG,
};
pub use types::{classify, Frame, RpcRequest, RpcResponse};
