//! Framing and conversion primitives shared by the transports.

pub mod crypto;
pub mod opus;
pub mod pcm;

pub use crypto::{open, seal, ConnId, CryptoError, NonceTemplate, HEADER_LEN, KEY_LEN};
