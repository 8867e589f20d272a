//! AES-128-CTR datagram framing.
//!
//! Every media datagram starts with a 16-byte header that doubles as the CTR
//! IV and the session lookup key:
//!
//! ```text
//! offset  size  meaning
//! 0       4     connection id
//! 4       4     unix seconds (big-endian)
//! 8       8     per-session frame counter (big-endian)
//! 16      N     AES-CTR ciphertext
//! ```
//!
//! A cipher stream is constructed per frame from `(key, iv)`; there is no
//! shared mutable cipher state between frames.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use thiserror::Error;

/// Header size in bytes; also the AES block / IV size.
pub const HEADER_LEN: usize = 16;

/// AES-128 key size in bytes.
pub const KEY_LEN: usize = 16;

type Aes128Ctr = Ctr128BE<Aes128>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("datagram too short: {0} bytes, need at least {HEADER_LEN}")]
    Truncated(usize),
}

/// 4-byte connection identifier minted by the server.
///
/// Indexes a UDP session independent of the device's network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId([u8; 4]);

impl ConnId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Extract the connection id from a datagram header. Returns `None` for
    /// datagrams shorter than the id field.
    pub fn from_datagram(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The 8-byte nonce prefix (connection-id followed by a unix-seconds
/// timestamp) that, together with an 8-byte counter, forms the 16-byte IV.
#[derive(Debug, Clone, Copy)]
pub struct NonceTemplate {
    conn_id: ConnId,
    timestamp: u32,
}

impl NonceTemplate {
    pub fn new(conn_id: ConnId, unix_seconds: u32) -> Self {
        Self {
            conn_id,
            timestamp: unix_seconds,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Build the full 16-byte IV for a given frame counter.
    pub fn iv(&self, counter: u64) -> [u8; HEADER_LEN] {
        let mut iv = [0u8; HEADER_LEN];
        iv[..4].copy_from_slice(self.conn_id.as_bytes());
        iv[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        iv[8..16].copy_from_slice(&counter.to_be_bytes());
        iv
    }

    /// Hex form of the counter-zero IV, handed to the device at hello time.
    pub fn full_nonce_hex(&self) -> String {
        hex::encode(self.iv(0))
    }
}

/// Encrypt `plaintext` under `key` with the given IV and return the framed
/// datagram `iv ‖ ciphertext`.
pub fn seal(key: &[u8; KEY_LEN], iv: &[u8; HEADER_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(plaintext);
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(&mut out[HEADER_LEN..]);
    out
}

/// Decrypt a framed datagram using its leading 16 bytes as the IV.
///
/// A datagram of exactly [`HEADER_LEN`] bytes decrypts to an empty payload.
pub fn open(key: &[u8; KEY_LEN], datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if datagram.len() < HEADER_LEN {
        return Err(CryptoError::Truncated(datagram.len()));
    }
    let iv: [u8; HEADER_LEN] = datagram[..HEADER_LEN].try_into().expect("header length");
    let mut payload = datagram[HEADER_LEN..].to_vec();
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(&mut payload);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key: [u8; KEY_LEN] = rand::random();
        let template = NonceTemplate::new(ConnId::random(), 1_700_000_000);
        let plaintext = b"twenty bytes of opus";

        let datagram = seal(&key, &template.iv(7), plaintext);
        assert_eq!(datagram.len(), HEADER_LEN + plaintext.len());

        let recovered = open(&key, &datagram).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn header_only_datagram_is_empty_payload() {
        let key: [u8; KEY_LEN] = rand::random();
        let template = NonceTemplate::new(ConnId::random(), 1);
        let datagram = seal(&key, &template.iv(0), &[]);
        assert_eq!(datagram.len(), HEADER_LEN);
        assert!(open(&key, &datagram).unwrap().is_empty());
    }

    #[test]
    fn truncated_datagram_rejected() {
        let key = [0u8; KEY_LEN];
        let err = open(&key, &[0u8; 15]).unwrap_err();
        assert!(matches!(err, CryptoError::Truncated(15)));
    }

    #[test]
    fn iv_layout_matches_wire_format() {
        let conn = ConnId::from_bytes([0xba, 0x8f, 0x17, 0xde]);
        let template = NonceTemplate::new(conn, 0x0102_0304);
        let iv = template.iv(0x0506_0708_090a_0b0c);
        assert_eq!(&iv[..4], &[0xba, 0x8f, 0x17, 0xde]);
        assert_eq!(&iv[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&iv[8..], &[0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn conn_id_read_back_from_datagram() {
        let key: [u8; KEY_LEN] = rand::random();
        let conn = ConnId::random();
        let template = NonceTemplate::new(conn, 42);
        let datagram = seal(&key, &template.iv(3), b"x");
        assert_eq!(ConnId::from_datagram(&datagram), Some(conn));
    }

    #[test]
    fn different_counters_differ_on_the_wire() {
        let key: [u8; KEY_LEN] = rand::random();
        let template = NonceTemplate::new(ConnId::random(), 9);
        let a = seal(&key, &template.iv(1), b"same frame");
        let b = seal(&key, &template.iv(2), b"same frame");
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }
}
