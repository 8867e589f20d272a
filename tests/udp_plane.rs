//! UDP plane integration: session indexes, datagram round trips and the
//! unknown-peer quarantine, over real loopback sockets.

mod common;

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use voxedge::codec::{seal, HEADER_LEN};
use voxedge::udp::{GoodbyeSender, UdpPlane};

fn decode_key(hex_key: &str) -> [u8; 16] {
    let bytes = hex::decode(hex_key).expect("hex key");
    bytes.as_slice().try_into().expect("16-byte key")
}

fn decode_nonce(hex_nonce: &str) -> [u8; HEADER_LEN] {
    let bytes = hex::decode(hex_nonce).expect("hex nonce");
    bytes.as_slice().try_into().expect("16-byte nonce")
}

/// Build a datagram the way a device does: the hello nonce template with a
/// bumped counter, encrypting `payload`.
fn device_datagram(key_hex: &str, nonce_hex: &str, counter: u64, payload: &[u8]) -> Vec<u8> {
    let key = decode_key(key_hex);
    let mut iv = decode_nonce(nonce_hex);
    iv[8..16].copy_from_slice(&counter.to_be_bytes());
    seal(&key, &iv, payload)
}

#[derive(Default)]
struct CountingGoodbye {
    calls: AtomicUsize,
}

impl GoodbyeSender for CountingGoodbye {
    fn send_goodbye(&self, _ip: IpAddr) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst);
        1
    }
}

#[tokio::test]
async fn session_indexes_track_create_and_close() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();

    let session = plane.create_session("ba:8f:17:de:94:94", "");
    let conn_id = session.conn_id();
    assert_eq!(plane.session_count(), 1);
    assert!(plane.session_by_conn(conn_id).is_some());
    assert_eq!(plane.addr_index_len(), 0);

    plane.close_session(conn_id);
    assert_eq!(plane.session_count(), 0);
    assert!(plane.session_by_conn(conn_id).is_none());
    assert_eq!(plane.addr_index_len(), 0);
    plane.close();
}

#[tokio::test]
async fn encrypted_frame_reaches_the_session_queue() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();
    let session = plane.create_session("d1", "");
    let (key_hex, nonce_hex) = session.key_material();
    let mut audio_rx = session.take_audio_rx().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = [0x42u8; 20];
    let datagram = device_datagram(&key_hex, &nonce_hex, 1, &payload);
    assert_eq!(datagram.len(), HEADER_LEN + 20);
    client.send_to(&datagram, plane.local_addr()).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open");
    assert_eq!(frame, payload);

    // The first datagram installed the address index.
    assert_eq!(plane.addr_index_len(), 1);
    plane.close_session(session.conn_id());
    assert_eq!(plane.addr_index_len(), 0);
    plane.close();
}

#[tokio::test]
async fn header_only_datagram_delivers_empty_frame() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();
    let session = plane.create_session("d1", "");
    let (key_hex, nonce_hex) = session.key_material();
    let mut audio_rx = session.take_audio_rx().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = device_datagram(&key_hex, &nonce_hex, 1, &[]);
    assert_eq!(datagram.len(), HEADER_LEN);
    client.send_to(&datagram, plane.local_addr()).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open");
    assert!(frame.is_empty());
    plane.close();
}

#[tokio::test]
async fn undersized_datagram_is_dropped() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();
    let session = plane.create_session("d1", "");
    let mut audio_rx = session.take_audio_rx().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&[0u8; 15], plane.local_addr())
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(300), audio_rx.recv()).await;
    assert!(outcome.is_err(), "short datagram must not produce a frame");
    plane.close();
}

#[tokio::test]
async fn outbound_frames_are_encrypted_to_last_known_address() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();
    let session = plane.create_session("d1", "");
    let (key_hex, nonce_hex) = session.key_material();

    // Device sends one frame first so the plane learns its address.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = device_datagram(&key_hex, &nonce_hex, 1, b"hi");
    client.send_to(&datagram, plane.local_addr()).await.unwrap();

    // Wait for the address index to appear, then push outbound audio.
    tokio::time::timeout(Duration::from_secs(2), async {
        while plane.addr_index_len() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(session.send_audio(b"reply-frame".to_vec()));

    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    let received = &buf[..len];
    assert!(received.len() > HEADER_LEN);

    let plaintext = session.open_datagram(received).unwrap();
    assert_eq!(plaintext, b"reply-frame");
    plane.close();
}

#[tokio::test]
async fn unknown_peer_goodbye_is_throttled_per_ip() {
    let plane = UdpPlane::bind(&common::loopback_udp_config()).await.unwrap();
    let goodbye = Arc::new(CountingGoodbye::default());
    plane.install_goodbye_sender(goodbye.clone());

    // Two unknown-session datagrams from the same IP, 100 ms apart.
    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let junk = [7u8; 32];
    client_a.send_to(&junk, plane.local_addr()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client_b.send_to(&junk, plane.local_addr()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(goodbye.calls.load(Ordering::SeqCst), 1);
    plane.close();
}
