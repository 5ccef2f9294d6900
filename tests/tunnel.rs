//! Loopback tests driving two tunnels against each other.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mptun::core::{KEY_SIZE, REPLAY_CACHE_SIZE, SALT_SIZE};
use mptun::crypto::{CipherKey, CipherSuite, Keypair};
use mptun::prelude::*;
use mptun::tunnel::Message;
use tokio::net::UdpSocket;

const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn now_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_micros() as u64
}

/// `a` knows `b` and configures one UP path; `b` learns it.
async fn pair() -> (Tunnel, Tunnel) {
    let mut a = Tunnel::bind(loopback()).await.unwrap();
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    a.set_key(&KEY).unwrap();
    b.set_key(&KEY).unwrap();

    a.peer(b.local_addr().unwrap());
    let policy = PathPolicy::new(InterfaceName::default(), PathState::Up)
        .with_beat(Duration::from_millis(10));
    a.set_state(policy).unwrap();
    (a, b)
}

/// Process every pending datagram; return the first payload seen.
async fn drain(t: &mut Tunnel) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    let mut payload = None;
    while let Ok(received) = tokio::time::timeout(Duration::from_millis(5), t.recv(&mut buf)).await {
        if let Some(len) = received.unwrap() {
            payload.get_or_insert_with(|| buf[..len].to_vec());
        }
    }
    payload
}

fn ready(t: &Tunnel) -> bool {
    t.is_established() && t.paths().iter().any(|p| p.scheduled)
}

async fn establish(a: &mut Tunnel, b: &mut Tunnel) {
    for _ in 0..400 {
        a.update().await.unwrap();
        b.update().await.unwrap();
        drain(a).await;
        drain(b).await;
        if ready(a) && ready(b) {
            return;
        }
    }
    panic!("tunnel did not come up");
}

/// A control message sealed with `key` and stamped `timestamp`.
fn sealed_message(key: &[u8; KEY_SIZE], timestamp: u64, public_key: [u8; 32]) -> Vec<u8> {
    let header = FrameHeader::new(FrameKind::Message, timestamp, [0x5a; SALT_SIZE]);
    let mut frame = header.to_bytes().to_vec();
    let msg = Message {
        state: PathState::Up,
        public_key,
        beat: Duration::from_millis(100),
        rtt_limit: Duration::from_secs(5),
        ..Message::default()
    };
    msg.encode(&mut frame, 0);
    CipherKey::new(CipherSuite::XChaCha20Poly1305, key)
        .unwrap()
        .seal(&mut frame)
        .unwrap();
    frame
}

async fn recv_one(t: &mut Tunnel) -> Option<usize> {
    let mut buf = vec![0u8; 2048];
    tokio::time::timeout(Duration::from_secs(1), t.recv(&mut buf))
        .await
        .expect("datagram expected")
        .unwrap()
}

#[tokio::test]
async fn test_handshake_and_payload_both_ways() {
    let (mut a, mut b) = pair().await;
    establish(&mut a, &mut b).await;

    assert_eq!(a.cipher(), CipherSuite::XChaCha20Poly1305);
    assert_eq!(b.paths().len(), 1);
    assert_eq!(b.paths()[0].origin(), PathOrigin::Learned);
    assert_eq!(b.paths()[0].state(), PathState::Up);

    assert_eq!(a.send(b"over the tunnel").await.unwrap(), 15);
    assert_eq!(drain(&mut b).await.as_deref(), Some(&b"over the tunnel"[..]));

    b.send(b"and back").await.unwrap();
    assert_eq!(drain(&mut a).await.as_deref(), Some(&b"and back"[..]));

    assert_eq!(a.bad_summary(), BadRecord::default());
    assert_eq!(b.bad_summary(), BadRecord::default());
}

#[tokio::test]
async fn test_aes_when_both_offer_it() {
    let (mut a, mut b) = pair().await;
    a.set_aes(true);
    b.set_aes(true);
    establish(&mut a, &mut b).await;

    assert_eq!(a.cipher(), CipherSuite::Aes256Gcm);
    assert_eq!(b.cipher(), CipherSuite::Aes256Gcm);

    a.send(b"gcm").await.unwrap();
    assert_eq!(drain(&mut b).await.as_deref(), Some(&b"gcm"[..]));
}

#[tokio::test]
async fn test_mtu_and_payload_limit() {
    let (mut a, mut b) = pair().await;
    establish(&mut a, &mut b).await;

    let mtu = a.mtu();
    assert!(mtu >= 1232 - 40);
    let err = a.send(&vec![0u8; mtu + 1]).await.unwrap_err();
    assert!(matches!(err, TunnelError::PayloadTooLarge { size, .. } if size == mtu + 1));
}

#[tokio::test]
async fn test_forged_frame_counts_decrypt() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();

    let mut forged = vec![FrameKind::Data.as_byte()];
    forged.extend_from_slice(&[0x33; 63]);
    raw.send_to(&forged, b.local_addr().unwrap()).await.unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    let summary = b.bad_summary();
    assert_eq!(summary.decrypt.count, 1);
    assert_eq!(summary.decrypt.addr, Some(raw.local_addr().unwrap()));
    assert_eq!(summary.difftime.count, 0);
    assert!(b.paths().is_empty());
}

#[tokio::test]
async fn test_wrong_key_counts_decrypt() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();

    let frame = sealed_message(&[0x01; KEY_SIZE], now_micros(), *Keypair::generate().public_key());
    raw.send_to(&frame, b.local_addr().unwrap()).await.unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    assert_eq!(b.bad_summary().decrypt.count, 1);
    assert!(b.paths().is_empty());
}

#[tokio::test]
async fn test_stale_timestamp_counts_difftime() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();

    let stale = now_micros() - 2 * b.conf().time_tolerance.as_micros() as u64;
    let frame = sealed_message(&KEY, stale, *Keypair::generate().public_key());
    raw.send_to(&frame, b.local_addr().unwrap()).await.unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    let summary = b.bad_summary();
    assert_eq!(summary.difftime.count, 1);
    assert_eq!(summary.decrypt.count, 0);
    assert!(b.paths().is_empty());
}

#[tokio::test]
async fn test_replayed_frame_counts_difftime() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();

    let frame = sealed_message(&KEY, now_micros(), *Keypair::generate().public_key());
    raw.send_to(&frame, b.local_addr().unwrap()).await.unwrap();
    raw.send_to(&frame, b.local_addr().unwrap()).await.unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    assert_eq!(b.paths().len(), 1, "first copy learns a path");
    assert_eq!(recv_one(&mut b).await, None);

    assert_eq!(b.bad_summary().difftime.count, 1);
    assert_eq!(b.paths()[0].rx.total, 1);
}

#[tokio::test]
async fn test_replay_caught_after_cache_fills() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();
    let to = b.local_addr().unwrap();
    let public_key = *Keypair::generate().public_key();

    let base = now_micros();
    let first = sealed_message(&KEY, base, public_key);
    raw.send_to(&first, to).await.unwrap();
    assert_eq!(recv_one(&mut b).await, None);

    for i in 1..=REPLAY_CACHE_SIZE as u64 {
        let frame = sealed_message(&KEY, base + i, public_key);
        raw.send_to(&frame, to).await.unwrap();
        assert_eq!(recv_one(&mut b).await, None);
    }
    let rx_before = b.paths()[0].rx.total;
    assert_eq!(rx_before, REPLAY_CACHE_SIZE as u64 + 1);

    raw.send_to(&first, to).await.unwrap();
    assert_eq!(recv_one(&mut b).await, None);

    assert_eq!(b.bad_summary().difftime.count, 1);
    assert_eq!(b.paths()[0].rx.total, rx_before);
}

#[tokio::test]
async fn test_forged_frame_leaves_path_totals() {
    let (mut a, mut b) = pair().await;
    establish(&mut a, &mut b).await;

    let rx_before = b.paths()[0].rx;
    let decrypt_before = b.bad_summary().decrypt.count;

    let mut forged = vec![FrameKind::Data.as_byte()];
    forged.extend_from_slice(&[0x33; 63]);
    a.transport()
        .inner()
        .send_to(&forged, b.local_addr().unwrap())
        .await
        .unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    let rx_after = b.paths()[0].rx;
    assert_eq!(rx_after.total, rx_before.total);
    assert_eq!(rx_after.bytes, rx_before.bytes);
    assert_eq!(rx_after.time, rx_before.time);
    assert_eq!(b.bad_summary().decrypt.count, decrypt_before + 1);
}

#[tokio::test]
async fn test_low_order_key_counts_keyx() {
    let mut b = Tunnel::bind(loopback()).await.unwrap();
    b.set_key(&KEY).unwrap();
    let raw = UdpSocket::bind(loopback()).await.unwrap();

    let frame = sealed_message(&KEY, now_micros(), [0; 32]);
    raw.send_to(&frame, b.local_addr().unwrap()).await.unwrap();

    assert_eq!(recv_one(&mut b).await, None);
    assert_eq!(b.bad_summary().keyx.count, 1);
    assert!(b.paths().is_empty());
    assert!(!b.is_established());
}

#[tokio::test]
async fn test_rejected_key_keeps_tunnel_working() {
    let (mut a, mut b) = pair().await;
    assert!(a.set_key(&[0x01; 5]).is_err());
    assert_eq!(*a.key(), KEY);

    establish(&mut a, &mut b).await;
    a.send(b"still here").await.unwrap();
    assert_eq!(drain(&mut b).await.as_deref(), Some(&b"still here"[..]));
}

#[tokio::test]
async fn test_idle_path_goes_down() {
    let (mut a, mut b) = pair().await;
    establish(&mut a, &mut b).await;

    a.set_conf(TunnelConfig::new().with_keepalive(Duration::from_millis(10)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.update().await.unwrap();

    let paths = a.paths();
    let path = &paths[0];
    assert_eq!(path.state(), PathState::Down);
    assert_eq!(path.requested(), PathState::Up);
    assert!(matches!(a.send(b"x").await, Err(TunnelError::NoUsablePath)));
}
