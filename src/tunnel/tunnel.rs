//! Tunnel core: owns the path table and the keys and drives both.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use super::bad::{BadKind, BadRecord, BadTracker};
use super::message::{Message, MESSAGE_SIZE};
use crate::core::{
    ConfigError, PathAddr, PathPolicy, Transport, TunnelConfig, TunnelError, TunnelResult,
    FRAME_HEADER_SIZE, FRAME_OVERHEAD, KEY_SIZE, MAX_DATAGRAM_SIZE, MTU_MAX_V4, SALT_SIZE,
};
use crate::crypto::{CipherKey, CipherSuite, KeyExchange, KeySlot, PresharedKey, ReplayCache};
use crate::path::{Path, PathTable};
use crate::transport::{FrameHeader, FrameKind, UdpTransport};

/// Wall clock in microseconds since the Unix epoch.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Control message to emit on a path.
enum Outgoing<'a> {
    Request { probe: Option<usize> },
    Reply { to: &'a Message, size: usize },
}

/// A secure multipath tunnel to one peer.
///
/// The tunnel never spawns tasks. The caller drives it by awaiting
/// [`recv`](Self::recv) for inbound datagrams, calling
/// [`update`](Self::update) regularly, and using [`send_wait`](Self::send_wait)
/// to learn when [`send`](Self::send) can make progress.
#[derive(Debug)]
pub struct Tunnel<T: Transport = UdpTransport> {
    transport: T,
    conf: TunnelConfig,
    psk: PresharedKey,
    /// Pre-shared key cipher sealing control messages.
    control: CipherKey,
    kx: KeyExchange,
    aes: bool,
    paths: PathTable,
    bad: BadTracker,
    replay: ReplayCache,
    peer: Option<SocketAddr>,
    recv_buf: Vec<u8>,
    plain: Vec<u8>,
}

impl Tunnel<UdpTransport> {
    /// Bind a UDP socket and create a tunnel on it.
    pub async fn bind(local: SocketAddr) -> TunnelResult<Self> {
        let transport = UdpTransport::bind(local).await?;
        Self::with_transport(transport)
    }
}

impl<T: Transport> Tunnel<T> {
    /// Create a tunnel over `transport` with a random pre-shared key.
    pub fn with_transport(transport: T) -> TunnelResult<Self> {
        let psk = PresharedKey::generate();
        let control = CipherKey::new(CipherSuite::XChaCha20Poly1305, psk.as_bytes())?;
        let kx = KeyExchange::new(&psk, now_micros())?;

        Ok(Self {
            transport,
            conf: TunnelConfig::default(),
            psk,
            control,
            kx,
            aes: false,
            paths: PathTable::new(),
            bad: BadTracker::new(),
            replay: ReplayCache::default(),
            peer: None,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
            plain: Vec::with_capacity(MAX_DATAGRAM_SIZE),
        })
    }

    /// Shut the tunnel down. Key material is wiped as it is dropped.
    pub fn close(self) {
        debug!(paths = self.paths.len(), "tunnel closed");
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Local address of the transport.
    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Register the peer address that [`set_state`](Self::set_state) creates paths toward.
    pub fn peer(&mut self, addr: SocketAddr) {
        debug!(peer = %addr, "peer set");
        self.peer = Some(addr);
    }

    /// Current tunnel configuration.
    pub fn conf(&self) -> &TunnelConfig {
        &self.conf
    }

    /// Replace the tunnel configuration.
    pub fn set_conf(&mut self, conf: TunnelConfig) -> TunnelResult<()> {
        conf.validate()?;
        if conf.traffic_class != self.conf.traffic_class {
            self.transport.set_traffic_class(conf.traffic_class)?;
        }
        debug!(?conf, "tunnel configuration");
        self.conf = conf;
        Ok(())
    }

    /// Replace the pre-shared key.
    ///
    /// All data keys are dropped and the exchange restarts. On error the old
    /// key stays in use.
    pub fn set_key(&mut self, key: &[u8]) -> TunnelResult<()> {
        let psk = PresharedKey::from_slice(key)?;
        let control = CipherKey::new(CipherSuite::XChaCha20Poly1305, psk.as_bytes())?;
        let kx = KeyExchange::new(&psk, now_micros())?;

        self.psk = psk;
        self.control = control;
        self.kx = kx;
        debug!("pre-shared key replaced");
        Ok(())
    }

    /// Copy of the pre-shared key, wiped when dropped.
    pub fn key(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        self.psk.to_zeroizing()
    }

    /// Offer AES-256-GCM to the peer. It is used once both sides offer it.
    pub fn set_aes(&mut self, enabled: bool) {
        self.aes = enabled;
    }

    /// Offer `suite` to the peer.
    pub fn set_cipher(&mut self, suite: CipherSuite) {
        self.set_aes(suite == CipherSuite::Aes256Gcm);
    }

    /// Suite of the data key in use.
    pub fn cipher(&self) -> CipherSuite {
        self.kx.suite()
    }

    /// Whether the key exchange has completed at least once.
    pub fn is_established(&self) -> bool {
        self.kx.is_established()
    }

    /// Create or update paths on `policy.interface`.
    ///
    /// With a peer registered, the path toward it on that interface is
    /// created or updated. Without one, every existing path on the interface
    /// is updated. Either all matching paths change or none does.
    pub fn set_state(&mut self, policy: PathPolicy) -> TunnelResult<()> {
        policy.validate()?;
        let now = now_micros();

        let targets: Vec<usize> = match self.peer {
            Some(peer) => match self.paths.find(&policy.interface, peer) {
                Some(index) => vec![index],
                None => {
                    let path = Path::configured(policy, peer, now)?;
                    self.paths.insert(path)?;
                    self.paths.classify();
                    return Ok(());
                }
            },
            None => self
                .paths
                .iter()
                .filter(|(_, p)| p.interface == policy.interface)
                .map(|(i, _)| i)
                .collect(),
        };

        if targets.is_empty() {
            return Err(TunnelError::Config(ConfigError::UnknownInterface(
                policy.interface.to_string(),
            )));
        }
        for &index in &targets {
            if let Some(path) = self.paths.get(index) {
                if !path.state().can_transition_to(policy.state) {
                    return Err(TunnelError::Config(ConfigError::IllegalTransition {
                        from: path.state().as_str(),
                        to: policy.state.as_str(),
                    }));
                }
            }
        }
        for index in targets {
            if let Some(path) = self.paths.get_mut(index) {
                path.claim(policy.clone())?;
            }
        }
        self.paths.classify();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Snapshot of every path.
    pub fn paths(&self) -> Vec<Path> {
        self.paths.iter().map(|(_, p)| p.clone()).collect()
    }

    /// Largest payload accepted by every scheduled path.
    pub fn mtu(&self) -> usize {
        self.paths.mtu() - FRAME_OVERHEAD
    }

    /// Per-origin abuse records.
    pub fn bad(&self) -> Vec<(IpAddr, BadRecord)> {
        self.bad.snapshot()
    }

    /// Abuse counters summed over all origins.
    pub fn bad_summary(&self) -> BadRecord {
        self.bad.summary()
    }

    // -------------------------------------------------------------------------
    // Driving
    // -------------------------------------------------------------------------

    /// Periodic maintenance: keepalives, probes, key rotation, scheduling.
    ///
    /// Returns whether any path changed state or scheduling. A failed send
    /// does not abort the pass: every path is still ticked and every due
    /// request attempted, then the first failure is returned in place of
    /// the change flag.
    pub async fn update(&mut self) -> TunnelResult<bool> {
        let now = now_micros();
        let mut changed = false;

        if self.kx.is_established() && self.kx.needs_rotation(now, micros(self.conf.kx_timeout)) {
            if let Err(e) = self.kx.rotate(&self.psk, now) {
                warn!(error = %e, "key rotation failed");
            }
        }

        let expired: Vec<usize> = self
            .paths
            .iter()
            .filter(|(_, p)| p.is_expired(now, self.conf.time_tolerance))
            .map(|(i, _)| i)
            .collect();
        for index in expired {
            if let Some(path) = self.paths.remove(index) {
                debug!(path = %path.remote, interface = %path.interface, "path forgotten");
                changed = true;
            }
        }

        let mut requests = Vec::new();
        for (index, path) in self.paths.iter_mut() {
            let tick = path.tick(now, self.conf.keepalive);
            changed |= tick.changed;
            if let Some(request) = tick.request {
                requests.push((index, request));
            }
        }
        changed |= self.paths.classify();

        let mut failed = None;
        for (index, request) in requests {
            let out = Outgoing::Request {
                probe: request.probe,
            };
            if let Err(e) = self.send_message(index, out, now).await {
                debug!(error = %e, "request not sent");
                failed.get_or_insert(e);
            }
        }

        self.bad.prune(now);
        match failed {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    /// Wait until sending may make progress, or until `timeout`.
    ///
    /// Returns `true` when a path has budget or a request is due and the
    /// transport is writable.
    pub async fn send_wait(&mut self, timeout: Duration) -> TunnelResult<bool> {
        let now = now_micros();
        let limit = micros(timeout);
        let mut wait = limit;

        for (_, path) in self.paths.iter_mut() {
            if let Some(due) = path.next_request() {
                wait = wait.min(due.saturating_sub(now));
            }
            if path.scheduled {
                let frame = path.mtu.ok;
                wait = wait.min(path.time_until(frame, now));
            }
        }

        if wait >= limit {
            tokio::time::sleep(timeout).await;
            return Ok(false);
        }
        if wait > 0 {
            tokio::time::sleep(Duration::from_micros(wait)).await;
        }

        let left = Duration::from_micros(limit - wait);
        match tokio::time::timeout(left, self.transport.writable()).await {
            Ok(ready) => {
                ready?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Send one payload over the best scheduled path.
    pub async fn send(&mut self, payload: &[u8]) -> TunnelResult<usize> {
        let now = now_micros();
        self.paths.classify();
        let index = self.paths.select(payload.len(), FRAME_OVERHEAD, now)?;

        let mut frame = new_frame(FrameKind::Data, now);
        frame.extend_from_slice(payload);
        self.kx.current().seal(&mut frame)?;

        let path = self.paths.get_mut(index).ok_or(TunnelError::NoUsablePath)?;
        if !path.try_send(frame.len(), now) {
            return Err(TunnelError::RateLimited {
                retry_after_us: path.time_until(frame.len(), now),
            });
        }
        let to = PathAddr::new(path.interface.clone(), path.remote);

        self.transport.send_to(&frame, &to).await?;
        if let Some(path) = self.paths.get_mut(index) {
            path.on_sent(frame.len(), now);
        }
        trace!(path = %to.remote, len = payload.len(), "payload sent");
        Ok(payload.len())
    }

    /// Receive one datagram.
    ///
    /// Returns the payload length copied into `buf` for data frames, or
    /// `None` when the datagram was a control message or was dropped.
    /// Payloads longer than `buf` are truncated.
    pub async fn recv(&mut self, buf: &mut [u8]) -> TunnelResult<Option<usize>> {
        let (len, from) = self.transport.recv_from(&mut self.recv_buf).await?;
        let now = now_micros();

        let Some(kind) = self.authenticate(len, from.remote, now) else {
            return Ok(None);
        };

        match kind {
            FrameKind::Data => Ok(self.on_data(len, &from, buf, now)),
            FrameKind::Message => {
                self.on_message(len, &from, now).await?;
                Ok(None)
            }
        }
    }

    /// Parse, decrypt and window-check the datagram in `recv_buf`.
    ///
    /// On success the plaintext is in `plain`.
    fn authenticate(&mut self, len: usize, from: SocketAddr, now: u64) -> Option<FrameKind> {
        let frame = &self.recv_buf[..len];

        let header = match FrameHeader::from_bytes(frame) {
            Ok(header) => header,
            Err(e) => {
                trace!(origin = %from, error = %e, "malformed frame");
                self.bad.report(BadKind::Decrypt, from, now);
                return None;
            }
        };

        let opened = match header.kind {
            FrameKind::Data => self.kx.open(frame, &mut self.plain).map(|slot| {
                if slot == KeySlot::Next {
                    debug!(origin = %from, "peer switched to the new data key");
                }
            }),
            FrameKind::Message => self.control.open(frame, &mut self.plain),
        };
        if opened.is_err() {
            trace!(origin = %from, kind = ?header.kind, "frame failed authentication");
            self.bad.report(BadKind::Decrypt, from, now);
            return None;
        }

        let tolerance = micros(self.conf.time_tolerance);
        let diff = header.time_diff(now);
        if diff > tolerance {
            trace!(origin = %from, diff, "frame outside time tolerance");
            self.bad.report(BadKind::Difftime, from, now);
            return None;
        }

        let mut nonce = [0u8; FRAME_HEADER_SIZE];
        nonce.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        if !self
            .replay
            .check_and_insert(&nonce, header.sent_at(now), now, tolerance)
        {
            trace!(origin = %from, "replayed frame");
            self.bad.report(BadKind::Difftime, from, now);
            return None;
        }

        Some(header.kind)
    }

    fn on_data(&mut self, len: usize, from: &PathAddr, buf: &mut [u8], now: u64) -> Option<usize> {
        let Some(index) = self.paths.lookup(&from.interface, from.remote) else {
            trace!(origin = %from.remote, "data from unknown path");
            return None;
        };
        if let Some(path) = self.paths.get_mut(index) {
            path.on_received(len, now);
        }

        let n = self.plain.len().min(buf.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        Some(n)
    }

    async fn on_message(&mut self, len: usize, from: &PathAddr, now: u64) -> TunnelResult<()> {
        let msg = match Message::decode(&self.plain) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(origin = %from.remote, error = %e, "undecodable message");
                return Ok(());
            }
        };

        let suite = CipherSuite::negotiate(self.aes, msg.aes);
        if self
            .kx
            .on_peer_keys(&self.psk, &msg.public_key, &msg.remote_public_key, suite)
            .is_err()
        {
            self.bad.report(BadKind::Keyx, from.remote, now);
            return Ok(());
        }

        let index = match self.paths.lookup(&from.interface, from.remote) {
            Some(index) => index,
            None if msg.reply => {
                trace!(origin = %from.remote, "reply from unknown path");
                return Ok(());
            }
            None => match self
                .paths
                .insert(Path::learned(from.interface.clone(), from.remote, now))
            {
                Ok(index) => index,
                Err(e) => {
                    warn!(origin = %from.remote, error = %e, "cannot learn path");
                    return Ok(());
                }
            },
        };

        let Some(path) = self.paths.get_mut(index) else {
            return Ok(());
        };
        path.on_received(len, now);
        let announced = msg.policy(path.interface.clone());
        path.adopt(&announced);
        if msg.reply {
            path.on_reply(&msg.feedback(), now);
        } else {
            path.on_request(msg.rx_max_rate);
        }
        self.paths.classify();

        if !msg.reply {
            let out = Outgoing::Reply { to: &msg, size: len };
            self.send_message(index, out, now).await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, index: usize, out: Outgoing<'_>, now: u64) -> TunnelResult<()> {
        let Some(path) = self.paths.get(index) else {
            return Ok(());
        };

        let mut msg = Message {
            aes: self.aes,
            public_key: *self.kx.public_key(),
            remote_public_key: self.kx.remote_public_key(),
            rx_total: path.rx.total,
            rx_bytes: path.rx.bytes,
            loss: path.tx.loss,
            ..Message::default()
        };
        msg.set_policy(path.policy());

        let pad = match out {
            Outgoing::Request { probe } => {
                let pad = probe.map_or(0, |size| size.saturating_sub(FRAME_OVERHEAD));
                let len = pad.max(MESSAGE_SIZE) + FRAME_OVERHEAD;
                msg.sent_time = now;
                msg.tx_total = path.tx.total.saturating_add(1);
                msg.tx_bytes = path.tx.bytes.saturating_add(len as u64);
                pad
            }
            Outgoing::Reply { to, size } => {
                msg.reply = true;
                msg.sent_time = to.sent_time;
                msg.tx_total = to.tx_total;
                msg.tx_bytes = to.tx_bytes;
                msg.mtu = u16::try_from(size).unwrap_or(u16::MAX);
                0
            }
        };

        let mut frame = new_frame(FrameKind::Message, now);
        msg.encode(&mut frame, pad);
        self.control.seal(&mut frame)?;

        let to = PathAddr::new(path.interface.clone(), path.remote);
        self.transport.send_to(&frame, &to).await?;
        if let Some(path) = self.paths.get_mut(index) {
            path.on_sent(frame.len(), now);
            path.charge(frame.len(), now);
        }
        trace!(path = %to.remote, len = frame.len(), reply = msg.reply, "message sent");
        Ok(())
    }
}

fn new_frame(kind: FrameKind, now: u64) -> Vec<u8> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut frame = Vec::with_capacity(MTU_MAX_V4);
    frame.extend_from_slice(&FrameHeader::new(kind, now, salt).to_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::core::InterfaceName;
    use crate::path::PathState;

    async fn tunnel() -> Tunnel {
        Tunnel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    /// Transport whose sends always fail.
    #[derive(Debug)]
    struct Unreachable;

    impl Transport for Unreachable {
        async fn send_to(&self, _buf: &[u8], _to: &PathAddr) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, PathAddr)> {
            std::future::pending().await
        }

        async fn writable(&self) -> io::Result<()> {
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
        }
    }

    #[test]
    fn test_new_frame_header() {
        let frame = new_frame(FrameKind::Message, 1234);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE);
        assert_eq!(frame[0], FrameKind::Message.as_byte());

        let other = new_frame(FrameKind::Message, 1234);
        assert_ne!(frame[7..], other[7..], "salt is random");
    }

    #[tokio::test]
    async fn test_set_key_rejects_bad_length() {
        let mut t = tunnel().await;
        t.set_key(&[7; KEY_SIZE]).unwrap();

        let err = t.set_key(&[1; 16]).unwrap_err();
        assert!(matches!(err, TunnelError::Config(ConfigError::InvalidKeyLength(16))));
        assert_eq!(*t.key(), [7; KEY_SIZE]);
    }

    #[tokio::test]
    async fn test_set_state_without_peer() {
        let mut t = tunnel().await;
        let eth0 = InterfaceName::new("eth0").unwrap();

        let err = t.set_state(PathPolicy::new(eth0, PathState::Up)).unwrap_err();
        assert!(matches!(err, TunnelError::Config(ConfigError::UnknownInterface(_))));
        assert!(t.paths().is_empty());
    }

    #[tokio::test]
    async fn test_set_state_creates_then_updates() {
        let mut t = tunnel().await;
        t.peer("127.0.0.1:9".parse().unwrap());
        let eth0 = InterfaceName::new("eth0").unwrap();

        t.set_state(PathPolicy::new(eth0.clone(), PathState::Backup)).unwrap();
        t.set_state(PathPolicy::new(eth0.clone(), PathState::Up).with_preferred(true))
            .unwrap();

        let paths = t.paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].state(), PathState::Up);
        assert!(paths[0].policy().preferred);
    }

    #[tokio::test]
    async fn test_invalid_policy_changes_nothing() {
        let mut t = tunnel().await;
        t.peer("127.0.0.1:9".parse().unwrap());
        let eth0 = InterfaceName::new("eth0").unwrap();
        t.set_state(PathPolicy::new(eth0.clone(), PathState::Up)).unwrap();

        let bad = PathPolicy::new(eth0, PathState::Backup).with_rtt_limit(Duration::ZERO);
        assert!(t.set_state(bad).is_err());
        assert_eq!(t.paths()[0].state(), PathState::Up);
    }

    #[tokio::test]
    async fn test_send_without_paths() {
        let mut t = tunnel().await;
        assert!(matches!(t.send(b"x").await, Err(TunnelError::NoUsablePath)));
    }

    #[tokio::test]
    async fn test_update_completes_pass_before_failing() {
        let mut t = Tunnel::with_transport(Unreachable).unwrap();
        t.peer("127.0.0.1:9".parse().unwrap());
        for name in ["eth0", "eth1"] {
            let policy = PathPolicy::new(InterfaceName::new(name).unwrap(), PathState::Up);
            t.set_state(policy).unwrap();
        }

        let err = t.update().await.unwrap_err();
        assert!(matches!(err, TunnelError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));

        // Both paths were ticked and both requests attempted.
        let paths = t.paths();
        assert_eq!(paths.len(), 2);
        for path in &paths {
            assert_eq!(path.msg.sent, 1);
            assert_eq!(path.tx.total, 0, "nothing left the host");
        }
    }

    #[tokio::test]
    async fn test_set_conf_validates() {
        let mut t = tunnel().await;
        let conf = TunnelConfig::new().with_keepalive(Duration::ZERO);
        assert!(t.set_conf(conf).is_err());
        assert_eq!(t.conf(), &TunnelConfig::default());
    }
}
