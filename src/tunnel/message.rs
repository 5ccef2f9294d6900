//! Control message codec.
//!
//! Control messages carry keepalives, path feedback, MTU probes and the key
//! exchange. The plaintext is a fixed layout, zero-padded when probing:
//!
//! ```text
//! flags (1) | state (1) | sent_time (8) |
//! public_key (32) | remote_public_key (32) |
//! tx_total (8) | tx_bytes (8) | rx_total (8) | rx_bytes (8) |
//! tx_max_rate (8) | rx_max_rate (8) | beat (8) | loss (1) |
//! fixed_rate (1) | preferred (1) | loss_limit (1) | rtt_limit (8) | mtu (2)
//! ```
//!
//! Integers are little-endian; durations are microseconds.

use std::time::Duration;

use crate::core::{FrameError, InterfaceName, PathPolicy, PUBLIC_KEY_SIZE};
use crate::path::{PathState, Reply};

/// Encoded size of a control message without padding.
pub const MESSAGE_SIZE: usize = 144;

const FLAG_REPLY: u8 = 0x01;
const FLAG_AES: u8 = 0x02;

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Answers a request.
    pub reply: bool,
    /// Sender supports AES-256-GCM.
    pub aes: bool,
    /// Sender's requested state for this path.
    pub state: PathState,
    /// Request: sender clock. Reply: the request's, echoed.
    pub sent_time: u64,
    /// Sender's X25519 public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Last public key the sender saw from us.
    pub remote_public_key: [u8; PUBLIC_KEY_SIZE],
    /// Request: sender's frames sent. Reply: the request's, echoed.
    pub tx_total: u64,
    /// Request: sender's bytes sent. Reply: the request's, echoed.
    pub tx_bytes: u64,
    /// Frames the sender received on this path.
    pub rx_total: u64,
    /// Bytes the sender received on this path.
    pub rx_bytes: u64,
    /// Sender's transmit ceiling.
    pub tx_max_rate: u64,
    /// Sender's receive ceiling.
    pub rx_max_rate: u64,
    /// Sender's message interval.
    pub beat: Duration,
    /// Loss the sender measured on its side.
    pub loss: u8,
    /// Sender pins its rate.
    pub fixed_rate: bool,
    /// Sender marks the path preferred.
    pub preferred: bool,
    /// Sender's loss limit.
    pub loss_limit: u8,
    /// Sender's RTT limit.
    pub rtt_limit: Duration,
    /// Reply: size of the request datagram as received.
    pub mtu: u16,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            reply: false,
            aes: false,
            state: PathState::Down,
            sent_time: 0,
            public_key: [0; PUBLIC_KEY_SIZE],
            remote_public_key: [0; PUBLIC_KEY_SIZE],
            tx_total: 0,
            tx_bytes: 0,
            rx_total: 0,
            rx_bytes: 0,
            tx_max_rate: 0,
            rx_max_rate: 0,
            beat: Duration::ZERO,
            loss: 0,
            fixed_rate: false,
            preferred: false,
            loss_limit: 0,
            rtt_limit: Duration::ZERO,
            mtu: 0,
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 2]);
        self.pos += 2;
        u16::from_le_bytes(b)
    }

    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        u64::from_le_bytes(b)
    }

    fn key(&mut self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut k = [0u8; PUBLIC_KEY_SIZE];
        k.copy_from_slice(&self.buf[self.pos..self.pos + PUBLIC_KEY_SIZE]);
        self.pos += PUBLIC_KEY_SIZE;
        k
    }
}

impl Message {
    /// Append the encoding to `out`, zero-padded to at least `len` bytes.
    pub fn encode(&self, out: &mut Vec<u8>, len: usize) {
        let start = out.len();
        let mut flags = 0;
        if self.reply {
            flags |= FLAG_REPLY;
        }
        if self.aes {
            flags |= FLAG_AES;
        }

        out.push(flags);
        out.push(self.state.to_u8());
        out.extend_from_slice(&self.sent_time.to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.remote_public_key);
        out.extend_from_slice(&self.tx_total.to_le_bytes());
        out.extend_from_slice(&self.tx_bytes.to_le_bytes());
        out.extend_from_slice(&self.rx_total.to_le_bytes());
        out.extend_from_slice(&self.rx_bytes.to_le_bytes());
        out.extend_from_slice(&self.tx_max_rate.to_le_bytes());
        out.extend_from_slice(&self.rx_max_rate.to_le_bytes());
        out.extend_from_slice(&micros(self.beat).to_le_bytes());
        out.push(self.loss);
        out.push(u8::from(self.fixed_rate));
        out.push(u8::from(self.preferred));
        out.push(self.loss_limit);
        out.extend_from_slice(&micros(self.rtt_limit).to_le_bytes());
        out.extend_from_slice(&self.mtu.to_le_bytes());

        debug_assert_eq!(out.len() - start, MESSAGE_SIZE);
        if out.len() - start < len {
            out.resize(start + len, 0);
        }
    }

    /// Decode a message, ignoring any padding.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < MESSAGE_SIZE {
            return Err(FrameError::TooShort {
                expected: MESSAGE_SIZE,
                actual: buf.len(),
            });
        }

        let mut r = Reader { buf, pos: 0 };
        let flags = r.u8();
        Ok(Self {
            reply: flags & FLAG_REPLY != 0,
            aes: flags & FLAG_AES != 0,
            state: PathState::from_u8(r.u8()).unwrap_or(PathState::Down),
            sent_time: r.u64(),
            public_key: r.key(),
            remote_public_key: r.key(),
            tx_total: r.u64(),
            tx_bytes: r.u64(),
            rx_total: r.u64(),
            rx_bytes: r.u64(),
            tx_max_rate: r.u64(),
            rx_max_rate: r.u64(),
            beat: Duration::from_micros(r.u64()),
            loss: r.u8(),
            fixed_rate: r.u8() != 0,
            preferred: r.u8() != 0,
            loss_limit: r.u8(),
            rtt_limit: Duration::from_micros(r.u64()),
            mtu: r.u16(),
        })
    }

    /// Copy the announced path policy into a message.
    pub fn set_policy(&mut self, policy: &PathPolicy) {
        self.state = policy.state;
        self.tx_max_rate = policy.tx_max_rate;
        self.rx_max_rate = policy.rx_max_rate;
        self.beat = policy.beat;
        self.fixed_rate = policy.fixed_rate;
        self.preferred = policy.preferred;
        self.loss_limit = policy.loss_limit;
        self.rtt_limit = policy.rtt_limit;
    }

    /// Policy the sender announced, from the sender's side.
    pub fn policy(&self, interface: InterfaceName) -> PathPolicy {
        PathPolicy {
            interface,
            state: self.state,
            tx_max_rate: self.tx_max_rate,
            rx_max_rate: self.rx_max_rate,
            beat: self.beat,
            fixed_rate: self.fixed_rate,
            preferred: self.preferred,
            loss_limit: self.loss_limit,
            rtt_limit: self.rtt_limit,
        }
    }

    /// Feedback carried by a reply, for a request datagram of the echoed size.
    pub fn feedback(&self) -> Reply {
        Reply {
            sent_time: self.sent_time,
            tx_total: self.tx_total,
            tx_bytes: self.tx_bytes,
            rx_total: self.rx_total,
            rx_bytes: self.rx_bytes,
            rx_max_rate: self.rx_max_rate,
            frame_size: usize::from(self.mtu),
        }
    }
}
