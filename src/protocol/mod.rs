//! the two-channel unmount handshake.
//!
//! The mount daemon and the unmount invoker are separate asynchronous actors
//! talking over two point-to-point channels: requests travel invoker-to-daemon
//! (channel A), replies daemon-to-invoker (channel B). Each channel delivers
//! in order on its own; nothing is assumed across channels. Messages carry a
//! fixed little-endian header followed by a typed payload; a message whose
//! minimum compatible version is newer than the receiver's is unreadable by
//! design and the receiver simply keeps waiting.

pub mod channel;
pub mod daemon;
pub mod invoker;

pub use channel::{channel_pair, socket_paths, Channel, PairChannel, SocketChannel};
pub use daemon::{run_daemon, DaemonState};
pub use invoker::{run_invoker, InvokerState, LivenessProbe, ProcessProbe, DEFAULT_REPLY_TIMEOUT};

use crate::error::{Error, Result};

/// pack a version as major/minor/patch, same layout as the header fields
pub const fn make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 20) | (minor << 10) | patch
}

/// protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = make_version(0, 1, 0);
/// oldest version able to read our messages
pub const MIN_COMPAT_VERSION: u32 = make_version(0, 1, 0);

/// fixed header: min_version, cur_version, msg_type, msg_size (all u32 LE)
pub const HEADER_SIZE: usize = 16;
/// upper bound on an encoded message
pub const MAX_MESSAGE_SIZE: usize = 512;

const MSG_TYPE_REQUEST: u32 = 0;
const MSG_TYPE_DAEMON_INFO: u32 = 1;
const MSG_TYPE_FINISHED: u32 = 2;

/// a handshake message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    /// invoker -> daemon: please unmount with these flags
    Request { unmount_flags: u32 },
    /// daemon -> invoker: who I am and how the image is mounted
    DaemonInfo { daemon_pid: u32, mount_flags: u32 },
    /// daemon -> invoker: unmount finished with this status
    Finished { status: i32 },
}

impl Message {
    fn msg_type(&self) -> u32 {
        match self {
            Message::Request { .. } => MSG_TYPE_REQUEST,
            Message::DaemonInfo { .. } => MSG_TYPE_DAEMON_INFO,
            Message::Finished { .. } => MSG_TYPE_FINISHED,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Message::Request { .. } => 4,
            Message::DaemonInfo { .. } => 8,
            Message::Finished { .. } => 4,
        }
    }

    /// encode header and payload, little-endian throughout
    pub fn encode(&self) -> Vec<u8> {
        let size = HEADER_SIZE + self.payload_size();
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&MIN_COMPAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.msg_type().to_le_bytes());
        buf.extend_from_slice(&(size as u32).to_le_bytes());
        match self {
            Message::Request { unmount_flags } => {
                buf.extend_from_slice(&unmount_flags.to_le_bytes());
            }
            Message::DaemonInfo {
                daemon_pid,
                mount_flags,
            } => {
                buf.extend_from_slice(&daemon_pid.to_le_bytes());
                buf.extend_from_slice(&mount_flags.to_le_bytes());
            }
            Message::Finished { status } => {
                buf.extend_from_slice(&status.to_le_bytes());
            }
        }
        buf
    }
}

/// result of decoding a received datagram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Message(Message),
    /// sender requires a newer receiver; not an error, keep waiting
    FutureVersion,
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

/// validate and decode one message. the declared size must match the
/// received length and the type's expected size exactly.
pub fn decode(buf: &[u8], own_version: u32) -> Result<Decoded> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::InvalidMessage(format!(
            "message shorter than header: {} bytes",
            buf.len()
        )));
    }
    let min_version = read_u32(buf, 0);
    let msg_type = read_u32(buf, 8);
    let msg_size = read_u32(buf, 12) as usize;

    if msg_size != buf.len() {
        return Err(Error::InvalidMessage(format!(
            "declared size {} does not match received {}",
            msg_size,
            buf.len()
        )));
    }
    if min_version > own_version {
        return Ok(Decoded::FutureVersion);
    }

    let message = match msg_type {
        MSG_TYPE_REQUEST => {
            expect_size(msg_size, HEADER_SIZE + 4, "request")?;
            Message::Request {
                unmount_flags: read_u32(buf, HEADER_SIZE),
            }
        }
        MSG_TYPE_DAEMON_INFO => {
            expect_size(msg_size, HEADER_SIZE + 8, "daemon info")?;
            Message::DaemonInfo {
                daemon_pid: read_u32(buf, HEADER_SIZE),
                mount_flags: read_u32(buf, HEADER_SIZE + 4),
            }
        }
        MSG_TYPE_FINISHED => {
            expect_size(msg_size, HEADER_SIZE + 4, "finished")?;
            Message::Finished {
                status: read_i32(buf, HEADER_SIZE),
            }
        }
        other => {
            return Err(Error::InvalidMessage(format!(
                "unknown message type {}",
                other
            )))
        }
    };
    Ok(Decoded::Message(message))
}

fn expect_size(got: usize, want: usize, what: &str) -> Result<()> {
    if got != want {
        return Err(Error::InvalidMessage(format!(
            "{} message has size {}, expected {}",
            what, got, want
        )));
    }
    Ok(())
}
