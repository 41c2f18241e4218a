//! message transports for the unmount handshake.
//!
//! The handshake state machines are transport-independent; anything that can
//! carry small datagrams in order works. Two transports are provided: an
//! in-process channel pair for the common single-process case, and unix
//! datagram sockets named after the mountpoint so a separate process can
//! drive the unmount.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use crate::digest::digest_bytes;
use crate::error::{Error, IoResultExt, Result};
use crate::protocol::MAX_MESSAGE_SIZE;

/// one endpoint of a message transport. send() queues a datagram for the
/// peer; recv() waits for the next one, returning None on timeout.
pub trait Channel: Send + Sync {
    fn send(&self, message: &[u8]) -> Result<()>;
    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// in-process endpoint: two mpsc queues, one per direction
pub struct PairChannel {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

/// create two connected endpoints
pub fn channel_pair() -> (PairChannel, PairChannel) {
    let (tx_a, rx_a) = mpsc::channel();
    let (tx_b, rx_b) = mpsc::channel();
    (
        PairChannel {
            tx: tx_a,
            rx: Mutex::new(rx_b),
        },
        PairChannel {
            tx: tx_b,
            rx: Mutex::new(rx_a),
        },
    )
}

impl Channel for PairChannel {
    fn send(&self, message: &[u8]) -> Result<()> {
        self.tx
            .send(message.to_vec())
            .map_err(|_| Error::ChannelClosed)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let rx = self.rx.lock().map_err(|_| Error::ChannelClosed)?;
        match rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }
}

/// socket paths for a mountpoint: (invoker-to-daemon, daemon-to-invoker).
/// names are derived from the mountpoint so they are system-wide unique.
pub fn socket_paths(mountpoint: &Path) -> (PathBuf, PathBuf) {
    let tag = digest_bytes(mountpoint.as_os_str().as_bytes()).to_hex();
    let tag = &tag[..16];
    let dir = std::env::temp_dir();
    (
        dir.join(format!("bale-u2d-{}.sock", tag)),
        dir.join(format!("bale-d2u-{}.sock", tag)),
    )
}

/// cross-process endpoint over unix datagram sockets
pub struct SocketChannel {
    socket: UnixDatagram,
    peer: PathBuf,
    local: PathBuf,
}

impl SocketChannel {
    /// daemon side: receives requests, replies toward the invoker socket
    pub fn daemon_endpoint(mountpoint: &Path) -> Result<Self> {
        let (u2d, d2u) = socket_paths(mountpoint);
        Self::bind(u2d, d2u)
    }

    /// invoker side: sends requests, receives replies
    pub fn invoker_endpoint(mountpoint: &Path) -> Result<Self> {
        let (u2d, d2u) = socket_paths(mountpoint);
        Self::bind(d2u, u2d)
    }

    /// true if a daemon socket exists for the mountpoint
    pub fn exists_for(mountpoint: &Path) -> bool {
        socket_paths(mountpoint).0.exists()
    }

    fn bind(local: PathBuf, peer: PathBuf) -> Result<Self> {
        // a stale socket from a crashed daemon must not block a new mount
        let _ = fs::remove_file(&local);
        let socket = UnixDatagram::bind(&local).with_path(&local)?;
        Ok(Self {
            socket,
            peer,
            local,
        })
    }
}

impl Channel for SocketChannel {
    fn send(&self, message: &[u8]) -> Result<()> {
        match self.socket.send_to(message, &self.peer) {
            Ok(_) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                Err(Error::ChannelClosed)
            }
            Err(e) => Err(Error::Io {
                path: self.peer.clone(),
                source: e,
            }),
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.socket
            .set_read_timeout(Some(timeout))
            .with_path(&self.local)?;
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Io {
                path: self.local.clone(),
                source: e,
            }),
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.local);
    }
}
