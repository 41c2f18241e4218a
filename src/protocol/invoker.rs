//! invoker side of the unmount handshake.
//!
//! WaitingForDaemonInfo -> WaitingForFinished -> Done. The invoker waits on
//! the reply channel with a bounded interval; on timeout it probes daemon
//! liveness. A daemon found alive resets the wait, a dead one yields
//! DaemonCrashed with the outcome unknown. Version-incompatible messages
//! restart the wait without ending the loop.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::channel::Channel;
use crate::protocol::{decode, Decoded, Message, PROTOCOL_VERSION};

/// invoker states, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvokerState {
    WaitingForDaemonInfo,
    WaitingForFinished,
    Done,
}

/// default bounded wait on the reply channel
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// once the daemon has identified itself, probe more often
const KNOWN_DAEMON_TIMEOUT: Duration = Duration::from_secs(1);

/// answers "is this daemon process still running?"
pub trait LivenessProbe {
    fn is_alive(&self, pid: u32) -> Result<bool>;
}

/// probes with a null signal, the usual way to check for a live process
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> Result<bool> {
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(Error::Io {
                path: "<kill>".into(),
                source: std::io::Error::from_raw_os_error(errno as i32),
            }),
        }
    }
}

/// send the unmount request and run the reply loop until Finished arrives,
/// returning the daemon's reported status.
pub fn run_invoker<C: Channel + ?Sized>(
    channel: &C,
    unmount_flags: u32,
    probe: &dyn LivenessProbe,
    timeout: Duration,
) -> Result<i32> {
    channel.send(&Message::Request { unmount_flags }.encode())?;

    let mut state = InvokerState::WaitingForDaemonInfo;
    let mut daemon_pid: Option<u32> = None;
    let mut wait = timeout;

    loop {
        let Some(bytes) = channel.recv(wait)? else {
            // timed out: the only way to learn anything now is the liveness
            // probe. before DaemonInfo there is no pid to probe.
            match daemon_pid {
                None => return Err(Error::DaemonCrashed),
                Some(pid) => {
                    if probe.is_alive(pid)? {
                        debug!(pid, "daemon still alive, waiting again");
                        continue;
                    }
                    return Err(Error::DaemonCrashed);
                }
            }
        };

        match decode(&bytes, PROTOCOL_VERSION)? {
            Decoded::FutureVersion => {
                debug!("ignoring message from a newer daemon");
            }
            Decoded::Message(Message::DaemonInfo {
                daemon_pid: pid,
                mount_flags,
            }) => {
                debug!(pid, mount_flags, "daemon identified itself");
                daemon_pid = Some(pid);
                wait = KNOWN_DAEMON_TIMEOUT.min(timeout);
                state = InvokerState::WaitingForFinished;
            }
            Decoded::Message(Message::Finished { status }) => {
                debug!(status, ?state, "unmount finished");
                return Ok(status);
            }
            Decoded::Message(Message::Request { .. }) => {
                return Err(Error::InvalidMessage(
                    "unexpected request on the reply channel".to_string(),
                ));
            }
        }
    }
}
