//! daemon side of the unmount handshake.
//!
//! WaitingForRequest -> RunningCommit -> SentFinished -> Terminated.
//! The daemon replies with DaemonInfo immediately on receiving a request,
//! runs the commit (or nothing, on a read-only mount or discard), and always
//! sends Finished regardless of the commit outcome. A version-incompatible
//! message restarts the wait; an idle daemon may time out and exit cleanly.

use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::channel::Channel;
use crate::protocol::{decode, Decoded, Message, PROTOCOL_VERSION};

/// daemon states, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonState {
    WaitingForRequest,
    RunningCommit,
    SentFinished,
    Terminated,
}

/// recv slice used when waiting forever
const WAIT_SLICE: Duration = Duration::from_secs(3600);

/// run the daemon message loop until the handshake completes or fails.
///
/// `on_request` performs the commit/cleanup work and returns the status to
/// report in Finished. With an `idle_timeout`, a daemon that never receives
/// the initial request exits cleanly.
pub fn run_daemon<C: Channel + ?Sized>(
    channel: &C,
    daemon_pid: u32,
    mount_flags: u32,
    idle_timeout: Option<Duration>,
    mut on_request: impl FnMut(u32) -> i32,
) -> Result<()> {
    let mut state = DaemonState::WaitingForRequest;
    let mut unmount_flags = 0u32;
    let mut status = 0i32;

    while state != DaemonState::Terminated {
        match state {
            DaemonState::WaitingForRequest => {
                let wait = idle_timeout.unwrap_or(WAIT_SLICE);
                let Some(bytes) = channel.recv(wait)? else {
                    if idle_timeout.is_some() {
                        debug!("no unmount request before idle timeout, exiting cleanly");
                        return Ok(());
                    }
                    continue;
                };
                match decode(&bytes, PROTOCOL_VERSION)? {
                    Decoded::FutureVersion => {
                        debug!("ignoring message from a newer sender");
                    }
                    Decoded::Message(Message::Request { unmount_flags: flags }) => {
                        debug!(flags, "received unmount request");
                        channel.send(
                            &Message::DaemonInfo {
                                daemon_pid,
                                mount_flags,
                            }
                            .encode(),
                        )?;
                        unmount_flags = flags;
                        state = DaemonState::RunningCommit;
                    }
                    Decoded::Message(other) => {
                        return Err(Error::InvalidMessage(format!(
                            "unexpected {:?} on the request channel",
                            other
                        )));
                    }
                }
            }
            DaemonState::RunningCommit => {
                status = on_request(unmount_flags);
                channel.send(&Message::Finished { status }.encode())?;
                state = DaemonState::SentFinished;
            }
            DaemonState::SentFinished => {
                debug!(status, "handshake complete");
                state = DaemonState::Terminated;
            }
            DaemonState::Terminated => {}
        }
    }
    Ok(())
}
