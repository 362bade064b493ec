//! The fetch client inside the shadow filesystem.

use std::{
    io::{ErrorKind, Read as _, Write as _},
    os::{
        fd::AsRawFd as _,
        linux::net::SocketAddrExt as _,
        unix::net::{SocketAddr, UnixStream},
    },
    sync::atomic::Ordering,
    time::Instant,
};

use atomic_time::AtomicInstant;
use tracing::{debug, warn};

use crate::{
    config::{DEADTIME_WINDOW, SHORT_DEADLINE, SYNC_DEADLINE},
    proto::{self, Prefix, Request},
};

/// Client side of the fetch protocol, one per mounted tree.
///
/// On the first access to a path the debugger is already blocked inside a
/// stat, so a short synchronous wait is tolerable and lets the re-stat see
/// the hydrated file. Refresh requests never wait. `deadtime` keeps a
/// burst of slow lookups from serializing: after a nominal-deadline
/// timeout, lookups in the next few seconds only wait the short deadline.
pub struct Trigger {
    prefix: Prefix,
    socket_name: Vec<u8>,
    deadtime: AtomicInstant,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("prefix", &self.prefix)
            .field("socket_name", &self.socket_name)
            .field("deadtime", &self.deadtime.load(Ordering::Relaxed))
            .finish()
    }
}

impl Trigger {
    pub fn new(prefix: Prefix) -> Self {
        Self::with_socket(prefix, proto::SOCKET_NAME)
    }

    fn with_socket(prefix: Prefix, socket_name: &[u8]) -> Self {
        Self {
            prefix,
            socket_name: socket_name.to_owned(),
            deadtime: AtomicInstant::now(),
        }
    }

    /// Ask the daemon for `path`. A zero `timestamp` means "not cached":
    /// wait (bounded) so the following stat can see the file. A non-zero
    /// timestamp is a fire-and-forget refresh hint.
    pub fn try_to_get(&self, path: &str, caller_pid: u32, timestamp: u64) {
        let Ok(addr) = SocketAddr::from_abstract_name(&self.socket_name) else {
            return;
        };
        let mut stream = match UnixStream::connect_addr(&addr) {
            Ok(stream) => stream,
            Err(error) => {
                debug!(?error, "cannot reach the fetch daemon");
                return;
            }
        };

        // A daemon operation that wanders under our own mount arrives here
        // with the daemon's pid as the caller; serving it would deadlock
        // the mount.
        if peer_pid(&stream) == Some(caller_pid as libc::pid_t) {
            warn!(%path, "recursion: the fetch daemon touched its own mount");
            return;
        }

        let request = Request {
            timestamp,
            prefix: self.prefix,
            path: path.to_owned(),
        };
        if stream.write_all(&request.encode()).is_err() {
            return;
        }

        if timestamp != 0 {
            return;
        }

        let short = self.deadline_active();
        let wait = if short { SHORT_DEADLINE } else { SYNC_DEADLINE };
        if stream.set_read_timeout(Some(wait)).is_err() {
            return;
        }

        let mut reply = [0u8; proto::REPLY_OK.len()];
        match stream.read(&mut reply) {
            Ok(_) => {}
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if !short {
                    debug!(%path, "fetch daemon deadline expired");
                    self.deadtime
                        .store(Instant::now() + DEADTIME_WINDOW, Ordering::Relaxed);
                }
            }
            Err(_) => {}
        }
    }

    /// Whether lookups are currently held to the short deadline.
    fn deadline_active(&self) -> bool {
        self.deadtime.load(Ordering::Relaxed) > Instant::now()
    }
}

/// Pid of the process on the other end of the socket.
fn peer_pid(stream: &UnixStream) -> Option<libc::pid_t> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    (rc == 0).then_some(cred.pid)
}
