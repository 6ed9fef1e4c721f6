//! Socket acquisition: inherited from the service manager or bound fresh

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockopt, sockopt, SockType};
use nix::unistd::getpid;
use std::env;
use std::fs::{self, Permissions};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use tracing::{debug, info};

/// First file descriptor handed over by the service manager
const LISTEN_FDS_START: RawFd = 3;

/// Listeners handed to the process by its service manager
#[derive(Debug, Default)]
pub struct Activation {
    listeners: Vec<UnixListener>,
}

impl Activation {
    /// No inherited listeners
    pub fn none() -> Self {
        Self::default()
    }

    /// Listeners passed through `LISTEN_PID`/`LISTEN_FDS`, if they are meant
    /// for this process. Descriptors that are not stream sockets are skipped.
    pub fn from_env() -> Self {
        let for_us = env::var("LISTEN_PID")
            .ok()
            .and_then(|pid| pid.parse::<i32>().ok())
            .is_some_and(|pid| pid == getpid().as_raw());
        if !for_us {
            return Self::none();
        }
        let count = env::var("LISTEN_FDS")
            .ok()
            .and_then(|n| n.parse::<RawFd>().ok())
            .unwrap_or(0);

        let mut listeners = Vec::new();
        for fd in LISTEN_FDS_START..LISTEN_FDS_START + count {
            // SAFETY: the service manager passed ownership of LISTEN_FDS
            // descriptors starting at 3, and nothing else in this process
            // has claimed them.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            match getsockopt(&owned, sockopt::SockType) {
                Ok(SockType::Stream) => {}
                _ => {
                    debug!(fd, "ignoring inherited descriptor that is not a stream socket");
                    std::mem::forget(owned);
                    continue;
                }
            }
            if let Err(err) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
                debug!(fd, error = %err, "cannot set close-on-exec on inherited socket");
            }
            listeners.push(UnixListener::from(owned));
        }

        Self { listeners }
    }

    pub fn from_listeners(listeners: Vec<UnixListener>) -> Self {
        Self { listeners }
    }

    /// Listener for `path`: the inherited one bound there, or a fresh one.
    ///
    /// The boolean tells whether the listener was inherited.
    pub fn listen(self, path: &Path) -> io::Result<(UnixListener, bool)> {
        for listener in self.listeners {
            let bound_here = listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p == path))
                .unwrap_or(false);
            if bound_here {
                info!(socket = %path.display(), "Using socket-activated listener");
                return Ok((listener, true));
            }
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if UnixStream::connect(path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("socket {path:?} is already in use"),
            ));
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, Permissions::from_mode(0o666))?;
        Ok((listener, false))
    }
}
