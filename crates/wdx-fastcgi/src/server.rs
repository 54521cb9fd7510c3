//! The FastCGI server loop over an owned or inherited Unix socket.

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};
use wdx_core::Clock;
use wdx_fileio::sys;

use crate::request::Request;

/// Handles accepted requests; invoked once per request.
pub trait RequestHandler: Send + Sync {
    /// Takes ownership of the accepted request.
    fn handle(&self, request: Request);
}

/// Creation options for a freshly opened listening socket.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Filesystem mode of the socket node.
    pub mode: u32,
    /// Owner and group the socket node is chowned to.
    pub owner: Option<(String, String)>,
    /// Listen backlog.
    pub backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            mode: 0o660,
            owner: Some(("www".to_owned(), "www".to_owned())),
            backlog: 32,
        }
    }
}

/// Server construction failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket syscall failure.
    #[error("failed to open FastCGI socket: {0}")]
    Io(#[from] io::Error),
    /// The socket node could not be handed to its configured owner.
    #[error("failed to change socket owner/group to {owner}:{group}: {source}")]
    SocketOwner {
        /// Configured owner.
        owner: String,
        /// Configured group.
        group: String,
        /// The failing syscall's error.
        #[source]
        source: io::Error,
    },
    /// No inherited descriptor carries the requested name.
    #[error("no service-manager socket named \"{0}\"")]
    UnknownSocketName(String),
}

/// Owns the listening socket and dispatches accepted requests.
pub struct Server {
    listener: UnixListener,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Opens or adopts the listening socket.
    ///
    /// An absolute or dot-relative filesystem path creates a new socket
    /// node; any other string is looked up among the descriptors inherited
    /// from the service manager.
    pub fn open(
        socket: &str,
        options: &SocketOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        if socket.starts_with('/') || socket.starts_with('.') {
            info!(path = socket, "FastCGI socket path given, opening new socket");
            Self::open_path(socket, options, clock)
        } else {
            info!(name = socket, "FastCGI socket name given, adopting inherited descriptor");
            Self::adopt_named(socket, clock)
        }
    }

    fn open_path(
        path: &str,
        options: &SocketOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServerError> {
        // a stale node from an earlier run would make bind fail
        let _ = fs::remove_file(path);

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_cloexec(true)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(options.backlog)?;
        fs::set_permissions(path, fs::Permissions::from_mode(options.mode))?;
        if let Some((owner, group)) = &options.owner {
            sys::chown_path(Path::new(path), owner, group).map_err(|source| {
                ServerError::SocketOwner {
                    owner: owner.clone(),
                    group: group.clone(),
                    source,
                }
            })?;
        }

        Ok(Self {
            listener: socket.into(),
            clock,
        })
    }

    fn adopt_named(name: &str, clock: Arc<dyn Clock>) -> Result<Self, ServerError> {
        // service managers pass sockets starting at descriptor 3, with
        // their names colon-separated in LISTEN_FDNAMES
        let count = env::var("LISTEN_FDS")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(0);
        let names = env::var("LISTEN_FDNAMES").unwrap_or_default();
        let index = names
            .split(':')
            .position(|candidate| candidate == name)
            .filter(|&index| index < count)
            .ok_or_else(|| ServerError::UnknownSocketName(name.to_owned()))?;

        let fd = 3 + index as RawFd;
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc != 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        let listener = unsafe { UnixListener::from_raw_fd(fd) };
        Ok(Self { listener, clock })
    }

    /// Wraps an already-bound listener; used by tests and embedders.
    pub fn from_listener(listener: UnixListener, clock: Arc<dyn Clock>) -> Self {
        Self { listener, clock }
    }

    /// Waits up to `timeout_ms` for a connection and dispatches it.
    ///
    /// Returns whether a connection was handled. The call always consumes at
    /// least the full timeout when nothing arrives, so a dispatch loop makes
    /// forward progress without busy-spinning even when poll keeps failing.
    pub fn receive_next(&self, handler: &dyn RequestHandler, timeout_ms: u32) -> bool {
        let started = self.clock.monotonic();
        let mut fds = [libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms as i32) };

        if rc > 0 && (fds[0].revents & libc::POLLIN) != 0 {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let mut request = Request::new(stream);
                    match request.accept() {
                        Ok(true) => handler.handle(request),
                        Ok(false) => {}
                        Err(error) => warn!(%error, "failed to accept FastCGI request"),
                    }
                }
                Err(error) => warn!(%error, "failed to accept FastCGI connection"),
            }
            return true;
        }

        let elapsed = self.clock.monotonic().saturating_sub(started);
        let timeout = Duration::from_millis(u64::from(timeout_ms));
        if elapsed < timeout {
            debug!("poll returned early, sleeping for the rest of the timeout");
            self.clock.sleep(timeout - elapsed);
        }
        false
    }
}
