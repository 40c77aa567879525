//! Readiness-event handlers.
//!
//! A [`Handler`] translates a raw readiness bitmask into higher-level
//! operations: the [`Accept`](Handler::Accept) variant turns readable
//! events on the listening descriptor into freshly accepted connections,
//! the [`Events`](Handler::Events) variant routes events into its
//! [`Channel`].

use crate::reactor::channel::Channel;
use crate::reactor::demux::EventSet;
use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Per-descriptor event handler, dispatched by match.
#[derive(Clone)]
pub enum Handler {
    /// Accepts connections on the listening descriptor.
    Accept(AcceptHandler),
    /// Drives a connection's channel.
    Events(EventsHandler),
}

impl Handler {
    /// The channel driven by this handler, for the `Events` variant.
    pub fn channel(&self) -> Option<&Arc<Channel>> {
        match self {
            Handler::Accept(_) => None,
            Handler::Events(handler) => Some(handler.channel()),
        }
    }
}

// ============================================================================
// Accept
// ============================================================================

// The accept loop relies on a non-blocking listener; a blocking one would
// park the reactor thread inside accept once the backlog drains.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accepts connections from the listening descriptor.
///
/// The listening descriptor is owned by the [`TcpServer`](crate::TcpServer)
/// that created it; the handler only borrows the raw fd.
#[derive(Clone, Copy, Debug)]
pub struct AcceptHandler {
    master: RawFd,
}

impl AcceptHandler {
    pub fn new(master: RawFd) -> Self {
        Self { master }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master
    }

    /// On read readiness, accepts until the backlog drains.
    ///
    /// Under edge-triggered readiness a single edge may cover several
    /// queued connections, so accepting loops until the kernel reports
    /// `WouldBlock`. Each accepted socket comes back non-blocking and
    /// owned.
    #[instrument(skip(self), fields(master = self.master))]
    pub fn handle_event(&self, events: EventSet) -> Vec<TcpStream> {
        let mut accepted = Vec::new();
        if !events.readable {
            return accepted;
        }
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.master,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Failed to accept new connection");
                        break;
                    }
                }
            }
            // accept4 handed us a fresh descriptor; the stream owns it now.
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            match stream.peer_addr() {
                Ok(peer_addr) => info!(fd, %peer_addr, "Accepted connection"),
                Err(_) => info!(fd, "Accepted connection"),
            }
            accepted.push(stream);
        }
        accepted
    }
}

// ============================================================================
// Events
// ============================================================================

/// Routes readiness events into a channel.
///
/// Exactly one branch runs per invocation: errors take precedence, then
/// read, then write.
#[derive(Clone)]
pub struct EventsHandler {
    channel: Arc<Channel>,
}

impl EventsHandler {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[instrument(skip(self), fields(fd = self.channel.fd()))]
    pub fn handle_event(&self, events: EventSet) {
        if !self.channel.is_active() {
            return;
        }
        if events.is_fatal() {
            self.channel.close();
        } else if events.readable {
            self.channel.read();
        } else if events.writable {
            self.channel.write();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
