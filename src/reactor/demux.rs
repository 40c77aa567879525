//! I/O readiness demultiplexer.
//!
//! A thin wrapper over the kernel's edge-triggered readiness mechanism via
//! `mio::Poll`. The demultiplexer is thread-compatible, not thread-safe:
//! only the owning [`Dispatcher`](crate::Dispatcher) waits for events.
//! Interest operations go through a cloned [`Registry`], which is safe to
//! call from worker threads while the reactor thread is parked in the
//! kernel; that is how channels toggle their write interest.

use crate::error::Error;
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, RwLock};
use tracing::{debug, error, trace};

/// Token reserved for the cross-thread waker. Never collides with a
/// descriptor token.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default capacity of the per-wait event batch.
pub const DEFAULT_EVENT_CAPACITY: usize = 512;

/// A readiness bitmask decoded into its interesting bits.
///
/// `hangup` is set only for a hangup delivered without readable data; a
/// peer FIN arrives as `readable` so the drain loop can observe the
/// end-of-stream read and run the close path exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl EventSet {
    pub fn is_fatal(&self) -> bool {
        self.error || self.hangup
    }
}

impl From<&Event> for EventSet {
    fn from(event: &Event) -> Self {
        let readable = event.is_readable();
        Self {
            readable,
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() && !readable,
        }
    }
}

/// Wrapper over the readiness descriptor: register / modify / remove
/// interest, block for a bounded batch of ready events.
pub struct Demultiplexer {
    poll: Mutex<Option<Poll>>,
    registry: RwLock<Option<Registry>>,
    waker: Waker,
}

impl Demultiplexer {
    /// Allocates the readiness descriptor and its waker.
    ///
    /// Fails with [`Error::Io`] when the kernel refuses the allocation.
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(Some(poll)),
            registry: RwLock::new(Some(registry)),
            waker,
        })
    }

    /// The default interest mask: edge-triggered readable. Hangup and
    /// error conditions are always reported by the kernel.
    pub fn default_interest() -> Interest {
        Interest::READABLE
    }

    /// Adds `fd` with the default interest mask.
    pub fn register_fd(&self, fd: RawFd) -> Result<(), Error> {
        self.register_fd_with(fd, Self::default_interest())
    }

    /// Adds `fd` with an explicit interest mask. The descriptor doubles as
    /// the event token.
    pub fn register_fd_with(&self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let Some(registry) = registry.as_ref() else {
            trace!(fd, "Register ignored: demultiplexer shut down");
            return Ok(());
        };
        if let Err(err) = registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
            error!(fd, ?interest, ?err, "Failed to register descriptor");
            return Err(err.into());
        }
        trace!(fd, ?interest, "Registered descriptor");
        Ok(())
    }

    /// Replaces the interest mask of a registered descriptor. Re-arms the
    /// edge, so pending readiness is reported again.
    pub fn modify_interest(&self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let Some(registry) = registry.as_ref() else {
            trace!(fd, "Modify ignored: demultiplexer shut down");
            return Ok(());
        };
        if let Err(err) = registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest) {
            error!(fd, ?interest, ?err, "Failed to modify descriptor interest");
            return Err(err.into());
        }
        trace!(fd, ?interest, "Modified descriptor interest");
        Ok(())
    }

    /// Removes a descriptor from the interest list.
    pub fn remove_fd(&self, fd: RawFd) -> Result<(), Error> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let Some(registry) = registry.as_ref() else {
            trace!(fd, "Remove ignored: demultiplexer shut down");
            return Ok(());
        };
        if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
            error!(fd, ?err, "Failed to remove descriptor");
            return Err(err.into());
        }
        trace!(fd, "Removed descriptor");
        Ok(())
    }

    /// Blocks until at least one descriptor is ready, filling `events`.
    ///
    /// Returns the number of ready events. Signal interruption returns
    /// `Ok(0)`; callers retry. After shutdown, always returns `Ok(0)`.
    pub fn wait_for_events(&self, events: &mut Events) -> Result<usize, Error> {
        let mut poll = self.poll.lock().expect("poll lock poisoned");
        let Some(poll) = poll.as_mut() else {
            events.clear();
            return Ok(0);
        };
        match poll.poll(events, None) {
            Ok(()) => Ok(events.iter().count()),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Wakes a thread blocked in [`wait_for_events`](Self::wait_for_events).
    /// Effective even when issued before the wait begins.
    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            error!(?err, "Failed to wake demultiplexer");
        }
    }

    /// Closes the readiness descriptor. Idempotent. Blocks until a
    /// concurrent wait (if any) has returned.
    pub fn shutdown(&self) {
        self.registry.write().expect("registry lock poisoned").take();
        self.wake();
        let closed = self.poll.lock().expect("poll lock poisoned").take();
        if closed.is_some() {
            debug!("Closed readiness descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn reports_readiness_for_registered_fd() {
        let demux = Demultiplexer::new().expect("demux");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let fd = listener.as_raw_fd();

        // A pending connection makes the listener readable; registration
        // arms the edge even though the connection predates it.
        let _client = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        demux.register_fd(fd).expect("register");

        let mut events = Events::with_capacity(8);
        let n = demux.wait_for_events(&mut events).expect("wait");
        assert!(n >= 1);
        let event = events.iter().next().expect("one event");
        assert_eq!(event.token(), Token(fd as usize));
        let set = EventSet::from(event);
        assert!(set.readable);
        assert!(!set.is_fatal());

        demux.remove_fd(fd).expect("remove");
        demux.shutdown();
    }

    #[test]
    fn wake_interrupts_wait() {
        let demux = std::sync::Arc::new(Demultiplexer::new().expect("demux"));
        let waker_side = std::sync::Arc::clone(&demux);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker_side.wake();
        });

        let mut events = Events::with_capacity(8);
        let n = demux.wait_for_events(&mut events).expect("wait");
        assert_eq!(n, 1);
        assert_eq!(events.iter().next().unwrap().token(), WAKE_TOKEN);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_is_idempotent_and_waits_return_empty() {
        let demux = Demultiplexer::new().expect("demux");
        demux.shutdown();
        demux.shutdown();

        let mut events = Events::with_capacity(8);
        assert_eq!(demux.wait_for_events(&mut events).expect("wait"), 0);
        // Interest operations become no-ops after shutdown.
        demux.register_fd(10).expect("no-op register");
    }
}
