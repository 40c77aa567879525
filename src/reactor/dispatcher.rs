//! The event-loop dispatcher.
//!
//! One dispatcher owns one demultiplexer and one handler map, and runs one
//! reactor thread inside [`Dispatcher::dispatch`]. Accept events on the
//! master listening descriptor are handled inline on the reactor thread to
//! keep accept-queue ordering; every other readiness event is shipped to
//! the thread pool so a slow socket never stalls the reactor.
//!
//! In slave mode the master dispatcher only accepts; each new connection is
//! registered round-robin on one of the slave dispatchers, whose loops run
//! on pool workers: the classic one-acceptor / N-I/O-loop pattern. All
//! dispatchers of one server share a single channel registry, so the
//! notification center can look up any channel regardless of which
//! dispatcher accepted it.

use crate::config::get_namespaced_usize;
use crate::error::Error;
use crate::pool::ThreadPool;
use crate::reactor::channel::{Channel, ChannelHooks};
use crate::reactor::demux::{Demultiplexer, EventSet, DEFAULT_EVENT_CAPACITY, WAKE_TOKEN};
use crate::reactor::handler::{AcceptHandler, EventsHandler, Handler};
use mio::Events;
use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

// All dispatchers of one server share this map; a channel is reachable
// here from its accept until its teardown.
type ChannelRegistry = Arc<Mutex<HashMap<RawFd, Arc<Channel>>>>;

type PendingFn = Box<dyn FnOnce() + Send + 'static>;

/// Owns the demultiplexer, the handler map, the master listening
/// descriptor, the slave set, and the pending-functor queue; runs the main
/// event loop.
pub struct Dispatcher {
    stop: AtomicBool,
    enable_slave: AtomicBool,
    master_fd: AtomicI32,
    event_capacity: usize,
    demux: Arc<Demultiplexer>,
    handlers: Mutex<HashMap<RawFd, Handler>>,
    channels: ChannelRegistry,
    hooks: Arc<ChannelHooks>,
    slaves: Mutex<Vec<Arc<Dispatcher>>>,
    next_slave: AtomicUsize,
    pending: Mutex<Vec<PendingFn>>,
    wait_to_remove: Mutex<Vec<RawFd>>,
    pool: Arc<ThreadPool>,
}

// ============================================================================
// Construction
// ============================================================================

impl Dispatcher {
    /// Builds a master dispatcher with a fresh channel registry and hook
    /// table.
    pub fn new(pool: Arc<ThreadPool>) -> Result<Arc<Self>, Error> {
        Self::with_shared(
            pool,
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(ChannelHooks::default()),
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Like [`new`](Self::new), but reads the per-wait event batch size
    /// from the `config` crate. Key: `event_capacity`, optionally
    /// namespaced under `name`; falls back to
    /// [`DEFAULT_EVENT_CAPACITY`](crate::DEFAULT_EVENT_CAPACITY).
    /// Slaves inherit the value.
    pub fn new_named(
        pool: Arc<ThreadPool>,
        config: &::config::Config,
        name: &str,
    ) -> Result<Arc<Self>, Error> {
        let event_capacity = get_namespaced_usize(config, name, "event_capacity")
            .unwrap_or(DEFAULT_EVENT_CAPACITY);
        Self::with_shared(
            pool,
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(ChannelHooks::default()),
            event_capacity,
        )
    }

    // Slaves share the master's registry, hooks, pool, and batch size.
    fn with_shared(
        pool: Arc<ThreadPool>,
        channels: ChannelRegistry,
        hooks: Arc<ChannelHooks>,
        event_capacity: usize,
    ) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            stop: AtomicBool::new(false),
            enable_slave: AtomicBool::new(false),
            master_fd: AtomicI32::new(0),
            event_capacity,
            demux: Arc::new(Demultiplexer::new()?),
            handlers: Mutex::new(HashMap::new()),
            channels,
            hooks,
            slaves: Mutex::new(Vec::new()),
            next_slave: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
            wait_to_remove: Mutex::new(Vec::new()),
            pool,
        }))
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Dispatcher {
    /// Runs the event loop until [`shutdown`](Self::shutdown).
    ///
    /// Blocking call; run it on a dedicated thread (the master) or a pool
    /// worker (slaves).
    #[instrument(skip(self))]
    pub fn dispatch(&self) {
        let mut events = Events::with_capacity(self.event_capacity);
        info!("Dispatcher loop started");
        while !self.stopped() {
            match self.demux.wait_for_events(&mut events) {
                Ok(_) => {}
                Err(err) => {
                    error!(?err, "Failed waiting for events");
                    break;
                }
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;
                let set = EventSet::from(event);

                let handler = {
                    let handlers = self.handlers.lock().expect("handler map poisoned");
                    handlers.get(&fd).cloned()
                };
                let Some(handler) = handler else { continue };

                if fd == self.master_fd() {
                    if let Handler::Accept(acceptor) = &handler {
                        for stream in acceptor.handle_event(set) {
                            self.handle_new_connection(stream);
                        }
                    }
                } else if let Handler::Events(events_handler) = &handler {
                    let events_handler = events_handler.clone();
                    let _ = self
                        .pool
                        .enqueue_task(move || events_handler.handle_event(set));
                }

                self.handle_unexpected(fd, set);
            }
            self.run_pending();
        }
        info!("Dispatcher loop exited");
    }

    // Installs the channel + events handler for a freshly accepted stream,
    // on this dispatcher or on a slave picked round-robin.
    #[instrument(skip(self, stream))]
    fn handle_new_connection(&self, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        let target = self.select_target();
        let target_demux = match &target {
            Some(slave) => Arc::clone(&slave.demux),
            None => Arc::clone(&self.demux),
        };

        let channel = Arc::new(Channel::new(stream, target_demux, Arc::clone(&self.hooks)));
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .insert(fd, Arc::clone(&channel));

        let handler = Handler::Events(EventsHandler::new(channel));
        let registered = match &target {
            Some(slave) => slave.register_handler(fd, handler),
            None => self.register_handler(fd, handler),
        };
        if !registered {
            warn!(fd, "Failed to register accepted connection; dropping it");
            if let Some(channel) = self
                .channels
                .lock()
                .expect("channel registry poisoned")
                .remove(&fd)
            {
                channel.inactive();
            }
        }
    }

    fn select_target(&self) -> Option<Arc<Dispatcher>> {
        if !self.enable_slave.load(Ordering::SeqCst) {
            return None;
        }
        let slaves = self.slaves.lock().expect("slave list poisoned");
        if slaves.is_empty() {
            return None;
        }
        let idx = self.next_slave.fetch_add(1, Ordering::Relaxed) % slaves.len();
        Some(Arc::clone(&slaves[idx]))
    }

    // Tears the connection down on hangup or error: handler out, interest
    // out, channel out of the shared registry (or queued for removal if the
    // registry is currently extracted).
    #[instrument(skip(self))]
    fn handle_unexpected(&self, fd: RawFd, events: EventSet) {
        if !events.is_fatal() {
            return;
        }
        self.handlers
            .lock()
            .expect("handler map poisoned")
            .remove(&fd);
        let _ = self.demux.remove_fd(fd);

        let removed = self
            .channels
            .lock()
            .expect("channel registry poisoned")
            .remove(&fd);
        match removed {
            Some(channel) => {
                info!(fd, peer = ?channel.peer_addr(), "Closed connection");
                channel.inactive();
            }
            None => self
                .wait_to_remove
                .lock()
                .expect("removal list poisoned")
                .push(fd),
        }
    }

    fn run_pending(&self) {
        let pending: Vec<PendingFn> =
            std::mem::take(&mut *self.pending.lock().expect("pending queue poisoned"));
        for functor in pending {
            functor();
        }
    }
}

// ============================================================================
// Registration & Introspection
// ============================================================================

impl Dispatcher {
    /// Registers the listening descriptor and its accept handler, switching
    /// the descriptor to non-blocking for the edge-triggered accept loop.
    ///
    /// The descriptor stays owned by the caller (normally a
    /// [`TcpServer`](crate::TcpServer)) and must outlive this dispatcher.
    #[instrument(skip(self))]
    pub fn set_master_fd(&self, fd: RawFd) -> bool {
        if fd < 0 {
            return false;
        }
        if let Err(err) = crate::reactor::handler::set_nonblocking(fd) {
            error!(fd, ?err, "Failed to make listening descriptor non-blocking");
            return false;
        }
        self.master_fd.store(fd, Ordering::SeqCst);
        self.register_handler(fd, Handler::Accept(AcceptHandler::new(fd)))
    }

    /// The master listening descriptor, `0` when absent.
    pub fn master_fd(&self) -> RawFd {
        self.master_fd.load(Ordering::SeqCst)
    }

    /// Adds interest for `fd` and installs its handler. Returns false when
    /// stopped, on a negative descriptor, on a kernel refusal, or when a
    /// handler was already installed.
    #[instrument(skip(self, handler))]
    pub fn register_handler(&self, fd: RawFd, handler: Handler) -> bool {
        if self.stopped() || fd < 0 {
            return false;
        }
        if self.demux.register_fd(fd).is_err() {
            return false;
        }
        match self
            .handlers
            .lock()
            .expect("handler map poisoned")
            .entry(fd)
        {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Explicitly removes a connection: deactivates and unregisters its
    /// channel and drops the handler.
    #[instrument(skip(self))]
    pub fn remove_handler(&self, fd: RawFd) -> bool {
        if self.stopped() || fd < 0 {
            return false;
        }
        if let Some(channel) = self
            .channels
            .lock()
            .expect("channel registry poisoned")
            .remove(&fd)
        {
            channel.inactive();
        }
        let _ = self.demux.remove_fd(fd);
        self.handlers
            .lock()
            .expect("handler map poisoned")
            .remove(&fd)
            .is_some()
    }

    /// Switches slave mode on or off. Takes effect for subsequently
    /// accepted connections.
    pub fn enable_slave(&self, on: bool) {
        if !self.stopped() {
            self.enable_slave.store(on, Ordering::SeqCst);
        }
    }

    /// Spins up `n` slave dispatchers, each running its loop on a pool
    /// worker. No-op unless slave mode is enabled.
    #[instrument(skip(self))]
    pub fn add_slave_dispatchers(&self, n: usize) -> Result<(), Error> {
        if self.stopped() || !self.enable_slave.load(Ordering::SeqCst) {
            warn!("Slave dispatchers requested while disabled or stopped");
            return Ok(());
        }
        for _ in 0..n {
            let slave = Self::with_shared(
                Arc::clone(&self.pool),
                Arc::clone(&self.channels),
                Arc::clone(&self.hooks),
                self.event_capacity,
            )?;
            let runner = Arc::clone(&slave);
            let _ = self.pool.enqueue_task(move || runner.dispatch());
            self.slaves
                .lock()
                .expect("slave list poisoned")
                .push(slave);
        }
        info!(count = n, "Added slave dispatchers");
        Ok(())
    }

    /// Looks a channel up in the shared registry.
    pub fn get_channel(&self, fd: RawFd) -> Option<Arc<Channel>> {
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .get(&fd)
            .cloned()
    }

    /// Bulk-extracts the shared channel registry, leaving it empty.
    pub fn extract_channels(&self) -> HashMap<RawFd, Arc<Channel>> {
        std::mem::take(&mut *self.channels.lock().expect("channel registry poisoned"))
    }

    /// Restores a previously extracted registry, first dropping any
    /// descriptors that were torn down in the meantime.
    pub fn restore_channels(&self, mut map: HashMap<RawFd, Arc<Channel>>) {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        for fd in self
            .wait_to_remove
            .lock()
            .expect("removal list poisoned")
            .drain(..)
        {
            if let Some(channel) = map.remove(&fd) {
                channel.inactive();
            }
        }
        channels.extend(map);
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// The observer-hook table shared with every channel of this server.
    pub fn hooks(&self) -> &Arc<ChannelHooks> {
        &self.hooks
    }

    /// Posts a closure to run on a reactor thread at the end of its next
    /// loop iteration. In slave mode the closure is forwarded round-robin
    /// to a slave, mirroring where connection work runs.
    #[instrument(skip(self, functor))]
    pub fn add_pending_functor(&self, functor: impl FnOnce() + Send + 'static) {
        if let Some(slave) = self.select_target() {
            slave.add_pending_functor(functor);
            return;
        }
        self.pending
            .lock()
            .expect("pending queue poisoned")
            .push(Box::new(functor));
        self.demux.wake();
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Per-wait event batch size. Diagnostic.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }

    /// Handlers currently installed on this dispatcher. Diagnostic.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().expect("handler map poisoned").len()
    }

    /// Snapshot of the slave dispatchers. Diagnostic.
    pub fn slaves(&self) -> Vec<Arc<Dispatcher>> {
        self.slaves.lock().expect("slave list poisoned").clone()
    }
}

// ============================================================================
// Shutdown
// ============================================================================

impl Dispatcher {
    /// Stops the loop and tears everything down. Idempotent.
    ///
    /// Slaves go down first; the master (a dispatcher with a listening
    /// descriptor) then shuts the pool down and drains the shared channel
    /// registry. Call from outside the pool: joining the workers from one
    /// of their own tasks would deadlock.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Dispatcher shutting down");
        self.demux.wake();

        self.handlers
            .lock()
            .expect("handler map poisoned")
            .clear();

        let slaves: Vec<Arc<Dispatcher>> =
            std::mem::take(&mut *self.slaves.lock().expect("slave list poisoned"));
        for slave in slaves {
            slave.shutdown();
        }

        if self.master_fd() != 0 {
            self.pool.shutdown();
            let drained: Vec<Arc<Channel>> = self
                .channels
                .lock()
                .expect("channel registry poisoned")
                .drain()
                .map(|(_, channel)| channel)
                .collect();
            for channel in drained {
                channel.inactive();
            }
            debug!("Drained channel registry");
        }

        self.demux.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
