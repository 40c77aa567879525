//! Per-connection byte channel.
//!
//! A [`Channel`] owns an accepted non-blocking socket plus its receive and
//! send buffers, and drives the readiness-triggered read/write state
//! machine. Under edge-triggered readiness the channel, not the
//! dispatcher, owns the "drain until `WouldBlock`" contract, and it
//! toggles its own write interest so an empty send buffer never busy-loops
//! on writable readiness.
//!
//! Reads and writes may run concurrently on different pool workers; the
//! receive and send sides are serialized by their own mutexes.

use crate::reactor::demux::Demultiplexer;
use mio::Interest;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

/// Initial receive-buffer capacity; grows by 1.5x when the tail meets it.
const INITIAL_BUF_SIZE: usize = 128;

type NotifyFn = dyn Fn(RawFd) + Send + Sync;
type TrafficFn = dyn Fn(usize, Option<&io::Error>, &[u8]) + Send + Sync;

// ============================================================================
// Observer Hooks
// ============================================================================

/// Observer hooks shared by every channel of one server context.
///
/// The data-ready and closed notifications are wired internally by the
/// [`NotificationCenter`](crate::NotificationCenter); the receive, send,
/// and closed observers are application-facing tracing hooks. All slots
/// may be set at any time and apply to subsequent events.
#[derive(Default)]
pub struct ChannelHooks {
    data_ready: RwLock<Option<Arc<NotifyFn>>>,
    closed: RwLock<Option<Arc<NotifyFn>>>,
    received: RwLock<Option<Arc<TrafficFn>>>,
    sent: RwLock<Option<Arc<TrafficFn>>>,
    closed_observer: RwLock<Option<Arc<NotifyFn>>>,
}

impl ChannelHooks {
    pub(crate) fn set_data_ready_notify(&self, notify: impl Fn(RawFd) + Send + Sync + 'static) {
        *self.data_ready.write().expect("hooks lock poisoned") = Some(Arc::new(notify));
    }

    pub(crate) fn set_closed_notify(&self, notify: impl Fn(RawFd) + Send + Sync + 'static) {
        *self.closed.write().expect("hooks lock poisoned") = Some(Arc::new(notify));
    }

    /// Observes every receive drain: (accumulated bytes, terminating error,
    /// buffered data).
    pub fn set_receive_observer(
        &self,
        observer: impl Fn(usize, Option<&io::Error>, &[u8]) + Send + Sync + 'static,
    ) {
        *self.received.write().expect("hooks lock poisoned") = Some(Arc::new(observer));
    }

    /// Observes every successful or failed write: (bytes sent, error, sent
    /// data).
    pub fn set_send_observer(
        &self,
        observer: impl Fn(usize, Option<&io::Error>, &[u8]) + Send + Sync + 'static,
    ) {
        *self.sent.write().expect("hooks lock poisoned") = Some(Arc::new(observer));
    }

    /// Observes connection teardown, once per closed channel.
    pub fn set_closed_observer(&self, observer: impl Fn(RawFd) + Send + Sync + 'static) {
        *self.closed_observer.write().expect("hooks lock poisoned") = Some(Arc::new(observer));
    }

    fn data_ready(&self) -> Option<Arc<NotifyFn>> {
        self.data_ready.read().expect("hooks lock poisoned").clone()
    }

    fn closed(&self) -> Option<Arc<NotifyFn>> {
        self.closed.read().expect("hooks lock poisoned").clone()
    }

    fn received(&self) -> Option<Arc<TrafficFn>> {
        self.received.read().expect("hooks lock poisoned").clone()
    }

    fn sent(&self) -> Option<Arc<TrafficFn>> {
        self.sent.read().expect("hooks lock poisoned").clone()
    }

    fn closed_observer(&self) -> Option<Arc<NotifyFn>> {
        self.closed_observer
            .read()
            .expect("hooks lock poisoned")
            .clone()
    }
}

// ============================================================================
// Buffers
// ============================================================================

// Receive accumulator: a zero-filled backing store with a fill watermark,
// grown 1.5x whenever the watermark reaches the end.
struct RecvBuf {
    data: Vec<u8>,
    len: usize,
}

impl RecvBuf {
    fn new() -> Self {
        Self {
            data: vec![0; INITIAL_BUF_SIZE],
            len: 0,
        }
    }

    fn ensure_spare(&mut self) {
        if self.len == self.data.len() {
            let grown = if self.data.is_empty() {
                INITIAL_BUF_SIZE
            } else {
                self.data.len() + self.data.len() / 2
            };
            self.data.resize(grown, 0);
        }
    }

    fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    fn commit(&mut self, n: usize) {
        self.len += n;
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn take(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.data);
        out.truncate(self.len);
        self.len = 0;
        out
    }
}

struct SendState {
    buf: Vec<u8>,
    want_write: bool,
}

// ============================================================================
// Channel
// ============================================================================

/// Per-connection byte-oriented state: buffers plus the readiness-driven
/// read/write state machine.
///
/// Once `active` drops to false it never comes back; every read, write, and
/// shutdown call on an inactive channel is a no-op. The underlying
/// descriptor closes when the last `Arc<Channel>` drops, which happens
/// strictly after the channel leaves the dispatcher's registry.
pub struct Channel {
    fd: RawFd,
    stream: TcpStream,
    active: AtomicBool,
    recv: Mutex<RecvBuf>,
    send: Mutex<SendState>,
    demux: Arc<Demultiplexer>,
    hooks: Arc<ChannelHooks>,
    peer_addr: Option<SocketAddr>,
}

impl Channel {
    /// Wraps an accepted non-blocking stream, bound to the demultiplexer it
    /// was (or will be) registered on.
    pub fn new(stream: TcpStream, demux: Arc<Demultiplexer>, hooks: Arc<ChannelHooks>) -> Self {
        let fd = stream.as_raw_fd();
        let peer_addr = stream.peer_addr().ok();
        Self {
            fd,
            stream,
            active: AtomicBool::new(fd >= 0),
            recv: Mutex::new(RecvBuf::new()),
            send: Mutex::new(SendState {
                buf: Vec::new(),
                want_write: false,
            }),
            demux,
            hooks,
            peer_addr,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Marks the channel unusable without firing notifications. Used by the
    /// dispatcher when it garbage-collects the connection.
    pub(crate) fn inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    /// Drains the socket into the receive buffer until it would block.
    ///
    /// Invoked on read readiness from a pool worker; concurrent invocations
    /// for the same channel serialize on the receive mutex. A zero-length
    /// read means the peer closed: both halves are shut down, the channel
    /// deactivates, and the closed notifications fire exactly once. Any
    /// other error is treated the same way.
    #[instrument(skip(self), fields(fd = self.fd))]
    pub fn read(&self) {
        if !self.is_active() {
            return;
        }

        let mut got_any = 0usize;
        let mut peer_closed = false;
        let mut fatal = false;
        let mut terminal: Option<io::Error> = None;
        {
            let mut recv = self.recv.lock().expect("receive mutex poisoned");
            loop {
                recv.ensure_spare();
                match (&self.stream).read(recv.spare()) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(n) => {
                        trace!(fd = self.fd, len = n, "Read data from socket");
                        recv.commit(n);
                        got_any += n;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        terminal = Some(err);
                        break;
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(fd = self.fd, peer = ?self.peer_addr, ?err, "Error reading from socket");
                        fatal = true;
                        terminal = Some(err);
                        break;
                    }
                }
            }
            if let Some(observer) = self.hooks.received() {
                observer(recv.len, terminal.as_ref(), recv.bytes());
            }
            if got_any > 0 {
                debug!(fd = self.fd, len = got_any, peer = ?self.peer_addr, "Received data");
            }
        }

        if peer_closed || fatal {
            self.close();
            return;
        }
        if got_any > 0 {
            if let Some(notify) = self.hooks.data_ready() {
                notify(self.fd);
            }
        }
    }

    /// Shuts both halves down, deactivates, and fires the closed
    /// notifications. Runs the notification side at most once, no matter
    /// how many paths race into it (end-of-stream read, read error, or an
    /// error/hangup readiness event).
    #[instrument(skip(self), fields(fd = self.fd))]
    pub(crate) fn close(&self) {
        self.disable_receive();
        self.disable_send();
        if self.active.swap(false, Ordering::SeqCst) {
            info!(fd = self.fd, peer = ?self.peer_addr, "Connection closed");
            if let Some(notify) = self.hooks.closed() {
                notify(self.fd);
            }
            if let Some(observer) = self.hooks.closed_observer() {
                observer(self.fd);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// Flushes the send buffer on write readiness.
    ///
    /// Writes until the buffer drains or the socket would block, erasing
    /// the sent prefix as it goes. When the buffer empties, write interest
    /// is cleared so an idle connection stops reporting writable. On
    /// `WouldBlock` the interest stays armed and the next writability edge
    /// resumes the flush.
    #[instrument(skip(self), fields(fd = self.fd))]
    pub fn write(&self) {
        if !self.is_active() {
            return;
        }

        let mut send = self.send.lock().expect("send mutex poisoned");
        if send.buf.is_empty() {
            if send.want_write {
                send.want_write = false;
                let _ = self.demux.modify_interest(self.fd, Interest::READABLE);
            }
            return;
        }

        loop {
            match (&self.stream).write(&send.buf) {
                // Kernel took nothing; leave the interest armed and retry
                // on the next edge.
                Ok(0) => break,
                Ok(n) => {
                    trace!(fd = self.fd, len = n, "Wrote to socket");
                    if let Some(observer) = self.hooks.sent() {
                        observer(n, None, &send.buf[..n]);
                    }
                    send.buf.drain(..n);
                    if send.buf.is_empty() {
                        send.want_write = false;
                        let _ = self.demux.modify_interest(self.fd, Interest::READABLE);
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(fd = self.fd, peer = ?self.peer_addr, ?err, "Error writing to socket");
                    if let Some(observer) = self.hooks.sent() {
                        observer(0, Some(&err), &[]);
                    }
                    drop(send);
                    self.disable_send();
                    return;
                }
            }
        }
    }

    /// Appends reply bytes to the send buffer and arms write interest.
    ///
    /// Called from the notification center or directly by the application,
    /// from any thread. Re-arming is unconditional so a writability edge
    /// consumed while the buffer was empty cannot strand the new data.
    #[instrument(skip(self, data), fields(fd = self.fd))]
    pub fn notify_write_event(&self, data: &[u8]) {
        if !self.is_active() {
            return;
        }
        {
            let mut send = self.send.lock().expect("send mutex poisoned");
            send.buf.extend_from_slice(data);
            send.want_write = true;
        }
        trace!(fd = self.fd, len = data.len(), "Queued data for send");
        let _ = self
            .demux
            .modify_interest(self.fd, Interest::READABLE | Interest::WRITABLE);
    }

    /// Bytes currently queued for send. Diagnostic.
    pub fn send_backlog(&self) -> usize {
        self.send.lock().expect("send mutex poisoned").buf.len()
    }

    // ------------------------------------------------------------------------
    // Receive hand-off
    // ------------------------------------------------------------------------

    /// Swaps out everything accumulated so far and resets the receive
    /// count. Returns an empty buffer when nothing arrived.
    #[instrument(skip(self), fields(fd = self.fd))]
    pub fn get_received_data(&self) -> Vec<u8> {
        if !self.is_active() {
            return Vec::new();
        }
        let mut recv = self.recv.lock().expect("receive mutex poisoned");
        if recv.len == 0 {
            return Vec::new();
        }
        recv.take()
    }

    // ------------------------------------------------------------------------
    // Half-shutdowns
    // ------------------------------------------------------------------------

    /// Shuts down the read half. Idempotent; no-op once inactive.
    #[instrument(skip(self), fields(fd = self.fd))]
    pub fn disable_receive(&self) {
        if self.is_active() {
            let _ = self.stream.shutdown(Shutdown::Read);
        }
    }

    /// Shuts down the write half. Idempotent; no-op once inactive.
    #[instrument(skip(self), fields(fd = self.fd))]
    pub fn disable_send(&self) {
        if self.is_active() {
            let _ = self.stream.shutdown(Shutdown::Write);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // Builds a connected (channel, client) pair over loopback. The server
    // side is non-blocking and registered with the demultiplexer so
    // interest toggling has a target.
    fn connected_pair(hooks: Arc<ChannelHooks>) -> (Channel, TcpStream, Arc<Demultiplexer>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");

        let demux = Arc::new(Demultiplexer::new().expect("demux"));
        demux.register_fd(server.as_raw_fd()).expect("register");
        let channel = Channel::new(server, Arc::clone(&demux), hooks);
        (channel, client, demux)
    }

    #[test]
    fn drains_socket_and_hands_data_over() {
        let hooks = Arc::new(ChannelHooks::default());
        let ready = Arc::new(AtomicUsize::new(0));
        let ready_clone = Arc::clone(&ready);
        hooks.set_data_ready_notify(move |_| {
            ready_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (channel, mut client, _demux) = connected_pair(hooks);

        // Well past the initial capacity, forcing repeated 1.5x growth.
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).expect("client write");
        std::thread::sleep(Duration::from_millis(50));

        channel.read();
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(channel.get_received_data(), payload);
        // A second swap finds nothing.
        assert!(channel.get_received_data().is_empty());
    }

    #[test]
    fn peer_close_fires_closed_exactly_once() {
        let hooks = Arc::new(ChannelHooks::default());
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = Arc::clone(&closed);
        hooks.set_closed_notify(move |_| {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let observer_hits = Arc::new(AtomicUsize::new(0));
        let observer_clone = Arc::clone(&observer_hits);
        hooks.set_closed_observer(move |_| {
            observer_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (channel, client, _demux) = connected_pair(hooks);
        drop(client);
        std::thread::sleep(Duration::from_millis(50));

        channel.read();
        channel.read(); // inactive: must be a no-op
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(observer_hits.load(Ordering::SeqCst), 1);
        assert!(!channel.is_active());
        assert!(channel.get_received_data().is_empty());
    }

    #[test]
    fn queued_data_reaches_the_peer() {
        let hooks = Arc::new(ChannelHooks::default());
        let sent_total = Arc::new(AtomicUsize::new(0));
        let sent_clone = Arc::clone(&sent_total);
        hooks.set_send_observer(move |n, _err, _data| {
            sent_clone.fetch_add(n, Ordering::SeqCst);
        });

        let (channel, mut client, _demux) = connected_pair(hooks);
        channel.notify_write_event(b"hello, client");
        assert_eq!(channel.send_backlog(), 13);

        channel.write();
        assert_eq!(channel.send_backlog(), 0);
        assert_eq!(sent_total.load(Ordering::SeqCst), 13);

        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).expect("client read");
        assert_eq!(&buf, b"hello, client");
    }

    #[test]
    fn inactive_channel_ignores_all_operations() {
        let hooks = Arc::new(ChannelHooks::default());
        let (channel, mut client, _demux) = connected_pair(hooks);

        channel.inactive();
        channel.notify_write_event(b"ignored");
        channel.write();
        channel.read();
        assert_eq!(channel.send_backlog(), 0);

        // Nothing was written to the peer.
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout");
        let mut buf = [0u8; 8];
        assert!(client.read(&mut buf).is_err());
    }

    #[test]
    fn receive_observer_sees_count_and_bytes() {
        let hooks = Arc::new(ChannelHooks::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        hooks.set_receive_observer(move |count, err, bytes| {
            assert!(err.is_some_and(|e| e.kind() == ErrorKind::WouldBlock));
            seen_clone
                .lock()
                .unwrap()
                .push((count, bytes.to_vec()));
        });

        let (channel, mut client, _demux) = connected_pair(hooks);
        client.write_all(b"abc").expect("client write");
        std::thread::sleep(Duration::from_millis(50));
        channel.read();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(3, b"abc".to_vec())]);
    }
}
