//! Listening-socket lifecycle helper.
//!
//! Wraps the explicit socket / setsockopt / bind / listen sequence the
//! [`Dispatcher`](crate::Dispatcher) expects:
//!
//! ```text
//! init -> reuse_address -> bind -> listen -> dispatcher.set_master_fd(server.fd())
//! ```
//!
//! The server owns the listening descriptor for its whole lifetime; the
//! dispatcher only borrows it as a raw fd.

use crate::address::Address;
use crate::config::get_namespaced_usize;
use crate::error::Error;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use tracing::{info, instrument, warn};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 512;

/// Listener knobs read through the `config` crate.
///
/// Keys: `listen_backlog`, optionally namespaced under an instance name
/// like the pool keys.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Backlog handed to the kernel on listen.
    pub listen_backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServerConfig {
    /// Builds a config from the `config` crate, falling back to the
    /// default backlog.
    pub fn from_config(config: &::config::Config, name: &str) -> Self {
        Self {
            listen_backlog: get_namespaced_usize(config, name, "listen_backlog")
                .map(|n| n as i32)
                .unwrap_or(DEFAULT_BACKLOG),
        }
    }
}

/// A thin helper over the standard TCP socket lifecycle.
///
/// Each step maps to one kernel call, so socket options can be applied
/// between socket creation and bind, which the combined
/// `std::net::TcpListener::bind` cannot express.
#[derive(Debug, Default)]
pub struct TcpServer {
    socket: Option<Socket>,
    addr: Option<Address>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the listening socket.
    ///
    /// Fails with [`Error::Io`] when the kernel refuses the allocation.
    /// Calling `init` on an already-initialized server is a no-op.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), Error> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        info!(fd = socket.as_raw_fd(), "Created listening socket");
        self.socket = Some(socket);
        Ok(())
    }

    /// Enables or disables `SO_REUSEADDR` and `SO_REUSEPORT`.
    #[instrument(skip(self))]
    pub fn reuse_address(&self, on: bool) -> Result<(), Error> {
        let socket = self.socket()?;
        socket.set_reuse_address(on)?;
        socket.set_reuse_port(on)?;
        Ok(())
    }

    /// Enables or disables `TCP_NODELAY`; accepted connections inherit it.
    #[instrument(skip(self))]
    pub fn disable_nagle(&self, on: bool) -> Result<(), Error> {
        self.socket()?.set_nodelay(on)?;
        Ok(())
    }

    /// Binds the socket to `addr`.
    #[instrument(skip(self, addr))]
    pub fn bind(&mut self, addr: &Address) -> Result<(), Error> {
        let sa = addr.to_socket_addr()?;
        self.socket()?.bind(&sa.into())?;
        info!(%addr, "Bound listening socket");
        self.addr = Some(addr.clone());
        Ok(())
    }

    /// Starts listening with the given backlog (see [`DEFAULT_BACKLOG`]
    /// and [`ServerConfig::listen_backlog`]).
    #[instrument(skip(self))]
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        self.socket()?.listen(backlog)?;
        let addr = self.addr.as_ref();
        info!(addr = ?addr, backlog, "Listening for connections");
        Ok(())
    }

    /// Accepts one connection, blocking until a peer arrives.
    ///
    /// This is the standalone mode of operating the server, without a
    /// dispatcher; the accepted stream is handed to the caller, which owns
    /// it from here on.
    #[instrument(skip(self))]
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        let (socket, sock_addr) = self.socket()?.accept()?;
        let peer_addr = sock_addr.as_socket().ok_or_else(|| {
            Error::InvalidAddress("accepted peer has no inet address".to_string())
        })?;
        info!(fd = socket.as_raw_fd(), %peer_addr, "Accepted connection");
        Ok((socket.into(), peer_addr))
    }

    /// The kernel-reported local address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let sock_addr = self.socket()?.local_addr()?;
        sock_addr
            .as_socket()
            .ok_or_else(|| Error::InvalidAddress("listener has no inet address".to_string()))
    }

    /// The raw listening descriptor, or `-1` before `init` / after
    /// `shutdown`.
    pub fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    /// The bound address, when `bind` has run.
    pub fn address(&self) -> Option<&Address> {
        self.addr.as_ref()
    }

    /// Closes the listening descriptor. Idempotent.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) {
        if let Some(socket) = self.socket.take() {
            info!(fd = socket.as_raw_fd(), "Closing listening socket");
            drop(socket);
        }
    }

    fn socket(&self) -> Result<&Socket, Error> {
        self.socket.as_ref().ok_or(Error::NotInitialized)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.socket.is_some() {
            warn!("TcpServer dropped without explicit shutdown");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn lifecycle_and_idempotent_shutdown() {
        let mut server = TcpServer::new();
        server.init().expect("init");
        server.init().expect("second init is a no-op");
        server.reuse_address(true).expect("reuse");
        server.bind(&Address::new("127.0.0.1", 0)).expect("bind");
        server.listen(DEFAULT_BACKLOG).expect("listen");
        assert!(server.fd() >= 0);

        server.shutdown();
        assert_eq!(server.fd(), -1);
        server.shutdown(); // second shutdown must be a no-op
        assert!(matches!(server.listen(1), Err(Error::NotInitialized)));
    }

    #[test]
    fn server_config_reads_namespaced_backlog() {
        let config = ::config::Config::builder()
            .set_default("server.listen_backlog", 128)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(ServerConfig::from_config(&config, "server").listen_backlog, 128);
        // Missing key falls back to the default.
        assert_eq!(
            ServerConfig::from_config(&config, "other").listen_backlog,
            DEFAULT_BACKLOG
        );
    }

    #[test]
    fn blocking_accept_round_trip() {
        let mut server = TcpServer::new();
        server.init().expect("init");
        server.reuse_address(true).expect("reuse");
        server.bind(&Address::new("127.0.0.1", 0)).expect("bind");
        server.listen(DEFAULT_BACKLOG).expect("listen");

        // Recover the ephemeral port from the kernel.
        let local = server.local_addr().expect("local addr");

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(local).expect("connect");
            stream.write_all(b"ping").expect("write");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).expect("read");
            buf
        });

        let (mut accepted, peer) = server.accept().expect("accept");
        assert!(peer.ip().is_loopback());
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ping");
        accepted.write_all(b"pong").expect("write");

        assert_eq!(&client.join().unwrap(), b"pong");
        server.shutdown();
    }
}
