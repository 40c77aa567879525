//! A single-node, event-driven TCP server framework built on
//! [mio](https://docs.rs/mio) with a master/slave reactor, an adaptive
//! thread pool, and a coalescing notification center.
//!
//! - **Reactor core:** an edge-triggered [`Demultiplexer`] plus a
//!   [`Dispatcher`] that owns the listening descriptor and routes readiness
//!   events to per-connection handlers, optionally migrating connections to
//!   slave dispatchers round-robin
//! - **Connection channels:** per-connection [`Channel`]s own the partial
//!   receive/send buffers and the drain-until-blocked read/write state
//!   machine
//! - **Adaptive thread pool:** a [`ThreadPool`] executes handler work and
//!   grows or shrinks with measured CPU load and queue backlog
//! - **Notification center:** a [`NotificationCenter`] coalesces data-ready
//!   signals so at most one user handler per connection is in flight, while
//!   still recording data that arrived during handling
//!
//! The framework is payload-agnostic: the application registers a
//! per-message handler `fn(fd, bytes) -> R` and replies with raw bytes.
//!
//! # Quick Start
//!
//! ```no_run
//! use reactor_net::prelude::*;
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> Result<(), reactor_net::Error> {
//! // Listening socket: init -> reuse -> bind -> listen.
//! let mut server = TcpServer::new();
//! server.init()?;
//! server.reuse_address(true)?;
//! server.bind(&Address::new("127.0.0.1", 9090))?;
//! server.listen(DEFAULT_BACKLOG)?;
//!
//! // Reactor: the dispatcher takes over the listening descriptor.
//! let dispatcher = Dispatcher::new(ThreadPool::global())?;
//! dispatcher.set_master_fd(server.fd());
//! let center = NotificationCenter::new(Arc::clone(&dispatcher));
//!
//! let reactor = Arc::clone(&dispatcher);
//! thread::spawn(move || reactor.dispatch());
//!
//! // Application loop: handle complete batches, push replies back.
//! while !dispatcher.stopped() {
//!     for handle in center.handle_ready_data(|fd, bytes| (fd, bytes.len())) {
//!         let (fd, len) = handle.wait()?;
//!         center.notify_response_ready(fd, format!("got {len} bytes").as_bytes());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! Pool sizing, the per-wait event batch, and the listen backlog all read
//! through the [`config`](https://docs.rs/config) crate, optionally
//! namespaced per instance:
//!
//! ```toml
//! min_core_thread = 2
//! max_thread = 8
//! start_monitor_timer = true
//! monitor_period_us = 30000
//! verify_count = 3
//! event_capacity = 512
//! listen_backlog = 512
//! ```
//!
//! ```no_run
//! # fn main() -> Result<(), reactor_net::Error> {
//! let config = config::Config::builder()
//!     .add_source(config::File::with_name("server.toml"))
//!     .build()?;
//! let pool = reactor_net::ThreadPool::new(
//!     reactor_net::ThreadPoolConfig::from_config(&config, "pool"),
//! )?;
//! let dispatcher = reactor_net::Dispatcher::new_named(pool, &config, "")?;
//! let server_config = reactor_net::ServerConfig::from_config(&config, "");
//! # let _ = (dispatcher, server_config.listen_backlog);
//! # Ok(())
//! # }
//! ```

pub(crate) mod config;

pub mod address;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod tcp_server;

pub use address::Address;
pub use error::Error;
pub use pool::{TaskHandle, ThreadPool, ThreadPoolConfig, Timer};
pub use reactor::channel::{Channel, ChannelHooks};
pub use reactor::demux::{Demultiplexer, EventSet, DEFAULT_EVENT_CAPACITY};
pub use reactor::dispatcher::Dispatcher;
pub use reactor::handler::{AcceptHandler, EventsHandler, Handler};
pub use reactor::notification::{CoalesceState, NotificationCenter};
pub use tcp_server::{ServerConfig, TcpServer, DEFAULT_BACKLOG};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::error::Error;
    pub use crate::pool::{TaskHandle, ThreadPool, ThreadPoolConfig};
    pub use crate::reactor::channel::{Channel, ChannelHooks};
    pub use crate::reactor::dispatcher::Dispatcher;
    pub use crate::reactor::notification::{CoalesceState, NotificationCenter};
    pub use crate::tcp_server::{ServerConfig, TcpServer, DEFAULT_BACKLOG};
}
