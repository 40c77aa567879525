//! The reactor core: readiness demultiplexing, per-connection channels,
//! event handlers, the dispatcher event loop, and the coalescing
//! notification center.
//!
//! Data flows kernel → [`Demultiplexer`](demux::Demultiplexer) →
//! [`Dispatcher`](dispatcher::Dispatcher) → handler → channel, and back out
//! through [`NotificationCenter`](notification::NotificationCenter) →
//! [`Channel`](channel::Channel) → kernel.

pub mod channel;
pub mod demux;
pub mod dispatcher;
pub mod handler;
pub mod notification;
