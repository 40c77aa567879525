use thiserror::Error;

/// The error type for reactor-net operations.
///
/// This covers everything that can fail when setting up or driving the
/// server core: socket and readiness-descriptor allocation, configuration
/// validation, and task completion.
///
/// Per-connection I/O failures never surface here. Peer closes and transient
/// `EAGAIN`-class errors are recovered inside the [`Channel`](crate::Channel)
/// drain loops, and permanent socket errors deactivate the channel and are
/// reported through the observer hooks instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    ///
    /// Returned when the kernel refuses a socket, bind, listen, or readiness
    /// descriptor allocation (resource exhaustion), or when waiting for
    /// events fails for a reason other than signal interruption.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided address could not be parsed as an IPv4 `ip:port` pair.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// Attempted to operate on a descriptor with no registered channel.
    #[error("No channel registered for fd {fd}")]
    ChannelNotFound {
        /// The descriptor that was not found.
        fd: i32,
    },

    /// Operation requires an initialized listening socket (`init` not yet
    /// called, or the server already shut down).
    #[error("Server socket not initialized")]
    NotInitialized,

    // ============================================================================
    // Task Completion Errors
    // ============================================================================

    /// A task submitted to the thread pool panicked.
    ///
    /// The panic is caught on the worker thread and preserved in the
    /// completion handle; the worker itself survives.
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// The task was dropped before producing a result.
    ///
    /// This happens when a task is enqueued on a pool that is shutting down,
    /// or when pending tasks are discarded by [`ThreadPool::shutdown`](crate::ThreadPool::shutdown).
    #[error("Task dropped before completion")]
    TaskDropped,

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Thread pool bounds are invalid.
    ///
    /// `min_core_thread` must be at least 1 and must not exceed `max_thread`.
    #[error("Invalid thread pool bounds: min_core_thread={min}, max_thread={max}")]
    InvalidPoolConfig { min: usize, max: usize },
}
