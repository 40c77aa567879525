//! The coalescing notification center.
//!
//! Sits between channel notifications and user code. Data-ready signals
//! are coalesced per descriptor into a three-valued state, so that for any
//! connection at most one user handler is in flight at a time while a
//! backlog that arrived during handling is still recorded and picked up by
//! the next [`handle_ready_data`](NotificationCenter::handle_ready_data)
//! call. This keeps stream replies in order without stalling the drain.

use crate::pool::{TaskHandle, ThreadPool};
use crate::reactor::dispatcher::Dispatcher;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Unprocessed-data state for one descriptor.
///
/// `One` means no unprocessed data; `More` means exactly one batch is
/// pending (or being handled); `MorePlus` means at least two batches
/// arrived and a further read-out is required after the current handler
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceState {
    One,
    More,
    MorePlus,
}

/// Coalesces data-ready signals and pumps handler replies back to
/// channels.
pub struct NotificationCenter {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<ThreadPool>,
    pending: Mutex<HashMap<RawFd, CoalesceState>>,
}

impl NotificationCenter {
    /// Builds the center and wires its notifications into the dispatcher's
    /// channel hooks.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let center = Arc::new(Self {
            pool: Arc::clone(dispatcher.thread_pool()),
            dispatcher: Arc::clone(&dispatcher),
            pending: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&center);
        dispatcher.hooks().set_data_ready_notify(move |fd| {
            if let Some(center) = weak.upgrade() {
                center.notify_data_ready(fd);
            }
        });
        let weak = Arc::downgrade(&center);
        dispatcher.hooks().set_closed_notify(move |fd| {
            if let Some(center) = weak.upgrade() {
                center.notify_close(fd);
            }
        });

        center
    }

    /// Records that fresh data arrived for `fd`.
    ///
    /// First arrival inserts the descriptor as `More` ("work pending");
    /// further arrivals escalate to `MorePlus` and saturate there.
    pub fn notify_data_ready(&self, fd: RawFd) {
        let mut pending = self.pending.lock().expect("coalescing map poisoned");
        let state = pending.entry(fd).or_insert(CoalesceState::One);
        *state = match *state {
            CoalesceState::One => CoalesceState::More,
            CoalesceState::More | CoalesceState::MorePlus => CoalesceState::MorePlus,
        };
        trace!(fd, state = ?*state, "Data ready");
    }

    /// Drops the coalescing entry for a closed descriptor.
    pub fn notify_close(&self, fd: RawFd) {
        self.pending
            .lock()
            .expect("coalescing map poisoned")
            .remove(&fd);
        trace!(fd, "Connection closed; coalescing entry dropped");
    }

    /// Queues reply bytes on the descriptor's channel.
    pub fn notify_response_ready(&self, fd: RawFd, data: &[u8]) {
        match self.dispatcher.get_channel(fd) {
            Some(channel) => channel.notify_write_event(data),
            None => debug!(fd, "No channel for response; dropping reply"),
        }
    }

    /// Dispatches the user handler for every descriptor with unprocessed
    /// data.
    ///
    /// Snapshots the coalescing map, and for each pending descriptor whose
    /// channel still exists, reads all buffered bytes out and submits
    /// `handler(fd, bytes)` to the pool, at most once per descriptor per
    /// call. After submission the state downgrades (`MorePlus` → `More`,
    /// `More` → `One`); yields the thread when nothing was submittable.
    /// Extra handler context travels by closure capture.
    ///
    /// Returns one completion handle per submitted handler. Completion
    /// order across descriptors is up to the pool.
    pub fn handle_ready_data<F, R>(&self, handler: F) -> Vec<TaskHandle<R>>
    where
        F: Fn(RawFd, Vec<u8>) -> R + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let snapshot: Vec<RawFd> = {
            let pending = self.pending.lock().expect("coalescing map poisoned");
            pending
                .iter()
                .filter(|(_, state)| **state != CoalesceState::One)
                .map(|(fd, _)| *fd)
                .collect()
        };

        let mut handles = Vec::with_capacity(snapshot.len());
        for fd in snapshot {
            let Some(channel) = self.dispatcher.get_channel(fd) else {
                continue;
            };
            let bytes = channel.get_received_data();
            let task = handler.clone();
            handles.push(self.pool.enqueue_task(move || task(fd, bytes)));

            let mut pending = self.pending.lock().expect("coalescing map poisoned");
            if let Some(state) = pending.get_mut(&fd) {
                *state = match *state {
                    CoalesceState::MorePlus => CoalesceState::More,
                    CoalesceState::More | CoalesceState::One => CoalesceState::One,
                };
            }
        }

        if handles.is_empty() {
            std::thread::yield_now();
        }
        handles
    }

    /// Current coalescing state for `fd`. Diagnostic.
    pub fn state_of(&self, fd: RawFd) -> Option<CoalesceState> {
        self.pending
            .lock()
            .expect("coalescing map poisoned")
            .get(&fd)
            .copied()
    }

    /// True when no descriptor has unprocessed data. Diagnostic.
    pub fn is_idle(&self) -> bool {
        self.pending
            .lock()
            .expect("coalescing map poisoned")
            .values()
            .all(|state| *state == CoalesceState::One)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPoolConfig;

    fn center() -> Arc<NotificationCenter> {
        let pool = ThreadPool::new(ThreadPoolConfig {
            min_core_thread: 1,
            max_thread: 2,
            start_monitor_timer: false,
            ..ThreadPoolConfig::default()
        })
        .expect("pool");
        let dispatcher = Dispatcher::new(pool).expect("dispatcher");
        NotificationCenter::new(dispatcher)
    }

    #[test]
    fn coalescing_transitions_follow_the_graph() {
        let center = center();
        assert_eq!(center.state_of(7), None);

        // absent -> More -> MorePlus, saturating.
        center.notify_data_ready(7);
        assert_eq!(center.state_of(7), Some(CoalesceState::More));
        center.notify_data_ready(7);
        assert_eq!(center.state_of(7), Some(CoalesceState::MorePlus));
        center.notify_data_ready(7);
        assert_eq!(center.state_of(7), Some(CoalesceState::MorePlus));
        assert!(!center.is_idle());

        center.notify_close(7);
        assert_eq!(center.state_of(7), None);
        assert!(center.is_idle());
        center.dispatcher.thread_pool().shutdown();
    }

    #[test]
    fn ready_data_without_channels_submits_nothing() {
        let center = center();
        center.notify_data_ready(9);

        // No channel exists for fd 9, so nothing is submitted and the
        // entry is left for the close notification to reap.
        let handles = center.handle_ready_data(|_fd, bytes: Vec<u8>| bytes.len());
        assert!(handles.is_empty());
        assert_eq!(center.state_of(9), Some(CoalesceState::More));
        center.dispatcher.thread_pool().shutdown();
    }

    #[test]
    fn response_for_unknown_fd_is_dropped() {
        let center = center();
        center.notify_response_ready(11, b"nobody home");
        center.dispatcher.thread_pool().shutdown();
    }
}
