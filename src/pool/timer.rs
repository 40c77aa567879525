//! Periodic in-process ticker.
//!
//! Drives the thread pool's load monitor. The tick thread waits on a
//! condvar with a timeout rather than sleeping, so `stop` takes effect
//! within one wake-up instead of one full period.

use crate::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::trace;

struct TimerShared {
    stop: Mutex<bool>,
    cv: Condvar,
    shots: AtomicU64,
}

/// Calls a closure every `period` on a dedicated thread until stopped.
pub struct Timer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Spawns the tick thread. The first callback fires one full period
    /// after start.
    pub fn start<F>(period: Duration, name: &str, mut callback: F) -> Result<Self, Error>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            stop: Mutex::new(false),
            cv: Condvar::new(),
            shots: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let stop = thread_shared.stop.lock().expect("timer mutex poisoned");
                let (stop, _timed_out) = thread_shared
                    .cv
                    .wait_timeout(stop, period)
                    .expect("timer mutex poisoned");
                if *stop {
                    trace!("Timer stopped");
                    return;
                }
                drop(stop);
                callback();
                thread_shared.shots.fetch_add(1, Ordering::Relaxed);
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Number of completed ticks.
    pub fn shot_count(&self) -> u64 {
        self.shared.shots.load(Ordering::Relaxed)
    }

    /// Stops the tick thread and joins it. Idempotent.
    pub fn stop(&mut self) {
        *self.shared.stop.lock().expect("timer mutex poisoned") = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn ticks_periodically_until_stopped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let mut timer = Timer::start(Duration::from_millis(5), "test-timer", move || {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        })
        .expect("start timer");

        while timer.shot_count() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        timer.stop();
        let after_stop = hits.load(Ordering::Relaxed);
        assert!(after_stop >= 3);

        // No more ticks arrive once stopped.
        thread::sleep(Duration::from_millis(25));
        assert_eq!(hits.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let mut timer =
            Timer::start(Duration::from_secs(60), "test-slow-timer", || {}).expect("start timer");
        let begin = Instant::now();
        timer.stop();
        timer.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(timer.shot_count(), 0);
    }
}
