//! Adaptive worker-pool executor.
//!
//! A fixed FIFO queue of opaque closures served by a dynamically sized set
//! of worker threads. When the monitor timer is enabled the pool grows
//! toward `max_thread` under sustained load with a backlog and shrinks back
//! toward `min_core_thread` once the queue drains, with `verify_count`
//! ticks of hysteresis in both directions.
//!
//! Every submission returns a [`TaskHandle`] that resolves to the task's
//! value, or to the captured panic if the task blew up on the worker.
//!
//! The pool does not tear itself down on drop: call
//! [`ThreadPool::shutdown`], directly or through
//! [`Dispatcher::shutdown`](crate::Dispatcher::shutdown).

mod monitor;
mod timer;

pub use self::timer::Timer;

use self::monitor::{read_cpu_times, SizeController, SizingAction};
use crate::config::{get_namespaced_bool, get_namespaced_usize};
use crate::error::Error;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Sizing and monitoring knobs for [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Workers kept alive at all times. Must be at least 1.
    pub min_core_thread: usize,
    /// Upper bound on live workers.
    pub max_thread: usize,
    /// Whether to run the CPU-load monitor. Only effective when
    /// `min_core_thread < max_thread`.
    pub start_monitor_timer: bool,
    /// Interval between monitor ticks.
    pub monitor_period: Duration,
    /// Consecutive agreeing ticks required before the pool resizes.
    pub verify_count: u8,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            min_core_thread: 1,
            max_thread: num_cpus::get(),
            start_monitor_timer: false,
            monitor_period: Duration::from_micros(30_000),
            verify_count: 3,
        }
    }
}

impl ThreadPoolConfig {
    /// Builds a config from the `config` crate, falling back to defaults
    /// per key. Keys: `min_core_thread`, `max_thread`,
    /// `start_monitor_timer`, `monitor_period_us`, `verify_count`,
    /// optionally namespaced under `name`.
    pub fn from_config(config: &::config::Config, name: &str) -> Self {
        let defaults = Self::default();
        Self {
            min_core_thread: get_namespaced_usize(config, name, "min_core_thread")
                .unwrap_or(defaults.min_core_thread),
            max_thread: get_namespaced_usize(config, name, "max_thread")
                .unwrap_or(defaults.max_thread),
            start_monitor_timer: get_namespaced_bool(config, name, "start_monitor_timer")
                .unwrap_or(defaults.start_monitor_timer),
            monitor_period: get_namespaced_usize(config, name, "monitor_period_us")
                .map(|us| Duration::from_micros(us as u64))
                .unwrap_or(defaults.monitor_period),
            verify_count: get_namespaced_usize(config, name, "verify_count")
                .map(|n| n as u8)
                .unwrap_or(defaults.verify_count),
        }
    }

    /// Validates the thread bounds; surfaced as a startup failure.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_core_thread == 0 || self.min_core_thread > self.max_thread {
            return Err(Error::InvalidPoolConfig {
                min: self.min_core_thread,
                max: self.max_thread,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Task Handle
// ============================================================================

type CaughtResult<R> = Result<R, Box<dyn Any + Send + 'static>>;

/// Completion handle for a submitted task.
///
/// Awaiting the handle yields the task's return value. A panicking task is
/// caught on the worker and surfaces here as [`Error::TaskPanicked`]; a
/// task discarded by shutdown surfaces as [`Error::TaskDropped`].
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: Receiver<CaughtResult<R>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes.
    pub fn wait(self) -> Result<R, Error> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(Error::TaskPanicked(panic_message(payload.as_ref()))),
            Err(_) => Err(Error::TaskDropped),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ============================================================================
// Pool State
// ============================================================================

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStat {
    /// Parked or between tasks.
    Empty,
    /// Running a task.
    Active,
    /// Terminates at its next wake-up.
    Dead,
}

struct PoolState {
    tasks: VecDeque<Task>,
    worker_stat: HashMap<u64, WorkerStat>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
}

/// Dynamically sized worker pool executing opaque closures.
///
/// Tasks are dequeued in submission order; each worker runs one task at a
/// time outside the queue lock. Lock order is queue state before the
/// worker-handle table, everywhere.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_worker_id: AtomicU64,
    config: ThreadPoolConfig,
    monitor: Mutex<Option<Timer>>,
}

static GLOBAL_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

// ============================================================================
// Construction
// ============================================================================

impl ThreadPool {
    /// Builds a pool and spawns the `min_core_thread` core workers.
    pub fn new(config: ThreadPoolConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let pool = Arc::new(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    worker_stat: HashMap::new(),
                    stop: false,
                }),
                cv: Condvar::new(),
            }),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicU64::new(0),
            config,
            monitor: Mutex::new(None),
        });

        {
            let mut state = pool.shared.state.lock().expect("pool mutex poisoned");
            for _ in 0..pool.config.min_core_thread {
                pool.spawn_worker(&mut state)?;
            }
        }

        if pool.config.start_monitor_timer && pool.config.min_core_thread < pool.config.max_thread
        {
            pool.start_monitor()?;
        }

        info!(
            min = pool.config.min_core_thread,
            max = pool.config.max_thread,
            monitor = pool.config.start_monitor_timer,
            "Thread pool started"
        );
        Ok(pool)
    }

    /// The process-wide pool, built on first use with default config.
    ///
    /// Convenience factory; components take an explicit `Arc<ThreadPool>`
    /// and work the same with a locally constructed pool.
    pub fn global() -> Arc<Self> {
        GLOBAL_POOL
            .get_or_init(|| {
                Self::new(ThreadPoolConfig::default())
                    .expect("failed to initialize global thread pool")
            })
            .clone()
    }

    // Spawns one worker; the status entry is inserted under the state lock
    // before the thread starts, so the worker always finds itself in the
    // table.
    fn spawn_worker(&self, state: &mut PoolState) -> Result<(), Error> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        state.worker_stat.insert(id, WorkerStat::Empty);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("reactor-net-worker-{id}"))
            .spawn(move || worker_loop(shared, id));
        match spawned {
            Ok(handle) => {
                self.workers
                    .lock()
                    .expect("worker table poisoned")
                    .insert(id, handle);
                Ok(())
            }
            Err(err) => {
                state.worker_stat.remove(&id);
                Err(err.into())
            }
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

impl ThreadPool {
    /// Enqueues a closure and returns its completion handle.
    ///
    /// Additional arguments are captured by the closure. On a pool that is
    /// already stopping the task is dropped and the handle resolves to
    /// [`Error::TaskDropped`].
    #[instrument(skip(self, task))]
    pub fn enqueue_task<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = channel();
        let boxed: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            // The submitter may have discarded the handle.
            let _ = tx.send(result);
        });

        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if state.stop {
                warn!("Task enqueued on a stopped pool; dropping");
                return TaskHandle { rx };
            }
            state.tasks.push_back(boxed);
        }
        self.shared.cv.notify_one();
        TaskHandle { rx }
    }

    /// Live workers, including any currently running a task.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker table poisoned").len()
    }

    /// Tasks waiting to be picked up.
    pub fn queue_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool mutex poisoned")
            .tasks
            .len()
    }
}

fn worker_loop(shared: Arc<PoolShared>, id: u64) {
    trace!(worker = id, "Worker started");
    loop {
        let task = {
            let mut state = shared.state.lock().expect("pool mutex poisoned");
            loop {
                if state.stop {
                    trace!(worker = id, "Worker exiting: pool stopped");
                    return;
                }
                match state.worker_stat.get(&id) {
                    Some(WorkerStat::Dead) | None => {
                        trace!(worker = id, "Worker exiting: marked dead");
                        // A pending task's notify_one may have landed on
                        // this dying worker; pass the wake along.
                        if !state.tasks.is_empty() {
                            shared.cv.notify_one();
                        }
                        return;
                    }
                    _ => {}
                }
                if let Some(task) = state.tasks.pop_front() {
                    state.worker_stat.insert(id, WorkerStat::Active);
                    break task;
                }
                state = shared.cv.wait(state).expect("pool mutex poisoned");
            }
        };

        task();

        let mut state = shared.state.lock().expect("pool mutex poisoned");
        if let Some(stat) = state.worker_stat.get_mut(&id) {
            // A Dead mark set while the task ran stays sticky.
            if *stat == WorkerStat::Active {
                *stat = WorkerStat::Empty;
            }
        }
    }
}

// ============================================================================
// Elastic Sizing
// ============================================================================

impl ThreadPool {
    fn start_monitor(self: &Arc<Self>) -> Result<(), Error> {
        let initial = read_cpu_times().unwrap_or_default();
        let mut controller = SizeController::new(self.config.verify_count, initial);
        let weak = Arc::downgrade(self);
        let timer = Timer::start(
            self.config.monitor_period,
            "reactor-net-pool-monitor",
            move || {
                if let Some(pool) = weak.upgrade() {
                    pool.monitor_tick(&mut controller);
                }
            },
        )?;
        *self.monitor.lock().expect("monitor slot poisoned") = Some(timer);
        Ok(())
    }

    #[instrument(skip(self, controller))]
    fn monitor_tick(&self, controller: &mut SizeController) {
        let sample = match read_cpu_times() {
            Ok(sample) => sample,
            Err(err) => {
                warn!(?err, "Failed to sample CPU times");
                return;
            }
        };
        let percent = controller.load_percent(sample);
        let queue_len = self.queue_len();

        match controller.decide(percent, queue_len) {
            SizingAction::Grow => self.grow_one(percent),
            SizingAction::Shrink => self.shrink_idle_workers(percent),
            SizingAction::Hold => {}
        }
    }

    #[instrument(skip(self))]
    fn grow_one(&self, percent: f64) {
        if self.worker_count() >= self.config.max_thread {
            return;
        }
        let mut state = self.shared.state.lock().expect("pool mutex poisoned");
        if state.stop {
            return;
        }
        match self.spawn_worker(&mut state) {
            Ok(()) => debug!(percent, "Grew worker pool"),
            Err(err) => warn!(?err, "Failed to grow worker pool"),
        }
    }

    // Marks idle workers dead, never dropping below min_core_thread, then
    // joins them.
    #[instrument(skip(self))]
    fn shrink_idle_workers(&self, percent: f64) {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if state.stop || !state.tasks.is_empty() {
                return;
            }
            let live = self.worker_count();
            let mut removable = live.saturating_sub(self.config.min_core_thread);
            for (id, stat) in state.worker_stat.iter_mut() {
                if removable == 0 {
                    break;
                }
                if *stat == WorkerStat::Empty {
                    *stat = WorkerStat::Dead;
                    doomed.push(*id);
                    removable -= 1;
                }
            }
        }
        if doomed.is_empty() {
            return;
        }
        self.shared.cv.notify_all();
        for id in &doomed {
            let handle = self
                .workers
                .lock()
                .expect("worker table poisoned")
                .remove(id);
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        let mut state = self.shared.state.lock().expect("pool mutex poisoned");
        for id in &doomed {
            state.worker_stat.remove(id);
        }
        debug!(removed = doomed.len(), percent, "Shrunk worker pool");
    }
}

// ============================================================================
// Shutdown
// ============================================================================

impl ThreadPool {
    /// Stops the pool: discards pending tasks, retires every worker, joins
    /// them all. In-flight tasks run to completion. Idempotent.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            if state.stop {
                return;
            }
            state.stop = true;
            let dropped = state.tasks.len();
            state.tasks.clear();
            for stat in state.worker_stat.values_mut() {
                *stat = WorkerStat::Dead;
            }
            if dropped > 0 {
                debug!(dropped, "Discarded pending tasks");
            }
        }

        if let Some(mut timer) = self.monitor.lock().expect("monitor slot poisoned").take() {
            timer.stop();
        }

        self.shared.cv.notify_all();
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .drain()
            .collect();
        for (_, handle) in handles {
            let _ = handle.join();
        }

        self.shared
            .state
            .lock()
            .expect("pool mutex poisoned")
            .worker_stat
            .clear();
        info!("Thread pool shut down");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool_with(min: usize, max: usize) -> Arc<ThreadPool> {
        ThreadPool::new(ThreadPoolConfig {
            min_core_thread: min,
            max_thread: max,
            start_monitor_timer: false,
            ..ThreadPoolConfig::default()
        })
        .expect("pool")
    }

    #[test]
    fn rejects_invalid_bounds() {
        let bad = ThreadPoolConfig {
            min_core_thread: 4,
            max_thread: 2,
            ..ThreadPoolConfig::default()
        };
        assert!(matches!(
            ThreadPool::new(bad),
            Err(Error::InvalidPoolConfig { min: 4, max: 2 })
        ));
        let zero = ThreadPoolConfig {
            min_core_thread: 0,
            ..ThreadPoolConfig::default()
        };
        assert!(ThreadPool::new(zero).is_err());
    }

    #[test]
    fn starts_min_core_workers() {
        let pool = pool_with(3, 8);
        assert_eq!(pool.worker_count(), 3);
        pool.shutdown();
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn tasks_run_in_submission_order() {
        // A single worker dequeues strictly in FIFO order.
        let pool = pool_with(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let order = Arc::clone(&order);
            handles.push(pool.enqueue_task(move || {
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.wait().expect("task");
        }
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn handle_carries_value_and_panic() {
        let pool = pool_with(2, 4);
        let ok = pool.enqueue_task(|| 6 * 7);
        assert_eq!(ok.wait().expect("value"), 42);

        let boom = pool.enqueue_task(|| -> u32 { panic!("handler exploded") });
        match boom.wait() {
            Err(Error::TaskPanicked(message)) => assert!(message.contains("handler exploded")),
            other => panic!("expected TaskPanicked, got {other:?}"),
        }

        // The worker survives the panic.
        let again = pool.enqueue_task(|| 1);
        assert_eq!(again.wait().expect("value"), 1);
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_drops_pending() {
        let pool = pool_with(1, 1);

        let (started_tx, started_rx) = mpsc::channel();
        let blocker = pool.enqueue_task(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
            "done"
        });
        started_rx.recv().expect("blocker started");

        // The only worker is busy, so this stays queued and gets dropped.
        let pending = pool.enqueue_task(|| "never runs");

        pool.shutdown();
        pool.shutdown();

        assert_eq!(blocker.wait().expect("in-flight task completes"), "done");
        assert!(matches!(pending.wait(), Err(Error::TaskDropped)));
    }

    #[test]
    fn enqueue_after_shutdown_reports_dropped() {
        let pool = pool_with(1, 1);
        pool.shutdown();
        let handle = pool.enqueue_task(|| 5);
        assert!(matches!(handle.wait(), Err(Error::TaskDropped)));
    }

    #[test]
    fn config_from_config_crate() {
        let config = ::config::Config::builder()
            .set_default("pool.min_core_thread", 2)
            .unwrap()
            .set_default("pool.max_thread", 6)
            .unwrap()
            .set_default("pool.monitor_period_us", 10_000)
            .unwrap()
            .set_default("pool.verify_count", 2)
            .unwrap()
            .set_default("pool.start_monitor_timer", true)
            .unwrap()
            .build()
            .unwrap();
        let parsed = ThreadPoolConfig::from_config(&config, "pool");
        assert_eq!(parsed.min_core_thread, 2);
        assert_eq!(parsed.max_thread, 6);
        assert_eq!(parsed.monitor_period, Duration::from_millis(10));
        assert_eq!(parsed.verify_count, 2);
        assert!(parsed.start_monitor_timer);
    }
}
