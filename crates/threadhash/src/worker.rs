//! The persistent background worker.
//!
//! [`WorkerThreadManager`] owns at most one long-lived OS thread. While
//! running, the thread builds a [`CallbackInvocation`] every tick, posts it
//! through a [`Deliver`] sink, and then waits out the cadence on a
//! [`CancelSignal`].
//!
//! # State machine
//!
//! ```text
//! Stopped ──start──► Starting ──loop entered──► Running
//!    ▲                                             │
//!    └────────── joined ◄── Stopping ◄────stop─────┘
//! ```
//!
//! `start` and `stop` are serialized by one lock and are idempotent:
//! starting a running worker and stopping a stopped one are no-ops.
//! `is_running` reads an atomic and never takes the lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::bridge::Deliver;
use crate::config::WorkerConfig;
use crate::error::{BridgeError, Result};
use crate::offload::panic_message;

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Lifecycle of the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl From<u8> for WorkerState {
    fn from(val: u8) -> Self {
        match val {
            1 => WorkerState::Starting,
            2 => WorkerState::Running,
            3 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// The payload handed to the host callback on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackInvocation {
    pub message: String,
    pub counter: u64,
}

// ---------------------------------------------------------------------------
// Cancellation and sleeping
// ---------------------------------------------------------------------------

/// A one-shot cancellation flag that sleepers can wait on.
#[derive(Debug, Default)]
pub struct CancelSignal {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Block for up to `timeout` without spinning. Returns `true` as soon as
    /// the signal is raised, `false` once the full timeout has elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Block the calling thread for `duration` on a timed wait.
pub fn sleep(duration: Duration) {
    CancelSignal::new().wait_timeout(duration);
}

/// [`sleep`] for a host-supplied millisecond count. Negative values are
/// rejected.
pub fn sleep_ms(ms: i64) -> Result<()> {
    let ms = u64::try_from(ms)
        .map_err(|_| BridgeError::invalid(format!("sleep duration must not be negative, got {ms}")))?;
    sleep(Duration::from_millis(ms));
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker thread manager
// ---------------------------------------------------------------------------

struct ActiveWorker {
    thread: JoinHandle<()>,
    cancel: Arc<CancelSignal>,
}

/// Owns the single background worker thread.
pub struct WorkerThreadManager {
    config: WorkerConfig,
    state: Arc<AtomicU8>,
    ticks: Arc<AtomicU64>,
    lifecycle: Mutex<Option<ActiveWorker>>,
}

impl WorkerThreadManager {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(AtomicU8::new(WorkerState::Stopped as u8)),
            ticks: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(None),
        })
    }

    /// The process-wide default instance.
    pub fn global() -> &'static WorkerThreadManager {
        static GLOBAL: OnceLock<WorkerThreadManager> = OnceLock::new();
        GLOBAL.get_or_init(|| Self {
            config: WorkerConfig::default(),
            state: Arc::new(AtomicU8::new(WorkerState::Stopped as u8)),
            ticks: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Invocations delivered since the last start.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Start the worker with the manager's own configuration.
    pub fn start<D>(&self, sink: D) -> Result<WorkerState>
    where
        D: Deliver<CallbackInvocation> + 'static,
    {
        let config = self.config.clone();
        self.start_with(sink, config)
    }

    /// Start the worker, delivering ticks through `sink`.
    ///
    /// Returns once the background loop has begun, with the state set to
    /// [`WorkerState::Running`]. If the worker is already starting or
    /// running this is a no-op returning the current state, and `sink` is
    /// dropped unused.
    pub fn start_with<D>(&self, sink: D, config: WorkerConfig) -> Result<WorkerState>
    where
        D: Deliver<CallbackInvocation> + 'static,
    {
        config.validate()?;
        let mut active = self.lifecycle.lock();

        if let Err(err) = self.claim(&mut active) {
            warn!(%err, "start ignored");
            return Ok(self.state());
        }

        self.state.store(WorkerState::Starting as u8, Ordering::Release);
        self.ticks.store(0, Ordering::Release);

        let cancel = Arc::new(CancelSignal::new());
        let (ready_tx, ready_rx) = channel::bounded::<()>(1);
        let ctx = LoopContext {
            state: Arc::clone(&self.state),
            ticks: Arc::clone(&self.ticks),
            cancel: Arc::clone(&cancel),
            interval: config.interval(),
            message: config.message.clone(),
        };

        let spawned = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_loop(ctx, sink, ready_tx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.state.store(WorkerState::Stopped as u8, Ordering::Release);
                return Err(BridgeError::unavailable(format!(
                    "failed to spawn worker thread: {err}"
                )));
            }
        };

        if ready_rx.recv().is_err() {
            reap(ActiveWorker { thread, cancel });
            self.state.store(WorkerState::Stopped as u8, Ordering::Release);
            return Err(BridgeError::unavailable("worker thread exited during startup"));
        }

        info!(interval_ms = config.interval_ms, "worker started");
        *active = Some(ActiveWorker { thread, cancel });
        Ok(self.state())
    }

    /// Signal the worker to exit and join it.
    ///
    /// Blocks until the current tick finishes; bounded by the cadence.
    /// Returns `false` when there was no worker to stop.
    pub fn stop(&self) -> bool {
        let mut active = self.lifecycle.lock();
        let worker = match active.take().ok_or(BridgeError::NotRunning) {
            Ok(worker) => worker,
            Err(err) => {
                debug!(%err, "stop ignored");
                return false;
            }
        };

        self.state.store(WorkerState::Stopping as u8, Ordering::Release);
        worker.cancel.cancel();

        if worker.thread.thread().id() == thread::current().id() {
            // Called from inside a delivery on the worker thread itself: the
            // loop exits on its own after this tick. The handle stays in the
            // slot so the next start joins it before spawning.
            warn!("stop called from the worker thread; not joining");
            *active = Some(worker);
            return true;
        }

        reap(worker);
        self.state.store(WorkerState::Stopped as u8, Ordering::Release);
        info!(ticks = self.ticks(), "worker stopped");
        true
    }
}

impl WorkerThreadManager {
    /// Clear the slot for a new worker, reaping one whose loop already
    /// exited. Fails while a live worker holds it.
    fn claim(&self, active: &mut Option<ActiveWorker>) -> Result<()> {
        if active.is_some() && matches!(self.state(), WorkerState::Starting | WorkerState::Running) {
            return Err(BridgeError::AlreadyRunning);
        }
        // The winding-down worker cannot join itself.
        if let Some(current) = active.as_ref() {
            if current.thread.thread().id() == thread::current().id() {
                return Err(BridgeError::AlreadyRunning);
            }
        }
        if let Some(finished) = active.take() {
            reap(finished);
        }
        Ok(())
    }
}

impl Drop for WorkerThreadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerThreadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThreadManager")
            .field("state", &self.state())
            .field("ticks", &self.ticks())
            .field("config", &self.config)
            .finish()
    }
}

fn reap(worker: ActiveWorker) {
    worker.cancel.cancel();
    if let Err(payload) = worker.thread.join() {
        error!(panic = %panic_message(payload.as_ref()), "worker thread panicked");
    }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

struct LoopContext {
    state: Arc<AtomicU8>,
    ticks: Arc<AtomicU64>,
    cancel: Arc<CancelSignal>,
    interval: Duration,
    message: String,
}

/// Leaves the state at `Stopped` however the loop exits, panics included.
struct ExitGuard(Arc<AtomicU8>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.store(WorkerState::Stopped as u8, Ordering::Release);
    }
}

fn run_loop<D>(ctx: LoopContext, sink: D, ready: channel::Sender<()>)
where
    D: Deliver<CallbackInvocation>,
{
    let _exit = ExitGuard(Arc::clone(&ctx.state));
    ctx.state.store(WorkerState::Running as u8, Ordering::Release);
    let _ = ready.send(());
    drop(ready);

    let mut counter: u64 = 0;
    loop {
        let invocation = CallbackInvocation {
            message: ctx.message.clone(),
            counter,
        };
        match sink.deliver(invocation) {
            Ok(()) => {
                ctx.ticks.fetch_add(1, Ordering::AcqRel);
                debug!(counter, "tick delivered");
            }
            Err(BridgeError::HostGone) => {
                warn!(counter, "host context gone; worker exiting");
                break;
            }
            Err(err) => warn!(counter, %err, "tick dropped"),
        }
        counter += 1;

        if ctx.cancel.wait_timeout(ctx.interval) {
            break;
        }
    }
    debug!(counter, "worker loop exited");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
