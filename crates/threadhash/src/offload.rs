//! Running hash jobs off the host thread.
//!
//! [`TaskOffloader::submit`] hands one [`HashRequest`] to a dedicated OS
//! thread, runs the [`HashEngine`] there, and posts exactly one
//! [`Completion`] through the caller's [`Deliver`] sink. Each completion
//! carries the [`OperationId`] returned by `submit`, so concurrent jobs
//! resolve independently no matter which finishes first.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bridge::Deliver;
use crate::config::OffloadConfig;
use crate::error::{BridgeError, Result};
use crate::hash::{HashEngine, HashRequest, HashResult};

/// Identity of one offloaded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The single message an offloaded operation produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: OperationId,
    pub outcome: Result<HashResult>,
}

// ---------------------------------------------------------------------------
// In-flight accounting
// ---------------------------------------------------------------------------

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Offloader
// ---------------------------------------------------------------------------

/// Spawns one offload thread per submitted request.
pub struct TaskOffloader {
    engine: Arc<dyn HashEngine>,
    config: OffloadConfig,
    next_id: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl TaskOffloader {
    pub fn new(engine: Arc<dyn HashEngine>, config: OffloadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn engine(&self) -> &Arc<dyn HashEngine> {
        &self.engine
    }

    /// Operations currently running on offload threads.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run `request` inline on the calling thread.
    pub fn run_inline(&self, request: &HashRequest) -> Result<HashResult> {
        self.engine.compute(request)
    }

    /// Run `request` on an offload thread and deliver its [`Completion`]
    /// through `sink`. Never blocks on the hash itself.
    ///
    /// When no offload thread can be acquired the failure is delivered
    /// through `sink` like any other outcome.
    pub fn submit<D>(&self, request: HashRequest, sink: D) -> OperationId
    where
        D: Deliver<Completion> + 'static,
    {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let max = self.config.max_in_flight;

        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            warn!(%id, max, "offload rejected: too many operations in flight");
            let err = BridgeError::unavailable(format!("{max} operations already in flight"));
            send(&sink, Completion { id, outcome: Err(err) });
            return id;
        }
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let sink = Arc::new(sink);
        let thread_sink = Arc::clone(&sink);
        let engine = Arc::clone(&self.engine);

        let mut builder = thread::Builder::new().name(format!("{}-{}", self.config.thread_name, id.0));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        debug!(%id, ?request, engine = engine.name(), "offloading hash");
        let spawned = builder.spawn(move || {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.compute(&request)))
                .unwrap_or_else(|payload| {
                    Err(BridgeError::unavailable(format!(
                        "hash engine panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            drop(guard);
            debug!(%id, ok = outcome.is_ok(), elapsed = ?started.elapsed(), "offloaded hash finished");
            send(&*thread_sink, Completion { id, outcome });
        });

        if let Err(err) = spawned {
            warn!(%id, %err, "failed to spawn offload thread");
            let err = BridgeError::unavailable(format!("failed to spawn offload thread: {err}"));
            send(&*sink, Completion { id, outcome: Err(err) });
        }
        id
    }

    /// Allocate an id for a request that failed before it could be built,
    /// and deliver the failure through `sink` like a finished operation.
    pub fn reject<D>(&self, err: BridgeError, sink: D) -> OperationId
    where
        D: Deliver<Completion>,
    {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, %err, "request rejected before offload");
        send(&sink, Completion { id, outcome: Err(err) });
        id
    }
}

impl fmt::Debug for TaskOffloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOffloader")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn send<D: Deliver<Completion> + ?Sized>(sink: &D, completion: Completion) {
    let id = completion.id;
    if let Err(err) = sink.deliver(completion) {
        warn!(%id, %err, "completion could not be delivered");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Synchronous call-through
// ---------------------------------------------------------------------------

/// Return value and wall time of a [`benchmark_sync`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Benchmark<T> {
    pub value: T,
    pub elapsed: Duration,
}

impl<T> Benchmark<T> {
    /// Elapsed wall time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Call `f` on the current thread and time it.
///
/// No thread switch happens. Whatever `f` returns, including an `Err`, is
/// passed back unchanged, and a panic in `f` unwinds through this call.
pub fn benchmark_sync<T>(f: impl FnOnce() -> T) -> Benchmark<T> {
    let started = Instant::now();
    let value = f();
    Benchmark {
        value,
        elapsed: started.elapsed(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
