//! The host-facing call surface.
//!
//! [`NativeCore`] wires the engine, the offloader, the worker and a
//! [`HostContext`] together behind the seven operations a host sees:
//! `hash_password`, `hash_password_async`, `benchmark_sync`, `sleep_thread`,
//! `start_worker`, `stop_worker` and `is_worker_running`.
//!
//! A `NativeCore` lives on the host thread (it owns the `!Send` host
//! context). Asynchronous results come back as [`Eventual`] handles that
//! settle during host turns ([`NativeCore::turn`], [`NativeCore::wait`]).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bridge::{CallbackBridge, CallbackRef, HostContext};
use crate::config::CoreConfig;
use crate::error::{BridgeError, Result};
use crate::hash::{HashEngine, HashRequest, StretchedSha256};
use crate::offload::{benchmark_sync, Benchmark, Completion, OperationId, TaskOffloader};
use crate::worker::{sleep_ms, CallbackInvocation, WorkerState, WorkerThreadManager};

// ---------------------------------------------------------------------------
// Pending operations
// ---------------------------------------------------------------------------

/// Where an asynchronous operation stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState<T> {
    Pending,
    Completed(T),
    Failed(BridgeError),
}

/// Host-side record of one offloaded operation. Settles exactly once.
#[derive(Debug)]
pub struct PendingOperation<T> {
    id: OperationId,
    state: OperationState<T>,
}

impl<T> PendingOperation<T> {
    fn new(id: OperationId) -> Self {
        Self {
            id,
            state: OperationState::Pending,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> &OperationState<T> {
        &self.state
    }

    /// Returns `false` if the operation had already settled.
    fn settle(&mut self, outcome: Result<T>) -> bool {
        if !matches!(self.state, OperationState::Pending) {
            return false;
        }
        self.state = match outcome {
            Ok(value) => OperationState::Completed(value),
            Err(err) => OperationState::Failed(err),
        };
        true
    }
}

type Shared<T> = Rc<RefCell<PendingOperation<T>>>;

/// The host's handle on an asynchronous result.
pub struct Eventual<T> {
    op: Shared<T>,
}

impl<T: Clone> Eventual<T> {
    pub fn id(&self) -> OperationId {
        self.op.borrow().id
    }

    pub fn state(&self) -> OperationState<T> {
        self.op.borrow().state.clone()
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.op.borrow().state, OperationState::Pending)
    }

    /// The outcome once settled, `None` while pending.
    pub fn outcome(&self) -> Option<Result<T>> {
        match &self.op.borrow().state {
            OperationState::Pending => None,
            OperationState::Completed(value) => Some(Ok(value.clone())),
            OperationState::Failed(err) => Some(Err(err.clone())),
        }
    }

    /// The outcome if settled; otherwise the handle is given back.
    pub fn try_take(self) -> std::result::Result<Result<T>, Self> {
        let outcome = self.outcome();
        outcome.ok_or(self)
    }
}

impl<T: fmt::Debug> fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.op.borrow();
        f.debug_struct("Eventual")
            .field("id", &op.id)
            .field("state", &op.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Native core
// ---------------------------------------------------------------------------

/// The full call surface, bound to one host context.
pub struct NativeCore {
    config: CoreConfig,
    host: HostContext,
    offloader: TaskOffloader,
    worker: WorkerThreadManager,
    pending: Rc<RefCell<HashMap<OperationId, Shared<String>>>>,
    completions: CallbackRef<Completion>,
    worker_callback: Cell<Option<CallbackRef<CallbackInvocation>>>,
}

impl NativeCore {
    /// Build a core around the default [`StretchedSha256`] engine.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let engine = StretchedSha256::new(config.hash.clone())?;
        Self::with_engine(config, Arc::new(engine))
    }

    /// Build a core around a custom engine.
    pub fn with_engine(config: CoreConfig, engine: Arc<dyn HashEngine>) -> Result<Self> {
        config.validate()?;
        let host = HostContext::with_config(&config.host);
        let offloader = TaskOffloader::new(engine, config.offload.clone())?;
        let worker = WorkerThreadManager::new(config.worker.clone())?;

        let pending: Rc<RefCell<HashMap<OperationId, Shared<String>>>> = Rc::default();
        let router = Rc::clone(&pending);
        let completions = host.register(move |completion: Completion| {
            let Some(op) = router.borrow_mut().remove(&completion.id) else {
                warn!(id = %completion.id, "completion for unknown operation dropped");
                return Ok(());
            };
            let outcome = completion.outcome.map(|digest| digest.to_hex());
            debug!(id = %completion.id, ok = outcome.is_ok(), "operation settled");
            op.borrow_mut().settle(outcome);
            Ok(())
        });

        info!(engine = offloader.engine().name(), "native core ready");
        Ok(Self {
            config,
            host,
            offloader,
            worker,
            pending,
            completions,
            worker_callback: Cell::new(None),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    pub fn offloader(&self) -> &TaskOffloader {
        &self.offloader
    }

    pub fn worker(&self) -> &WorkerThreadManager {
        &self.worker
    }

    /// Operations submitted but not yet settled on the host.
    pub fn pending_operations(&self) -> usize {
        self.pending.borrow().len()
    }

    // -- hashing -----------------------------------------------------------

    /// Hash on the calling thread and return the hex digest.
    pub fn hash_password(&self, password: &str, salt: &str, cost: i64) -> Result<String> {
        let request = HashRequest::new(password, salt, cost)?;
        self.offloader.run_inline(&request).map(|digest| digest.to_hex())
    }

    /// Hash on an offload thread. Returns immediately; the [`Eventual`]
    /// settles during a later host turn. Invalid input settles it as
    /// failed through the same path.
    pub fn hash_password_async(&self, password: &str, salt: &str, cost: i64) -> Eventual<String> {
        let sink = CallbackBridge::unbounded(self.host.handle(), self.completions);
        let id = match HashRequest::new(password, salt, cost) {
            Ok(request) => self.offloader.submit(request, sink),
            Err(err) => self.offloader.reject(err, sink),
        };

        let op = Rc::new(RefCell::new(PendingOperation::new(id)));
        self.pending.borrow_mut().insert(id, Rc::clone(&op));
        Eventual { op }
    }

    /// Call `f` on the host thread and report how long it took.
    pub fn benchmark_sync<T>(&self, f: impl FnOnce() -> T) -> Benchmark<T> {
        benchmark_sync(f)
    }

    /// Block the calling thread for `ms` milliseconds.
    pub fn sleep_thread(&self, ms: i64) -> Result<()> {
        sleep_ms(ms)
    }

    // -- worker ------------------------------------------------------------

    /// Start the background worker; `callback` receives `(message, counter)`
    /// on the host context each tick.
    ///
    /// A no-op returning the current state when the worker is already
    /// running; `callback` is then dropped.
    pub fn start_worker<F>(&self, mut callback: F) -> Result<WorkerState>
    where
        F: FnMut(&str, u64) -> anyhow::Result<()> + 'static,
    {
        if self.worker.is_running() {
            warn!("start_worker ignored: worker already running");
            return Ok(self.worker.state());
        }
        if let Some(stale) = self.worker_callback.take() {
            self.host.release(stale);
        }

        let target = self
            .host
            .register(move |tick: CallbackInvocation| callback(&tick.message, tick.counter));
        let bridge = CallbackBridge::new(self.host.handle(), target);
        match self.worker.start(bridge) {
            Ok(state) => {
                self.worker_callback.set(Some(target));
                Ok(state)
            }
            Err(err) => {
                self.host.release(target);
                Err(err)
            }
        }
    }

    /// Stop the background worker. Returns `false` if it was not running.
    ///
    /// Ticks still queued for the host are discarded.
    pub fn stop_worker(&self) -> bool {
        let stopped = self.worker.stop();
        if let Some(target) = self.worker_callback.take() {
            self.host.release(target);
        }
        stopped
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.is_running()
    }

    // -- host turns --------------------------------------------------------

    /// Run every delivery queued right now.
    pub fn run_pending(&self) -> Result<usize> {
        self.host.run_pending()
    }

    /// Wait up to `timeout` for deliveries and run them.
    pub fn turn(&self, timeout: Duration) -> Result<usize> {
        self.host.turn(timeout)
    }

    /// Drive host turns until `eventual` settles and return its outcome.
    ///
    /// The handle stays with the caller, so an error from an unrelated
    /// delivery during a turn leaves the operation reachable for a retry.
    ///
    /// # Errors
    ///
    /// The operation's own failure, a failing host callback run along the
    /// way, or [`BridgeError::ResourceUnavailable`] if `timeout` passes
    /// first.
    pub fn wait<T: Clone>(&self, eventual: &Eventual<T>, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = eventual.outcome() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::unavailable(format!(
                    "{} not settled within {timeout:?}",
                    eventual.id()
                )));
            }
            self.host.turn(deadline - now)?;
        }
    }
}

impl Drop for NativeCore {
    fn drop(&mut self) {
        self.stop_worker();
        self.host.release(self.completions);
    }
}

impl fmt::Debug for NativeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCore")
            .field("host", &self.host)
            .field("offloader", &self.offloader)
            .field("worker", &self.worker)
            .field("pending_operations", &self.pending_operations())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;

    const SALT: &str = "hash343454523f";
    const WAIT: Duration = Duration::from_secs(10);

    fn fast_core() -> NativeCore {
        let mut config = CoreConfig::default();
        config.hash.rounds_per_cost = 4;
        config.worker = WorkerConfig {
            interval_ms: 10,
            ..WorkerConfig::default()
        };
        NativeCore::new(config).unwrap()
    }

    #[test]
    fn test_async_settles_on_host_turn() {
        let core = fast_core();
        let eventual = core.hash_password_async("password", SALT, 2);
        assert_eq!(eventual.state(), OperationState::Pending);
        assert_eq!(core.pending_operations(), 1);

        let digest = core.wait(&eventual, WAIT).unwrap();
        assert_eq!(digest, core.hash_password("password", SALT, 2).unwrap());
        assert_eq!(core.pending_operations(), 0);
    }

    #[test]
    fn test_invalid_cost_fails_async_without_offloading() {
        let core = fast_core();
        let eventual = core.hash_password_async("password", SALT, 0);
        assert!(!eventual.is_settled());

        core.run_pending().unwrap();
        assert!(matches!(eventual.state(), OperationState::Failed(BridgeError::InvalidInput(_))));
        assert!(matches!(core.wait(&eventual, WAIT), Err(BridgeError::InvalidInput(_))));
        assert_eq!(core.offloader().in_flight(), 0);
    }

    #[test]
    fn test_sync_invalid_input() {
        let core = fast_core();
        assert!(matches!(core.hash_password("pw", SALT, -1), Err(BridgeError::InvalidInput(_))));
        assert!(matches!(core.hash_password("pw", "salt", 1), Err(BridgeError::InvalidInput(_))));
    }

    #[test]
    fn test_wait_times_out_on_unsettled() {
        let core = fast_core();
        let op = Rc::new(RefCell::new(PendingOperation::<String>::new(OperationId(99))));
        let eventual = Eventual { op };
        let err = core.wait(&eventual, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BridgeError::ResourceUnavailable(msg) if msg.contains("op-99")));
    }

    #[test]
    fn test_try_take_returns_handle_until_settled() {
        let core = fast_core();
        let eventual = core.hash_password_async("password", SALT, 1);
        let eventual = eventual.try_take().unwrap_err();

        core.wait(&eventual, WAIT).unwrap();
        assert_eq!(eventual.outcome(), Some(core.hash_password("password", SALT, 1)));
        let taken = eventual.try_take().unwrap();
        assert_eq!(taken, core.hash_password("password", SALT, 1));
    }

    #[test]
    fn test_settle_is_once() {
        let mut op = PendingOperation::new(OperationId(1));
        assert!(op.settle(Ok("first".to_string())));
        assert!(!op.settle(Ok("second".to_string())));
        assert_eq!(op.state(), &OperationState::Completed("first".to_string()));
    }

    #[test]
    fn test_worker_ticks_reach_callback() {
        let core = fast_core();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        core.start_worker(move |message, counter| {
            sink.borrow_mut().push((message.to_string(), counter));
            Ok(())
        })
        .unwrap();
        assert!(core.is_worker_running());

        while seen.borrow().len() < 3 {
            core.turn(WAIT).unwrap();
        }
        assert!(core.stop_worker());
        assert!(!core.is_worker_running());

        let seen = seen.borrow();
        assert_eq!(seen[0], ("Tick".to_string(), 0));
        assert!(seen.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn test_second_start_keeps_first_callback() {
        let core = fast_core();
        let first = Rc::new(Cell::new(0u32));
        let second = Rc::new(Cell::new(0u32));

        let a = Rc::clone(&first);
        core.start_worker(move |_, _| {
            a.set(a.get() + 1);
            Ok(())
        })
        .unwrap();
        let b = Rc::clone(&second);
        assert_eq!(
            core.start_worker(move |_, _| {
                b.set(b.get() + 1);
                Ok(())
            })
            .unwrap(),
            WorkerState::Running
        );

        while first.get() == 0 {
            core.turn(WAIT).unwrap();
        }
        core.stop_worker();
        assert_eq!(second.get(), 0);
    }

    #[test]
    fn test_callback_error_surfaces_from_turn() {
        let core = fast_core();
        core.start_worker(|_, counter| {
            anyhow::ensure!(counter < 1, "callback rejected tick {counter}");
            Ok(())
        })
        .unwrap();

        let err = loop {
            if let Err(err) = core.turn(WAIT) {
                break err;
            }
        };
        assert_eq!(err, BridgeError::HostCallback("callback rejected tick 1".into()));
        core.stop_worker();
    }

    #[test]
    fn test_stop_worker_when_stopped() {
        let core = fast_core();
        assert!(!core.stop_worker());
        assert!(!core.is_worker_running());
    }

    #[test]
    fn test_sleep_thread_rejects_negative() {
        let core = fast_core();
        assert!(core.sleep_thread(-5).is_err());
        assert!(core.sleep_thread(1).is_ok());
    }
}
