//! Cross-thread delivery into a single-threaded host context.
//!
//! The host owns a [`HostContext`]. It is deliberately `!Send`: host
//! callbacks are registered on it, live on it, and only ever run on the
//! thread that owns it, so they need no locking of their own. Any OS thread
//! can hold a [`HostHandle`] and post deliveries; the host drains them on its
//! own turn via [`HostContext::run_pending`] or [`HostContext::turn`].
//!
//! ```text
//!  offload / worker thread                 host thread
//!  ───────────────────────                 ───────────
//!  CallbackBridge::deliver(payload)
//!      │  HostHandle::post(job)
//!      └────────► [ delivery channel ] ────► HostContext::turn()
//!                                                └─► registry[target](payload)
//! ```
//!
//! Deliveries posted from one thread run in the order they were posted.
//! Nothing is promised about interleaving across threads.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::error::{BridgeError, Result};

/// A unit of work to run on the host context.
pub type Delivery = Box<dyn FnOnce(&HostContext) -> Result<()> + Send>;

type HostFn<A> = Rc<RefCell<dyn FnMut(A) -> anyhow::Result<()>>>;

// ---------------------------------------------------------------------------
// Deliver trait
// ---------------------------------------------------------------------------

/// "Post this payload to the host's execution context."
///
/// This is the seam between the native threads and whatever the host is.
/// [`CallbackBridge`] implements it on top of a [`HostContext`]; bindings for
/// other runtimes implement it with that runtime's own primitive.
///
/// Implementations must never run host code on the calling thread and must
/// not block waiting for the host to drain.
pub trait Deliver<T>: Send + Sync {
    /// Schedule `payload` for delivery.
    ///
    /// # Errors
    ///
    /// [`BridgeError::HostGone`] when the host can no longer receive, or
    /// [`BridgeError::ResourceUnavailable`] when its queue is full. The
    /// payload is discarded in both cases.
    fn deliver(&self, payload: T) -> Result<()>;
}

impl<T, D: Deliver<T> + ?Sized> Deliver<T> for Arc<D> {
    fn deliver(&self, payload: T) -> Result<()> {
        (**self).deliver(payload)
    }
}

impl<T, D: Deliver<T> + ?Sized> Deliver<T> for Box<D> {
    fn deliver(&self, payload: T) -> Result<()> {
        (**self).deliver(payload)
    }
}

// ---------------------------------------------------------------------------
// Callback references
// ---------------------------------------------------------------------------

/// A `Send + Copy` token naming a callback registered on a [`HostContext`].
///
/// The callback itself never leaves the host thread.
pub struct CallbackRef<A> {
    id: u64,
    _payload: PhantomData<fn(A)>,
}

impl<A> CallbackRef<A> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<A> Clone for CallbackRef<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for CallbackRef<A> {}

impl<A> PartialEq for CallbackRef<A> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<A> Eq for CallbackRef<A> {}

impl<A> fmt::Debug for CallbackRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackRef").field(&self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Host handle
// ---------------------------------------------------------------------------

struct QueueState {
    pending: AtomicUsize,
    capacity: Option<usize>,
}

/// Thread-safe poster onto one [`HostContext`].
#[derive(Clone)]
pub struct HostHandle {
    tx: Sender<Delivery>,
    queue: Arc<QueueState>,
}

impl HostHandle {
    /// Queue a delivery. Never blocks.
    pub fn post(&self, delivery: Delivery) -> Result<()> {
        let reserved = self
            .queue
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match self.queue.capacity {
                Some(cap) if n >= cap => None,
                _ => Some(n + 1),
            });
        if let Err(pending) = reserved {
            return Err(BridgeError::unavailable(format!(
                "host delivery queue full ({pending} pending)"
            )));
        }

        self.tx.send(delivery).map_err(|_| {
            self.queue.pending.fetch_sub(1, Ordering::AcqRel);
            BridgeError::HostGone
        })
    }

    /// Queue a delivery without checking the capacity. For results the
    /// host must receive regardless of backpressure; still counted as
    /// pending.
    pub fn post_unbounded(&self, delivery: Delivery) -> Result<()> {
        self.queue.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(delivery).map_err(|_| {
            self.queue.pending.fetch_sub(1, Ordering::AcqRel);
            BridgeError::HostGone
        })
    }

    /// Deliveries queued but not yet run.
    pub fn pending(&self) -> usize {
        self.queue.pending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("pending", &self.pending())
            .field("capacity", &self.queue.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Host context
// ---------------------------------------------------------------------------

/// The host's single cooperative execution context.
pub struct HostContext {
    rx: Receiver<Delivery>,
    handle: HostHandle,
    callbacks: RefCell<HashMap<u64, Box<dyn Any>>>,
    next_callback: Cell<u64>,
    _single_threaded: PhantomData<Rc<()>>,
}

impl HostContext {
    /// A context with an unbounded delivery queue.
    pub fn new() -> Self {
        Self::with_config(&HostConfig::default())
    }

    pub fn with_config(config: &HostConfig) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            rx,
            handle: HostHandle {
                tx,
                queue: Arc::new(QueueState {
                    pending: AtomicUsize::new(0),
                    capacity: config.queue_capacity,
                }),
            },
            callbacks: RefCell::new(HashMap::new()),
            next_callback: Cell::new(1),
            _single_threaded: PhantomData,
        }
    }

    /// A poster other threads can use to reach this context.
    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    /// Register a host callback. It is only ever invoked on this context.
    pub fn register<A, F>(&self, callback: F) -> CallbackRef<A>
    where
        A: 'static,
        F: FnMut(A) -> anyhow::Result<()> + 'static,
    {
        let id = self.next_callback.get();
        self.next_callback.set(id + 1);

        let callback: HostFn<A> = Rc::new(RefCell::new(callback));
        self.callbacks.borrow_mut().insert(id, Box::new(callback));
        debug!(callback = id, "host callback registered");

        CallbackRef {
            id,
            _payload: PhantomData,
        }
    }

    /// Drop a registered callback. Deliveries still in flight for it are
    /// discarded when they arrive. Returns whether it was registered.
    pub fn release<A>(&self, target: CallbackRef<A>) -> bool {
        let removed = self.callbacks.borrow_mut().remove(&target.id).is_some();
        if removed {
            debug!(callback = target.id, "host callback released");
        }
        removed
    }

    pub fn is_registered<A>(&self, target: CallbackRef<A>) -> bool {
        self.callbacks.borrow().contains_key(&target.id)
    }

    /// Invoke a registered callback right here on the host context.
    ///
    /// Returns `Ok(false)` when the callback is no longer registered.
    pub fn invoke<A: 'static>(&self, target: CallbackRef<A>, payload: A) -> Result<bool> {
        let callback = {
            let callbacks = self.callbacks.borrow();
            match callbacks
                .get(&target.id)
                .and_then(|entry| entry.downcast_ref::<HostFn<A>>())
            {
                Some(callback) => Rc::clone(callback),
                None => {
                    warn!(callback = target.id, "delivery for released callback dropped");
                    return Ok(false);
                }
            }
        };

        let mut callback = callback.try_borrow_mut().map_err(|_| {
            BridgeError::HostCallback(format!(
                "re-entrant invocation of callback {}",
                target.id
            ))
        })?;
        (&mut *callback)(payload).map_err(|err| BridgeError::from_host(&err))?;
        Ok(true)
    }

    /// Run every delivery queued at the time of the call.
    ///
    /// Stops at the first delivery that fails and returns its error; the
    /// rest stay queued for the next turn.
    pub fn run_pending(&self) -> Result<usize> {
        let budget = self.rx.len();
        let mut ran = 0;
        for _ in 0..budget {
            let Ok(delivery) = self.rx.try_recv() else {
                break;
            };
            ran += 1;
            self.run_one(delivery)?;
        }
        Ok(ran)
    }

    /// Wait up to `timeout` for a delivery, then drain the queue.
    pub fn turn(&self, timeout: Duration) -> Result<usize> {
        if !self.rx.is_empty() {
            return self.run_pending();
        }
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => {
                self.run_one(delivery)?;
                Ok(1 + self.run_pending()?)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    /// Deliveries queued but not yet run.
    pub fn pending_deliveries(&self) -> usize {
        self.handle.pending()
    }

    fn run_one(&self, delivery: Delivery) -> Result<()> {
        self.handle.queue.pending.fetch_sub(1, Ordering::AcqRel);
        delivery(self)
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("pending", &self.pending_deliveries())
            .field("callbacks", &self.callbacks.borrow().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Callback bridge
// ---------------------------------------------------------------------------

/// Delivers payloads of type `T` to one registered host callback.
pub struct CallbackBridge<T> {
    host: HostHandle,
    target: CallbackRef<T>,
    bounded: bool,
}

impl<T> CallbackBridge<T> {
    /// A bridge subject to the host's queue capacity.
    pub fn new(host: HostHandle, target: CallbackRef<T>) -> Self {
        Self {
            host,
            target,
            bounded: true,
        }
    }

    /// A bridge whose posts ignore the queue capacity. Used for payloads
    /// that must arrive exactly once, such as operation completions.
    pub fn unbounded(host: HostHandle, target: CallbackRef<T>) -> Self {
        Self {
            host,
            target,
            bounded: false,
        }
    }

    pub fn target(&self) -> CallbackRef<T> {
        self.target
    }
}

impl<T> Clone for CallbackBridge<T> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            target: self.target,
            bounded: self.bounded,
        }
    }
}

impl<T: Send + 'static> Deliver<T> for CallbackBridge<T> {
    fn deliver(&self, payload: T) -> Result<()> {
        let target = self.target;
        let delivery: Delivery = Box::new(move |host| host.invoke(target, payload).map(|_| ()));
        if self.bounded {
            self.host.post(delivery)
        } else {
            self.host.post_unbounded(delivery)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
