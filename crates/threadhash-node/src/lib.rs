//! Node.js NAPI bindings for the threadhash native core.
//!
//! Exposes password hashing, offloaded hashing, a blocking sleep and a
//! periodic background worker to JavaScript. Offloaded hashes run on their
//! own OS thread and settle a promise; worker ticks reach the JS callback
//! through a threadsafe function, so JS code only ever runs on the event
//! loop.
//!
//! ```javascript
//! const native = require('threadhash');
//! native.hashPassword('password', 'hash343454523f', 20);
//! await native.hashPasswordAsync('password', 'hash343454523f', 20);
//! native.startWorker((message, counter) => console.log(message, counter));
//! native.stopWorker();
//! ```

#![deny(clippy::all)]

use std::sync::{Arc, OnceLock};

use napi::bindgen_prelude::*;
use napi::threadsafe_function::{
    ErrorStrategy, ThreadSafeCallContext, ThreadsafeFunction, ThreadsafeFunctionCallMode,
};
use napi::{JsFunction, JsUnknown};
use napi_derive::napi;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use threadhash::{
    BridgeError, CallbackInvocation, Completion, CoreConfig, Deliver, HashRequest, StretchedSha256,
    TaskOffloader, WorkerConfig, WorkerThreadManager,
};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn to_napi(err: BridgeError) -> Error {
    let status = match err {
        BridgeError::InvalidInput(_) => Status::InvalidArg,
        _ => Status::GenericFailure,
    };
    Error::new(status, err.to_string())
}

// ---------------------------------------------------------------------------
// Process-wide state
// ---------------------------------------------------------------------------

fn offloader() -> Result<&'static TaskOffloader> {
    static OFFLOADER: OnceLock<threadhash::Result<TaskOffloader>> = OnceLock::new();
    OFFLOADER
        .get_or_init(|| {
            let config = CoreConfig::default();
            let engine = StretchedSha256::new(config.hash)?;
            TaskOffloader::new(Arc::new(engine), config.offload)
        })
        .as_ref()
        .map_err(|err| to_napi(err.clone()))
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Resolves one promise with the single completion of one operation.
struct PromiseSink(Mutex<Option<oneshot::Sender<Completion>>>);

impl Deliver<Completion> for PromiseSink {
    fn deliver(&self, payload: Completion) -> threadhash::Result<()> {
        let tx = self
            .0
            .lock()
            .take()
            .ok_or_else(|| BridgeError::HostCallback("completion already delivered".into()))?;
        tx.send(payload).map_err(|_| BridgeError::HostGone)
    }
}

/// Queues worker ticks onto the event loop.
struct TickSink(ThreadsafeFunction<CallbackInvocation, ErrorStrategy::Fatal>);

impl Deliver<CallbackInvocation> for TickSink {
    fn deliver(&self, payload: CallbackInvocation) -> threadhash::Result<()> {
        match self.0.call(payload, ThreadsafeFunctionCallMode::NonBlocking) {
            Status::Ok => Ok(()),
            Status::Closing => Err(BridgeError::HostGone),
            Status::QueueFull => Err(BridgeError::unavailable("event loop queue full")),
            status => Err(BridgeError::unavailable(format!("threadsafe call failed: {status:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Hash `password` with `salt` at `cost` on the calling thread.
///
/// Blocks the event loop for the duration of the hash.
#[napi]
pub fn hash_password(password: String, salt: String, cost: i64) -> Result<String> {
    let request = HashRequest::new(password, salt, cost).map_err(to_napi)?;
    offloader()?
        .run_inline(&request)
        .map(|digest| digest.to_hex())
        .map_err(to_napi)
}

/// Hash on a dedicated native thread. Resolves with the same digest
/// `hashPassword` returns for the same arguments.
#[napi]
pub async fn hash_password_async(password: String, salt: String, cost: i64) -> Result<String> {
    let offloader = offloader()?;
    let (tx, rx) = oneshot::channel();
    let sink = PromiseSink(Mutex::new(Some(tx)));

    let id = match HashRequest::new(password, salt, cost) {
        Ok(request) => offloader.submit(request, sink),
        Err(err) => offloader.reject(err, sink),
    };
    tracing::debug!(%id, "awaiting offloaded hash");

    let completion = rx
        .await
        .map_err(|_| Error::from_reason("hash operation dropped without a result"))?;
    completion
        .outcome
        .map(|digest| digest.to_hex())
        .map_err(to_napi)
}

/// Call `callback` synchronously and return whatever it returns. A thrown
/// exception propagates unchanged. The elapsed time is logged at debug level.
#[napi(ts_args_type = "callback: () => unknown", ts_return_type = "unknown")]
pub fn benchmark_sync(callback: JsFunction) -> Result<JsUnknown> {
    let bench = threadhash::benchmark_sync(|| callback.call_without_args(None));
    tracing::debug!(elapsed_ms = bench.elapsed_ms(), "benchmarkSync finished");
    bench.value
}

/// Block the calling thread for `ms` milliseconds.
#[napi]
pub fn sleep_thread(ms: f64) -> Result<()> {
    if !ms.is_finite() {
        return Err(to_napi(BridgeError::invalid(format!(
            "sleep duration must be a finite number, got {ms}"
        ))));
    }
    threadhash::sleep_ms(ms as i64).map_err(to_napi)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Options for `startWorker`.
#[napi(object)]
pub struct JsWorkerOptions {
    /// Milliseconds between callbacks (default: 1000).
    pub interval_ms: Option<u32>,
    /// Message passed to every callback (default: "Tick").
    pub message: Option<String>,
}

/// Start the background worker. `callback(message, counter)` runs on the
/// event loop once per interval. Does nothing if the worker is already
/// running.
#[napi(ts_args_type = "callback: (message: string, counter: number) => void, options?: JsWorkerOptions")]
pub fn start_worker(callback: JsFunction, options: Option<JsWorkerOptions>) -> Result<()> {
    let worker = WorkerThreadManager::global();
    if worker.is_running() {
        tracing::warn!("startWorker ignored: worker already running");
        return Ok(());
    }

    let mut config: WorkerConfig = worker.config().clone();
    if let Some(options) = options {
        if let Some(interval_ms) = options.interval_ms {
            config.interval_ms = u64::from(interval_ms);
        }
        if let Some(message) = options.message {
            config.message = message;
        }
    }

    let tsfn: ThreadsafeFunction<CallbackInvocation, ErrorStrategy::Fatal> = callback
        .create_threadsafe_function(0, |ctx: ThreadSafeCallContext<CallbackInvocation>| {
            let message = ctx.env.create_string(&ctx.value.message)?.into_unknown();
            let counter = ctx.env.create_double(ctx.value.counter as f64)?.into_unknown();
            Ok(vec![message, counter])
        })?;

    worker.start_with(TickSink(tsfn), config).map_err(to_napi)?;
    Ok(())
}

/// Stop the background worker. Returns `false` if it was not running.
#[napi]
pub fn stop_worker() -> bool {
    WorkerThreadManager::global().stop()
}

#[napi]
pub fn is_worker_running() -> bool {
    WorkerThreadManager::global().is_running()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a stderr log subscriber. `filter` uses `RUST_LOG` syntax and
/// defaults to `RUST_LOG`, then `info`. Later calls are ignored.
#[napi]
pub fn init_logging(filter: Option<String>) -> Result<()> {
    let filter = match filter {
        Some(directives) => tracing_subscriber::EnvFilter::try_new(&directives)
            .map_err(|e| Error::new(Status::InvalidArg, format!("invalid log filter: {e}")))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
    Ok(())
}
