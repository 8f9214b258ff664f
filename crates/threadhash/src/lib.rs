//! Native execution core for a single-threaded host runtime.
//!
//! The host owns one cooperative execution context and must never run
//! CPU-heavy or blocking work on it. This crate provides:
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | [`HashEngine`] | [`hash`] | Deterministic, cost-parameterized password hash |
//! | [`TaskOffloader`] | [`offload`] | Runs one hash per OS thread, delivers exactly one completion |
//! | [`WorkerThreadManager`] | [`worker`] | One persistent background thread with a periodic callback |
//! | [`CallbackBridge`] | [`bridge`] | Posts payloads from any thread onto the host context |
//! | [`NativeCore`] | [`surface`] | The call surface the host sees |
//!
//! Results computed off-thread are only ever observed on the host context,
//! during a host turn.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use threadhash::{CoreConfig, NativeCore};
//!
//! let core = NativeCore::new(CoreConfig::default()).unwrap();
//!
//! let sync = core.hash_password("password", "hash343454523f", 20).unwrap();
//! assert_eq!(sync, "bf0493bd6dd74fe968296a3aeb9fe5bd8468e51e2a260aa19cc9e03431db97ca");
//!
//! let pending = core.hash_password_async("password", "hash343454523f", 20);
//! let async_digest = core.wait(&pending, Duration::from_secs(30)).unwrap();
//! assert_eq!(sync, async_digest);
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod hash;
pub mod offload;
pub mod surface;
pub mod worker;

pub use bridge::{CallbackBridge, CallbackRef, Deliver, Delivery, HostContext, HostHandle};
pub use config::{CoreConfig, HashConfig, HostConfig, OffloadConfig, WorkerConfig};
pub use error::{BridgeError, Result};
pub use hash::{HashEngine, HashRequest, HashResult, StretchedSha256};
pub use offload::{benchmark_sync, Benchmark, Completion, OperationId, TaskOffloader};
pub use surface::{Eventual, NativeCore, OperationState, PendingOperation};
pub use worker::{sleep, sleep_ms, CallbackInvocation, CancelSignal, WorkerState, WorkerThreadManager};
