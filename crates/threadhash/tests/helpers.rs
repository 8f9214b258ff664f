//! Shared helpers for the threadhash integration test suite.
//!
//! Builds cores with short worker cadences and cheap hash settings so the
//! end-to-end tests stay fast, plus host-turn driving utilities and a
//! test log subscriber.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use threadhash::{CoreConfig, NativeCore, WorkerConfig};

/// The salt used by the golden-value checks.
pub const SALT: &str = "hash343454523f";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(30);

/// Route the core's `tracing` output through the test harness, filtered by
/// `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A core with a cheap hash and a worker ticking every `interval_ms`.
pub fn fast_core(interval_ms: u64) -> NativeCore {
    init_tracing();
    let mut config = CoreConfig::default();
    config.hash.rounds_per_cost = 8;
    config.worker = WorkerConfig {
        interval_ms,
        ..WorkerConfig::default()
    };
    NativeCore::new(config).unwrap()
}

/// A core with the default configuration.
pub fn default_core() -> NativeCore {
    init_tracing();
    NativeCore::new(CoreConfig::default()).unwrap()
}

/// Drive host turns until `done` returns true or `timeout` passes.
/// Returns whether `done` was satisfied.
pub fn drive_until(core: &NativeCore, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        core.turn((deadline - now).min(Duration::from_millis(50))).unwrap();
    }
    true
}
