//! Integration tests for offloaded hashing.
//!
//! Checks sync/async equivalence, that results are only observed on host
//! turns, and that concurrent operations never receive each other's result.

mod helpers;

use std::time::Duration;

use proptest::prelude::*;
use threadhash::{BridgeError, CoreConfig, NativeCore, OperationState};

use helpers::{default_core, drive_until, fast_core, SALT, WAIT};

#[test]
fn test_async_matches_sync_golden() {
    let core = default_core();
    let pending = core.hash_password_async("password", SALT, 20);
    let digest = core.wait(&pending, WAIT).unwrap();
    assert_eq!(digest, core.hash_password("password", SALT, 20).unwrap());
}

#[test]
fn test_result_only_observed_on_host_turn() {
    let core = fast_core(10);
    let pending = core.hash_password_async("password", SALT, 1);

    // Give the offload thread ample time; without a host turn nothing settles.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pending.state(), OperationState::Pending);

    assert!(drive_until(&core, WAIT, || pending.is_settled()));
    assert!(matches!(pending.state(), OperationState::Completed(_)));
}

#[test]
fn test_concurrent_operations_resolve_independently() {
    let core = fast_core(10);
    let salts: Vec<String> = (0..16).map(|i| format!("salt-{i:04}-abcdef")).collect();

    let pending: Vec<_> = salts
        .iter()
        .map(|salt| core.hash_password_async("password", salt, 2))
        .collect();
    assert_eq!(core.pending_operations(), salts.len());

    for (salt, eventual) in salts.iter().zip(pending) {
        let digest = core.wait(&eventual, WAIT).unwrap();
        assert_eq!(digest, core.hash_password("password", salt, 2).unwrap(), "salt {salt}");
    }
    assert_eq!(core.pending_operations(), 0);
}

#[test]
fn test_async_invalid_input_fails() {
    let core = fast_core(10);
    let pending = core.hash_password_async("password", "tiny", 1);
    assert!(matches!(core.wait(&pending, WAIT), Err(BridgeError::InvalidInput(_))));
}

#[test]
fn test_in_flight_limit_fails_excess_operations() {
    let mut config = CoreConfig::default();
    config.offload.max_in_flight = 1;
    let core = NativeCore::new(config).unwrap();

    // The first job is slow enough to still be running when the rest arrive.
    let slow = core.hash_password_async("password", SALT, 400);
    let rejected = core.hash_password_async("password", SALT, 1);

    assert!(matches!(core.wait(&rejected, WAIT), Err(BridgeError::ResourceUnavailable(_))));
    assert!(core.wait(&slow, WAIT).is_ok());
}

#[test]
fn test_bounded_queue_still_settles_every_operation() {
    let mut config = CoreConfig::default();
    config.hash.rounds_per_cost = 8;
    config.host.queue_capacity = Some(1);
    let core = NativeCore::new(config).unwrap();

    let salts = ["salt-aaaa-0001", "salt-bbbb-0002", "salt-cccc-0003"];
    let pending: Vec<_> = salts
        .iter()
        .map(|salt| core.hash_password_async("password", salt, 1))
        .collect();

    // Every job finishes while the host is not draining.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(core.host().pending_deliveries(), salts.len());

    for (salt, eventual) in salts.iter().zip(&pending) {
        let digest = core.wait(eventual, WAIT).unwrap();
        assert_eq!(digest, core.hash_password("password", salt, 1).unwrap());
    }
    assert_eq!(core.pending_operations(), 0);
}

#[test]
fn test_wait_keeps_result_after_unrelated_callback_error() {
    let core = fast_core(10);
    core.start_worker(|_, counter| anyhow::bail!("tick {counter} rejected"))
        .unwrap();
    assert!(drive_until_queued(&core));

    let pending = core.hash_password_async("password", SALT, 1);
    let first = core.wait(&pending, WAIT);
    assert!(matches!(first, Err(BridgeError::HostCallback(_))), "got {first:?}");

    // The same handle can be waited on again until it settles.
    let mut digest = None;
    for _ in 0..1000 {
        match core.wait(&pending, WAIT) {
            Ok(value) => {
                digest = Some(value);
                break;
            }
            Err(BridgeError::HostCallback(_)) => continue,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    core.stop_worker();
    assert_eq!(digest.unwrap(), core.hash_password("password", SALT, 1).unwrap());
    assert_eq!(core.pending_operations(), 0);
}

fn drive_until_queued(core: &NativeCore) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while core.host().pending_deliveries() == 0 {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn test_benchmark_sync_is_a_passthrough() {
    let core = fast_core(10);
    let thread = std::thread::current().id();
    let bench = core.benchmark_sync(|| (std::thread::current().id(), "value"));
    assert_eq!(bench.value, (thread, "value"));
    assert!(bench.elapsed_ms() >= 0.0);

    let failing = core.benchmark_sync(|| core.hash_password("pw", SALT, 0));
    assert!(failing.value.is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // Property: the offloaded digest equals the inline digest
    #[test]
    fn test_async_equals_sync(
        password in "[a-zA-Z0-9]{1,16}",
        salt in "[a-zA-Z0-9]{8,16}",
        cost in 1i64..4
    ) {
        let core = fast_core(10);
        let sync = core.hash_password(&password, &salt, cost).unwrap();
        let pending = core.hash_password_async(&password, &salt, cost);
        prop_assert_eq!(core.wait(&pending, WAIT).unwrap(), sync);
    }
}
