//! Configuration types for the native core.
//!
//! Provides tuning knobs for the hash engine, the offload threads, the
//! background worker and the host delivery queue, plus the top-level
//! [`CoreConfig`] that bundles them together.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Largest digest the hash engine will produce, in bytes.
pub const MAX_DIGEST_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// Hash configuration
// ---------------------------------------------------------------------------

/// Parameters of the key-strengthening hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Length of the produced digest in bytes (`1..=1024`).
    pub digest_len: usize,
    /// Mixing rounds per unit of cost.
    pub rounds_per_cost: u32,
    /// Shortest accepted salt in bytes. Zero still rejects an empty salt.
    pub min_salt_len: usize,
    /// Highest accepted cost.
    pub max_cost: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            digest_len: 32,
            rounds_per_cost: 1024,
            min_salt_len: 8,
            max_cost: 1 << 20,
        }
    }
}

impl HashConfig {
    /// Check that every field is inside its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.digest_len == 0 || self.digest_len > MAX_DIGEST_LEN {
            return Err(BridgeError::Config(format!(
                "digest_len must be between 1 and {MAX_DIGEST_LEN} bytes, got {}",
                self.digest_len
            )));
        }
        if self.rounds_per_cost == 0 {
            return Err(BridgeError::Config("rounds_per_cost must be at least 1".into()));
        }
        if self.max_cost == 0 {
            return Err(BridgeError::Config("max_cost must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Offload configuration
// ---------------------------------------------------------------------------

/// Limits for the transient offload threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Maximum number of offloaded operations running at once.
    pub max_in_flight: usize,
    /// Name given to each offload thread.
    pub thread_name: String,
    /// Stack size for offload threads; the platform default when `None`.
    pub stack_size: Option<usize>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            thread_name: "threadhash-offload".to_string(),
            stack_size: None,
        }
    }
}

impl OffloadConfig {
    /// Check that every field is inside its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(BridgeError::Config("max_in_flight must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker configuration
// ---------------------------------------------------------------------------

/// Cadence and payload of the background worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Milliseconds between two callback invocations.
    pub interval_ms: u64,
    /// Message sent with every invocation.
    pub message: String,
    /// Name of the background thread.
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            message: "Tick".to_string(),
            thread_name: "threadhash-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Check that every field is inside its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(BridgeError::Config("interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    /// The cadence as a [`std::time::Duration`].
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Host configuration
// ---------------------------------------------------------------------------

/// Delivery queue settings of a host context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum pending deliveries; unbounded when `None`.
    pub queue_capacity: Option<usize>,
}

impl HostConfig {
    /// Check that every field is inside its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(BridgeError::Config("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Top-level configuration
// ---------------------------------------------------------------------------

/// Aggregated configuration for the whole core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub hash: HashConfig,
    pub offload: OffloadConfig,
    pub worker: WorkerConfig,
    pub host: HostConfig,
}

impl CoreConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.hash.validate()?;
        self.offload.validate()?;
        self.worker.validate()?;
        self.host.validate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CoreConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.hash.digest_len, 32);
        assert_eq!(cfg.worker.interval_ms, 1000);
        assert_eq!(cfg.worker.message, "Tick");
        assert_eq!(cfg.host.queue_capacity, None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = CoreConfig::from_json_str(r#"{ "worker": { "interval_ms": 25 } }"#).unwrap();
        assert_eq!(cfg.worker.interval_ms, 25);
        assert_eq!(cfg.worker.message, "Tick");
        assert_eq!(cfg.hash, HashConfig::default());
    }

    #[test]
    fn test_rejects_out_of_range_digest() {
        let err = CoreConfig::from_json_str(r#"{ "hash": { "digest_len": 2048 } }"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = CoreConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_interval_and_capacity() {
        let mut cfg = CoreConfig::default();
        cfg.worker.interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CoreConfig::default();
        cfg.host.queue_capacity = Some(0);
        assert!(cfg.validate().is_err());
    }
}
