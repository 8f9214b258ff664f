//! Cost-parameterized password hashing.
//!
//! [`HashEngine`] is the pluggable seam: the rest of the core only needs a
//! deterministic `compute(password, salt, cost) -> digest`. The default
//! engine, [`StretchedSha256`], is an iterated SHA-256 key-strengthening loop
//! whose running time grows linearly with `cost`.
//!
//! # Construction
//!
//! ```text
//! rounds  = cost * rounds_per_cost
//! block_i = SHA-256(salt || password || be32(i))          i = 1, 2, ...
//! repeat rounds - 1 times:
//!     block_i = SHA-256(block_i || password || salt)
//! digest  = (block_1 || block_2 || ...)[..digest_len]
//! ```
//!
//! The digest is rendered as lower-case hex on the call surface.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::config::HashConfig;
use crate::error::{BridgeError, Result};

const BLOCK_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// One hashing job. Immutable once built; consumed by a [`HashEngine`].
#[derive(Clone, PartialEq, Eq)]
pub struct HashRequest {
    password: Vec<u8>,
    salt: Vec<u8>,
    cost: u32,
}

impl HashRequest {
    /// Build a request, rejecting a non-positive or oversized cost.
    ///
    /// The cost is taken as `i64` because hosts hand integers over untyped.
    pub fn new(password: impl Into<Vec<u8>>, salt: impl Into<Vec<u8>>, cost: i64) -> Result<Self> {
        if cost <= 0 {
            return Err(BridgeError::invalid(format!("cost must be positive, got {cost}")));
        }
        let cost = u32::try_from(cost)
            .map_err(|_| BridgeError::invalid(format!("cost {cost} does not fit in 32 bits")))?;
        Ok(Self {
            password: password.into(),
            salt: salt.into(),
            cost,
        })
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }
}

// Keeps the password out of logs.
impl fmt::Debug for HashRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRequest")
            .field("password", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .field("cost", &self.cost)
            .finish()
    }
}

/// The digest produced for one [`HashRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashResult {
    digest: Vec<u8>,
}

impl HashResult {
    pub fn from_bytes(digest: Vec<u8>) -> Self {
        Self { digest }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Lower-case hex rendering, as returned to the host.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.digest
    }
}

impl fmt::Display for HashResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// A deterministic, CPU-bound password hash.
///
/// Implementations must be pure: the same request always yields the same
/// digest, and the only side effect is the time spent computing it.
pub trait HashEngine: Send + Sync {
    /// Compute the digest for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidInput`] when the request violates the
    /// engine's parameter constraints.
    fn compute(&self, request: &HashRequest) -> Result<HashResult>;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Iterated SHA-256
// ---------------------------------------------------------------------------

/// Iterated SHA-256 key strengthening. See the module docs for the exact
/// construction.
#[derive(Debug, Clone)]
pub struct StretchedSha256 {
    config: HashConfig,
}

impl StretchedSha256 {
    /// Build an engine from a validated configuration.
    pub fn new(config: HashConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HashConfig {
        &self.config
    }

    fn check(&self, request: &HashRequest) -> Result<()> {
        if request.password.is_empty() {
            return Err(BridgeError::invalid("password must not be empty"));
        }
        let min_salt = self.config.min_salt_len.max(1);
        if request.salt.len() < min_salt {
            return Err(BridgeError::invalid(format!(
                "salt must be at least {min_salt} bytes, got {}",
                request.salt.len()
            )));
        }
        if request.cost > self.config.max_cost {
            return Err(BridgeError::invalid(format!(
                "cost {} exceeds maximum {}",
                request.cost, self.config.max_cost
            )));
        }
        Ok(())
    }

    fn block(&self, request: &HashRequest, index: u32, rounds: u64) -> [u8; BLOCK_LEN] {
        let mut state = Sha256::new()
            .chain_update(&request.salt)
            .chain_update(&request.password)
            .chain_update(index.to_be_bytes())
            .finalize();
        for _ in 1..rounds {
            state = Sha256::new()
                .chain_update(state)
                .chain_update(&request.password)
                .chain_update(&request.salt)
                .finalize();
        }
        state.into()
    }
}

impl Default for StretchedSha256 {
    fn default() -> Self {
        Self {
            config: HashConfig::default(),
        }
    }
}

impl HashEngine for StretchedSha256 {
    fn compute(&self, request: &HashRequest) -> Result<HashResult> {
        self.check(request)?;

        let rounds = u64::from(request.cost) * u64::from(self.config.rounds_per_cost);
        let blocks = self.config.digest_len.div_ceil(BLOCK_LEN);
        let mut digest = Vec::with_capacity(blocks * BLOCK_LEN);
        for index in 1..=blocks as u32 {
            digest.extend_from_slice(&self.block(request, index, rounds));
        }
        digest.truncate(self.config.digest_len);

        Ok(HashResult::from_bytes(digest))
    }

    fn name(&self) -> &'static str {
        "stretched-sha256"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
