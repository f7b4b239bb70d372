//! Lease-based distributed locks, used by the migration executor and
//! projection rebuilds for mutual exclusion across writers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{codes, ErrorCode};

/// Initial time-to-live of a freshly acquired lease. Renewal is the
/// caller's responsibility.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// All possible error types returned by lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lease is currently held by another owner.
    #[error("lock {key} is held by another owner")]
    AlreadyHeld { key: String },

    /// Transient I/O failure while talking to the lease backend.
    #[error("lock backend failed while processing {key}: {source}")]
    Processing {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ErrorCode for LockError {
    fn error_code(&self) -> &'static str {
        match self {
            LockError::AlreadyHeld { .. } => codes::CONCURRENCY_CONFLICT,
            LockError::Processing { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// A held lease.
///
/// Losing the lease is not an error: `renew` and `is_valid` report it as
/// `false` so callers can abandon their critical section cleanly.
/// `release` is idempotent; releasing a lease that has already expired
/// or been taken over is treated as already released.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// The key this lease guards.
    fn lock_key(&self) -> &str;

    /// Unique identifier of this acquisition.
    fn lock_id(&self) -> &str;

    /// When the lease was acquired.
    fn acquired_at(&self) -> DateTime<Utc>;

    /// When the lease expires unless renewed.
    fn expires_at(&self) -> DateTime<Utc>;

    /// Extends the lease by the given TTL. Returns `false` when the
    /// lease was lost in the meantime.
    async fn renew(&mut self, ttl: Duration) -> Result<bool, LockError>;

    /// Whether the lease is still held: a wall-clock check combined
    /// with a renew round-trip.
    async fn is_valid(&mut self) -> Result<bool, LockError> {
        if Utc::now() >= self.expires_at() {
            return Ok(false);
        }

        self.renew(DEFAULT_LEASE_TTL).await
    }

    /// Releases the lease. Idempotent; an already-released or taken-over
    /// lease is not an error.
    async fn release(&mut self) -> Result<(), LockError>;
}

/// Acquires [DistributedLock]s from a backend-native lease mechanism.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquires the lease on `key`, or fails with
    /// [LockError::AlreadyHeld] when another owner holds it.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError>;
}
