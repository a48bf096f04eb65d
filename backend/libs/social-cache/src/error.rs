//! Cache error types

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Network failure or timeout talking to the backing store.
    #[error("Store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// Malformed cache key. This is a caller bug and is never downgraded.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The source of truth failed while recomputing a missed value.
    #[error("Primary store error: {0:#}")]
    Primary(anyhow::Error),
}

impl CacheError {
    pub fn unavailable(operation: &'static str, reason: impl ToString) -> Self {
        CacheError::StoreUnavailable {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn timed_out(operation: &'static str, after: Duration) -> Self {
        CacheError::StoreUnavailable {
            operation,
            reason: format!("timed out after {:?}", after),
        }
    }

    /// Whether the facade may treat this error as a cache miss.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::StoreUnavailable { .. } | CacheError::Serialization(_)
        )
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::unavailable("redis", err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
