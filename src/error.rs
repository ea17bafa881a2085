// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{error::Error, time::Duration};

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum RedilockError {
    #[error("store error: {0}")]
    StoreError(Box<dyn Error + Send + Sync>),

    #[error("{holder}: lock retried {limit} times, giving up")]
    RetryLimitExceeded { holder: String, limit: u64 },

    #[error("maximum retry count cannot be less than -1, got {0}")]
    InvalidMaxRetryCount(i64),

    #[error("lease duration must be at least one millisecond, got {0:?}")]
    InvalidLeaseDuration(Duration),

    #[error("lock {key} is not held by {holder}")]
    NotHolder { key: String, holder: String },

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RedilockError {
    fn from(error: redis::RedisError) -> Self {
        RedilockError::StoreError(Box::new(error))
    }
}

/// Failure observed by the background lease renewer.
///
/// These never surface through [Redilock::lock](crate::Redilock::lock); they
/// are published on [Redilock::renewal_errors](crate::Redilock::renewal_errors).
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("renewing {key} for {holder} failed: {message}")]
    Store {
        key: String,
        holder: String,
        message: String,
    },

    #[error("lease on {key} for {holder} was lost before renewal")]
    LeaseLost { key: String, holder: String },
}
