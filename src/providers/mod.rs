// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{future::Future, time::Duration};

use crate::error::RedilockError;

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

/// Outcome of a single run of the acquisition script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The key did not exist and now holds the caller with a fresh lease.
    Acquired,
    /// The caller already held the key; its reentrancy count was incremented.
    Reentered,
    /// Someone else holds the key for roughly `remaining` more.
    HeldElsewhere { remaining: Duration },
}

/// Outcome of a holder-checked release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The last reentrant hold was dropped and the key deleted.
    Released,
    /// The caller still holds the key `remaining` times.
    Decremented { remaining: u64 },
    /// The caller does not hold the key.
    NotHeld,
}

/// `Store` is a trait that abstracts the backend specific details of the
/// shared key-value store the lock lives in.
///
/// Every method must behave atomically with respect to other clients of the
/// same store. Implementations are cloned into the background renewer, so
/// they should be cheap handles over a shared connection.
pub trait Store: Clone + Send + Sync + 'static {
    /// Check that the store is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), RedilockError>> + Send;

    /// Run the acquisition protocol for `holder` on `key`.
    fn acquire(
        &self,
        key: &str,
        lease: Duration,
        holder: &str,
    ) -> impl Future<Output = Result<Acquisition, RedilockError>> + Send;

    /// Reset the time-to-live of `key` to `lease`, returning whether the key
    /// still existed.
    fn extend(
        &self,
        key: &str,
        lease: Duration,
    ) -> impl Future<Output = Result<bool, RedilockError>> + Send;

    /// Delete `key` regardless of who holds it.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), RedilockError>> + Send;

    /// Drop one reentrant hold of `holder`, deleting `key` once none remain.
    fn release(
        &self,
        key: &str,
        holder: &str,
    ) -> impl Future<Output = Result<Release, RedilockError>> + Send;
}
