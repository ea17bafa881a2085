// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! In-process [Store] with the same semantics as the Redis scripts.
//!
//! Expiry is measured on the tokio clock, so tests running with a paused
//! runtime can move time forward deterministically.

use std::{
    collections::{HashMap, hash_map},
    io,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    error::RedilockError,
    providers::{Acquisition, Release, Store},
};

#[derive(Debug)]
struct Record {
    holders: HashMap<String, u64>,
    expires_at: Option<Instant>,
}

impl Record {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, Record>>,
    unavailable: AtomicBool,
    acquire_calls: AtomicUsize,
}

/// [Store] kept in process memory, shared between clones.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again) as if the
    /// store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of times the acquisition protocol has run.
    pub fn acquire_calls(&self) -> usize {
        self.inner.acquire_calls.load(Ordering::SeqCst)
    }

    /// Current holders of `key` and their reentrancy counts.
    pub fn holders(&self, key: &str) -> Option<HashMap<String, u64>> {
        self.entries().get(key).map(|entry| entry.holders.clone())
    }

    /// Remaining time-to-live of `key`, `None` if it does not exist or has no
    /// expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries()
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Store `holder` on `key` without an expiry, bypassing the protocol.
    pub fn insert_without_expiry(&self, key: &str, holder: &str) {
        self.entries().insert(
            key.to_string(),
            Record {
                holders: HashMap::from([(holder.to_string(), 1)]),
                expires_at: None,
            },
        );
    }

    /// Lock the map, evicting expired keys first.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
        entries
    }

    fn check_available(&self) -> Result<(), RedilockError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(RedilockError::StoreError(Box::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory store is unavailable",
            ))));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), RedilockError> {
        self.check_available()
    }

    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        holder: &str,
    ) -> Result<Acquisition, RedilockError> {
        self.check_available()?;
        self.inner.acquire_calls.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut entries = self.entries();
        let entry = match entries.entry(key.to_string()) {
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Record {
                    holders: HashMap::from([(holder.to_string(), 1)]),
                    expires_at: Some(now + lease),
                });
                return Ok(Acquisition::Acquired);
            }
            hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
        };

        if let Some(count) = entry.holders.get_mut(holder) {
            *count += 1;
            return Ok(Acquisition::Reentered);
        }

        let remaining = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default();
        Ok(Acquisition::HeldElsewhere { remaining })
    }

    async fn extend(&self, key: &str, lease: Duration) -> Result<bool, RedilockError> {
        self.check_available()?;

        let mut entries = self.entries();
        Ok(match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + lease);
                true
            }
            None => false,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), RedilockError> {
        self.check_available()?;
        self.entries().remove(key);
        Ok(())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<Release, RedilockError> {
        self.check_available()?;

        let mut entries = self.entries();
        let Some(count) = entries
            .get_mut(key)
            .and_then(|entry| entry.holders.get_mut(holder))
        else {
            return Ok(Release::NotHeld);
        };

        *count -= 1;
        if *count > 0 {
            return Ok(Release::Decremented { remaining: *count });
        }

        entries.remove(key);
        Ok(Release::Released)
    }
}
