// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{Notify, broadcast},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, warn};

use crate::{error::RenewalError, providers::Store};

/// Background task that keeps extending the lease on a held key.
#[derive(Debug)]
pub(crate) struct Renewer {
    lease: Duration,
    holder: String,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Renewer {
    /// Extensions fire at two thirds of the lease so a live holder never
    /// lets it lapse.
    pub(crate) fn interval(lease: Duration) -> Duration {
        lease - lease / 3
    }

    /// Spawn the renewal task. The first extension fires after `first_tick`,
    /// then every [Renewer::interval].
    pub(crate) fn start<S: Store>(
        store: S,
        key: String,
        lease: Duration,
        holder: String,
        first_tick: Duration,
        errors: broadcast::Sender<RenewalError>,
    ) -> Self {
        let period = Self::interval(lease);
        let stop = Arc::new(Notify::new());

        debug!(%key, %holder, renew_ms = period.as_millis(), "starting lease renewer");

        let handle = tokio::spawn({
            let stop = Arc::clone(&stop);
            let holder = holder.clone();
            async move {
                let mut ticks = interval_at(Instant::now() + first_tick, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    select! {
                        biased;
                        _ = stop.notified() => break,
                        _ = ticks.tick() => {}
                    }

                    debug!(%key, %holder, lease_ms = lease.as_millis(), "renewing lease");
                    let failure = match store.extend(&key, lease).await {
                        Ok(true) => None,
                        Ok(false) => Some(RenewalError::LeaseLost {
                            key: key.clone(),
                            holder: holder.clone(),
                        }),
                        Err(error) => Some(RenewalError::Store {
                            key: key.clone(),
                            holder: holder.clone(),
                            message: error.to_string(),
                        }),
                    };

                    if let Some(failure) = failure {
                        warn!(%key, %holder, %failure, "lease renewal failed");
                        // Nobody listening is fine
                        let _ = errors.send(failure);
                    }
                }

                debug!(%key, %holder, "lease renewer stopped");
            }
        });

        Self {
            lease,
            holder,
            stop,
            handle,
        }
    }

    pub(crate) fn lease(&self) -> Duration {
        self.lease
    }

    pub(crate) fn holder(&self) -> &str {
        &self.holder
    }

    /// Signal the task and wait for it to finish. An extension already in
    /// flight completes before this returns.
    pub(crate) async fn stop(mut self) {
        self.stop.notify_one();
        // Only fails if the task panicked or was aborted, either way it is gone
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Renewer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
