//! Background sweep of expired in-flight entries.
//!
//! Expiry is also detected lazily on read, so the sweep only bounds how
//! long a dead entry can linger in the index between dispatch passes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::broker::shutdown::Shutdown;
use crate::store::Store;
use crate::time::microsecond_timestamp;

/// Sleep granularity while waiting out an interval, so shutdown is prompt.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub struct Reaper {
    store: Arc<Store>,
    /// Microseconds between sweeps.
    frequency: u64,
    shutdown: Shutdown,
}

impl Reaper {
    pub fn new(store: Arc<Store>, frequency: u64, shutdown: Shutdown) -> Self {
        Self {
            store,
            frequency,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || self.run())
            .expect("spawn reaper thread")
    }

    fn run(self) {
        tracing::debug!(frequency = self.frequency, "reaper running");
        while !self.shutdown.is_cancelled() {
            let expired = self.store.sweep_expired(microsecond_timestamp());
            if expired > 0 {
                tracing::info!(expired, "swept expired in-flight entries");
            }
            sleep_interval(&self.shutdown, self.frequency);
        }
        tracing::debug!("reaper stopped");
    }
}

/// Sleep roughly `micros`, waking early on shutdown.
pub(crate) fn sleep_interval(shutdown: &Shutdown, micros: u64) {
    let mut remaining = Duration::from_micros(micros);
    while !remaining.is_zero() && !shutdown.is_cancelled() {
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}
