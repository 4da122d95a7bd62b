//! Periodic store flush. With hard sync enabled each flush fsyncs the log
//! and rewrites the in-flight snapshot; otherwise it is a buffered flush.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::broker::reaper::sleep_interval;
use crate::broker::shutdown::Shutdown;
use crate::store::Store;

pub struct Syncer {
    store: Arc<Store>,
    /// Microseconds between flushes.
    frequency: u64,
    shutdown: Shutdown,
}

impl Syncer {
    pub fn new(store: Arc<Store>, frequency: u64, shutdown: Shutdown) -> Self {
        Self {
            store,
            frequency,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("syncer".to_string())
            .spawn(move || self.run())
            .expect("spawn syncer thread")
    }

    fn run(self) {
        tracing::debug!(frequency = self.frequency, "syncer running");
        while !self.shutdown.is_cancelled() {
            sleep_interval(&self.shutdown, self.frequency);
            if let Err(e) = self.store.sync() {
                tracing::error!("store sync failed: {e}");
            }
        }
        // One final flush so a clean shutdown loses nothing buffered.
        if let Err(e) = self.store.sync() {
            tracing::error!("final store sync failed: {e}");
        }
        tracing::debug!("syncer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn syncer_counts_flushes_and_stops() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            Store::open(StoreOptions {
                path: dir.path().join("broker.log"),
                inflight_size: 1 << 20,
                ack_timeout: 5_000_000,
                hard_sync: true,
            })
            .unwrap(),
        );
        store.save(&[Bytes::from_static(b"m")], None).unwrap();

        let shutdown = Shutdown::new();
        let handle = Syncer::new(Arc::clone(&store), 1_000, shutdown.clone()).spawn();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.num_syncs() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(store.num_syncs() > 0);

        shutdown.cancel();
        handle.join().unwrap();
    }
}
