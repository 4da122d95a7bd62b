//! Persistent message store: the record log, the in-flight index, the
//! dispatch cursor and the shared counters.
//!
//! One `Store` is shared by the manager, the reaper and the syncer; all
//! state lives behind a single mutex. Redelivery is driven by lazy expiry:
//! `is_in_flight` evicts entries older than the ack timeout at read time,
//! which makes the record eligible again with no per-message timer.

mod inflight;
mod key;
mod log;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

pub use key::{KeyError, RecordKey};

use crate::time::microsecond_timestamp;
use crate::transport::FrameError;
use inflight::InflightIndex;
use log::RecordLog;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("trying to save an empty message")]
    EmptyMessage,

    #[error("no record for key {key}")]
    KeyNotFound { key: String },

    #[error("store corrupt: {reason}")]
    Corrupt { reason: String },
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub path: PathBuf,
    /// Byte cap for the in-flight index.
    pub inflight_size: u64,
    /// Microseconds before an in-flight entry is considered stale.
    pub ack_timeout: u64,
    /// fsync on every sync.
    pub hard_sync: bool,
}

struct Inner {
    log: RecordLog,
    inflight: InflightIndex,
    cursor: Option<RecordKey>,
    ack_timeout: u64,
    hard_sync: bool,
    syncs: u64,
    expired: u64,
}

pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        let log = RecordLog::open(&options.path)?;
        let inflight_path = companion_path(&options.path);
        let inflight = InflightIndex::open(&inflight_path, options.inflight_size)?;

        tracing::info!("loaded {} messages from store", log.count());

        Ok(Self {
            inner: Mutex::new(Inner {
                log,
                inflight,
                cursor: None,
                ack_timeout: options.ack_timeout,
                hard_sync: options.hard_sync,
                syncs: 0,
                expired: 0,
            }),
        })
    }

    /// Persist a message. A replica write supplies the external key so the
    /// copy shares identity with the original across nodes; otherwise a
    /// fresh `timestamp|uuid` key is assigned.
    pub fn save(
        &self,
        payload: &[Bytes],
        external_key: Option<RecordKey>,
    ) -> Result<RecordKey, StoreError> {
        if payload.is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        let key = external_key.unwrap_or_else(RecordKey::generate);
        let value = crate::wire::encode_value(payload);

        let mut inner = self.lock();
        inner.log.put(&key, value)?;
        Ok(key)
    }

    /// Remove a record and its in-flight marker (positive consumer ack).
    pub fn remove(&self, key: &RecordKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.inflight.remove(key);
        if !inner.log.del(key)? {
            return Err(StoreError::KeyNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Remove only the log entry (a peer confirmed it holds the record).
    pub fn remove_replica_only(&self, key: &RecordKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.log.del(key)? {
            return Err(StoreError::KeyNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Clear the in-flight marker, leaving the record for redelivery
    /// (negative consumer ack).
    pub fn remove_inflight_only(&self, key: &RecordKey) {
        let mut inner = self.lock();
        inner.inflight.remove(key);
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.lock().log.contains(key)
    }

    /// True iff a fresh in-flight entry exists. A stale entry is evicted
    /// here and now, counted as expired, and reported absent; this lazy
    /// check is what makes an unacked message eligible for resend.
    pub fn is_in_flight(&self, key: &RecordKey) -> bool {
        let mut inner = self.lock();
        let Some(dispatched_at) = inner.inflight.get(key) else {
            return false;
        };
        let now = microsecond_timestamp();
        if now.saturating_sub(dispatched_at) > inner.ack_timeout {
            inner.inflight.remove(key);
            inner.note_expired(1);
            return false;
        }
        true
    }

    /// Record the dispatch timestamp. Capacity evictions make the evicted
    /// records immediately reconsiderable, so the cursor resets.
    pub fn mark_in_flight(&self, key: &RecordKey) {
        let mut inner = self.lock();
        let evicted = inner.inflight.insert(key, microsecond_timestamp());
        if !evicted.is_empty() {
            inner.cursor = None;
        }
    }

    /// Advance the cursor and return the next record, or `None` at the end
    /// of a pass (the cursor wraps to the start).
    pub fn next_record(&self) -> Option<(RecordKey, Bytes)> {
        let mut inner = self.lock();
        match inner.log.next_after(inner.cursor.as_ref()) {
            Some((key, value)) => {
                inner.cursor = Some(key.clone());
                Some((key, value))
            }
            None => {
                inner.cursor = None;
                None
            }
        }
    }

    pub fn reset_cursor(&self) {
        self.lock().cursor = None;
    }

    /// Coarse pending check: log non-empty and in-flight strictly below the
    /// log count. Replica records and not-yet-evicted stale entries make
    /// this over/under-count; acceptable, it only sizes the poll timeout.
    pub fn messages_pending(&self) -> bool {
        let inner = self.lock();
        let count = inner.log.count();
        count > 0 && inner.inflight.count() < count
    }

    /// Evict every in-flight entry older than the ack timeout (reaper path).
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut inner = self.lock();
        let timeout = inner.ack_timeout;
        let evicted = inner.inflight.sweep(now, timeout);
        if !evicted.is_empty() {
            for key in &evicted {
                tracing::debug!("in-flight entry expired: {key}");
            }
            inner.note_expired(evicted.len() as u64);
        }
        evicted.len()
    }

    /// Flush the log and snapshot the in-flight index.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let hard = inner.hard_sync;
        inner.log.sync(hard)?;
        inner.inflight.snapshot(hard)?;
        inner.syncs += 1;
        Ok(())
    }

    pub fn messages(&self) -> u64 {
        self.lock().log.count()
    }

    pub fn messages_in_flight(&self) -> u64 {
        self.lock().inflight.count()
    }

    pub fn db_size(&self) -> u64 {
        self.lock().log.byte_size()
    }

    pub fn inflight_db_size(&self) -> u64 {
        self.lock().inflight.byte_size()
    }

    pub fn num_syncs(&self) -> u64 {
        self.lock().syncs
    }

    pub fn num_expired(&self) -> u64 {
        self.lock().expired
    }

    pub fn ack_timeout(&self) -> u64 {
        self.lock().ack_timeout
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    /// Expired-count changes invalidate the cursor so freshly evicted
    /// records are reconsidered without waiting out a full pass.
    fn note_expired(&mut self, n: u64) {
        self.expired += n;
        self.cursor = None;
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let inner = self.lock();
        tracing::info!(
            "closing store, messages={} messages_inflight={}",
            inner.log.count(),
            inner.inflight.count()
        );
    }
}

fn companion_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".inflight");
    PathBuf::from(os)
}
