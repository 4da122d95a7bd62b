//! Capacity-bounded in-flight index: `key -> dispatch timestamp`.
//!
//! Presence does not guarantee freshness; callers treat entries older than
//! the ack timeout as absent. The byte cap evicts oldest entries first. The
//! index persists as a whole-file snapshot rewritten on sync (it is small by
//! construction).

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::key::RecordKey;
use super::StoreError;
use crate::transport::frame::{FrameReader, FrameWriter};
use crate::transport::MAX_FRAME_BYTES;

pub struct InflightIndex {
    path: PathBuf,
    entries: HashMap<RecordKey, u64>,
    by_age: BTreeSet<(u64, RecordKey)>,
    bytes: u64,
    cap_bytes: u64,
}

fn entry_cost(key: &RecordKey) -> u64 {
    key.to_string().len() as u64 + 8
}

impl InflightIndex {
    pub fn open(path: &Path, cap_bytes: u64) -> Result<Self, StoreError> {
        let mut index = Self {
            path: path.to_path_buf(),
            entries: HashMap::new(),
            by_age: BTreeSet::new(),
            bytes: 0,
            cap_bytes,
        };
        index.load()?;
        Ok(index)
    }

    /// Record a dispatch timestamp. Returns the keys evicted to stay under
    /// the byte cap, oldest first.
    pub fn insert(&mut self, key: &RecordKey, timestamp: u64) -> Vec<RecordKey> {
        if let Some(old) = self.entries.insert(key.clone(), timestamp) {
            self.by_age.remove(&(old, key.clone()));
        } else {
            self.bytes += entry_cost(key);
        }
        self.by_age.insert((timestamp, key.clone()));

        let mut evicted = Vec::new();
        while self.bytes > self.cap_bytes && self.entries.len() > 1 {
            let Some((_, oldest)) = self.by_age.iter().next().cloned() else {
                break;
            };
            if oldest == *key {
                break;
            }
            self.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn get(&self, key: &RecordKey) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn remove(&mut self, key: &RecordKey) -> bool {
        match self.entries.remove(key) {
            Some(ts) => {
                self.by_age.remove(&(ts, key.clone()));
                self.bytes = self.bytes.saturating_sub(entry_cost(key));
                true
            }
            None => false,
        }
    }

    /// Evict every entry older than `timeout` relative to `now`; returns the
    /// evicted keys.
    pub fn sweep(&mut self, now: u64, timeout: u64) -> Vec<RecordKey> {
        let mut evicted = Vec::new();
        while let Some((ts, key)) = self.by_age.iter().next().cloned() {
            if now.saturating_sub(ts) <= timeout {
                break;
            }
            self.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes
    }

    /// Rewrite the snapshot file. Crash between snapshots only loses
    /// in-flight markers, which redeliver by design.
    pub fn snapshot(&self, hard: bool) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("inflight.tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            {
                let mut framed = FrameWriter::new(&mut writer, MAX_FRAME_BYTES);
                for (key, ts) in &self.entries {
                    let key_text = key.to_string();
                    let mut body = Vec::with_capacity(8 + key_text.len());
                    body.extend_from_slice(&ts.to_le_bytes());
                    body.extend_from_slice(key_text.as_bytes());
                    framed.write_frame(&body)?;
                }
            }
            writer.flush()?;
            if hard {
                writer.get_ref().sync_data()?;
            }
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = FrameReader::new(BufReader::new(file), MAX_FRAME_BYTES);
        loop {
            let body = match reader.read_next() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("in-flight snapshot damaged, dropping remainder: {e}");
                    break;
                }
            };
            if body.len() < 9 {
                continue;
            }
            let mut ts_buf = [0u8; 8];
            ts_buf.copy_from_slice(&body[..8]);
            let ts = u64::from_le_bytes(ts_buf);
            let Ok(key_text) = std::str::from_utf8(&body[8..]) else {
                continue;
            };
            let Ok(key) = key_text.parse::<RecordKey>() else {
                continue;
            };
            self.insert(&key, ts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(ts: u64, suffix: &str) -> RecordKey {
        RecordKey::from_parts(ts, suffix)
    }

    fn open(dir: &TempDir, cap: u64) -> InflightIndex {
        InflightIndex::open(&dir.path().join("broker.inflight"), cap).unwrap()
    }

    #[test]
    fn insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir, 1 << 20);
        let k = key(1, "a");
        assert!(index.insert(&k, 100).is_empty());
        assert_eq!(index.get(&k), Some(100));
        assert!(index.remove(&k));
        assert!(!index.remove(&k));
        assert_eq!(index.count(), 0);
        assert_eq!(index.byte_size(), 0);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        // Room for roughly two entries.
        let cost = entry_cost(&key(1, "aaaa"));
        let mut index = open(&dir, cost * 2);

        assert!(index.insert(&key(1, "aaaa"), 10).is_empty());
        assert!(index.insert(&key(2, "bbbb"), 20).is_empty());
        let evicted = index.insert(&key(3, "cccc"), 30);
        assert_eq!(evicted, vec![key(1, "aaaa")]);
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir, 1 << 20);
        index.insert(&key(1, "old"), 100);
        index.insert(&key(2, "new"), 900);

        let evicted = index.sweep(1000, 500);
        assert_eq!(evicted, vec![key(1, "old")]);
        assert_eq!(index.get(&key(2, "new")), Some(900));
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = open(&dir, 1 << 20);
            index.insert(&key(1, "a"), 111);
            index.insert(&key(2, "b"), 222);
            index.snapshot(false).unwrap();
        }
        let index = open(&dir, 1 << 20);
        assert_eq!(index.count(), 2);
        assert_eq!(index.get(&key(1, "a")), Some(111));
    }
}
