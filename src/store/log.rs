//! Append-only record log with crc-framed entries.
//!
//! Each entry is one crc32c frame: `op(Put|Del)` + `u32 key_len` + key text +
//! encoded value. The whole file is replayed at open into an ordered map; a
//! torn tail (crc or truncation failure) drops only the damaged entry and
//! everything after it. Tombstone garbage is rewritten away at open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::key::RecordKey;
use super::StoreError;
use crate::transport::frame::{FrameReader, FrameWriter, FRAME_HEADER_LEN};
use crate::transport::MAX_FRAME_BYTES;

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

pub struct RecordLog {
    path: PathBuf,
    writer: BufWriter<File>,
    map: BTreeMap<RecordKey, Bytes>,
    file_bytes: u64,
    tombstones: u64,
}

impl RecordLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let (map, tombstones, valid_len) = replay(path)?;

        // A torn tail must not sit between old and new entries; cut it off
        // before appending.
        let file_len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if file_len > valid_len {
            tracing::warn!(
                "truncating record log from {file_len} to {valid_len} bytes (torn tail)"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
        }

        let mut log = Self {
            path: path.to_path_buf(),
            writer: open_append(path)?,
            map,
            file_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            tombstones,
        };

        if log.tombstones > 0 {
            log.compact()?;
        }
        Ok(log)
    }

    pub fn put(&mut self, key: &RecordKey, value: Bytes) -> Result<(), StoreError> {
        let written = self.append_entry(OP_PUT, key, &value)?;
        self.file_bytes += written as u64;
        self.map.insert(key.clone(), value);
        Ok(())
    }

    /// Delete a record. Returns false (and writes nothing) when absent.
    pub fn del(&mut self, key: &RecordKey) -> Result<bool, StoreError> {
        if self.map.remove(key).is_none() {
            return Ok(false);
        }
        let written = self.append_entry(OP_DEL, key, &Bytes::new())?;
        self.file_bytes += written as u64;
        self.tombstones += 1;
        Ok(true)
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Bytes> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.map.contains_key(key)
    }

    /// First entry strictly after `cursor`, or the first entry overall.
    pub fn next_after(&self, cursor: Option<&RecordKey>) -> Option<(RecordKey, Bytes)> {
        let mut range = match cursor {
            Some(cursor) => self
                .map
                .range::<RecordKey, _>((Bound::Excluded(cursor.clone()), Bound::Unbounded)),
            None => self.map.range::<RecordKey, _>(..),
        };
        range.next().map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn count(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.file_bytes
    }

    pub fn sync(&mut self, hard: bool) -> Result<(), StoreError> {
        self.writer.flush()?;
        if hard {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn append_entry(&mut self, op: u8, key: &RecordKey, value: &[u8]) -> Result<usize, StoreError> {
        let key_text = key.to_string();
        let mut body = Vec::with_capacity(1 + 4 + key_text.len() + value.len());
        body.push(op);
        body.extend_from_slice(&(key_text.len() as u32).to_le_bytes());
        body.extend_from_slice(key_text.as_bytes());
        body.extend_from_slice(value);

        let mut framed = FrameWriter::new(&mut self.writer, MAX_FRAME_BYTES);
        Ok(framed.write_frame(&body)?)
    }

    /// Rewrite the file with only live entries. Runs at open; the log is
    /// otherwise append-only.
    fn compact(&mut self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("compact");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            {
                let mut framed = FrameWriter::new(&mut writer, MAX_FRAME_BYTES);
                for (key, value) in &self.map {
                    let key_text = key.to_string();
                    let mut body = Vec::with_capacity(1 + 4 + key_text.len() + value.len());
                    body.push(OP_PUT);
                    body.extend_from_slice(&(key_text.len() as u32).to_le_bytes());
                    body.extend_from_slice(key_text.as_bytes());
                    body.extend_from_slice(value);
                    framed.write_frame(&body)?;
                }
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        self.writer = open_append(&self.path)?;
        self.file_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.tombstones = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>, StoreError> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn replay(path: &Path) -> Result<(BTreeMap<RecordKey, Bytes>, u64, u64), StoreError> {
    let mut map = BTreeMap::new();
    let mut tombstones = 0u64;
    let mut valid_len = 0u64;

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((map, 0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut reader = FrameReader::new(BufReader::new(file), MAX_FRAME_BYTES);
    loop {
        let body = match reader.read_next() {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("record log tail damaged, dropping remainder: {e}");
                break;
            }
        };
        valid_len += (FRAME_HEADER_LEN + body.len()) as u64;
        match decode_entry(&body) {
            Ok((OP_PUT, key, value)) => {
                map.insert(key, value);
            }
            Ok((OP_DEL, key, _)) => {
                map.remove(&key);
                tombstones += 1;
            }
            Ok((op, ..)) => {
                tracing::warn!("record log entry with unknown op {op}, skipping");
            }
            Err(e) => {
                tracing::warn!("record log entry undecodable, skipping: {e}");
            }
        }
    }
    Ok((map, tombstones, valid_len))
}

fn decode_entry(body: &[u8]) -> Result<(u8, RecordKey, Bytes), StoreError> {
    if body.len() < 5 {
        return Err(StoreError::Corrupt {
            reason: "entry shorter than header".to_string(),
        });
    }
    let op = body[0];
    let key_len = u32::from_le_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if body.len() - 5 < key_len {
        return Err(StoreError::Corrupt {
            reason: "entry key truncated".to_string(),
        });
    }
    let key_text =
        std::str::from_utf8(&body[5..5 + key_len]).map_err(|_| StoreError::Corrupt {
            reason: "entry key not utf-8".to_string(),
        })?;
    let key: RecordKey = key_text.parse().map_err(|_| StoreError::Corrupt {
        reason: "entry key malformed".to_string(),
    })?;
    let value = Bytes::copy_from_slice(&body[5 + key_len..]);
    Ok((op, key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(ts: u64, suffix: &str) -> RecordKey {
        RecordKey::from_parts(ts, suffix)
    }

    #[test]
    fn put_get_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.log");

        {
            let mut log = RecordLog::open(&path).unwrap();
            log.put(&key(1, "a"), Bytes::from_static(b"first")).unwrap();
            log.put(&key(2, "b"), Bytes::from_static(b"second")).unwrap();
            log.sync(false).unwrap();
        }

        let log = RecordLog::open(&path).unwrap();
        assert_eq!(log.count(), 2);
        assert_eq!(log.get(&key(1, "a")).unwrap().as_ref(), b"first");
    }

    #[test]
    fn tombstones_compact_away_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.log");

        let size_with_garbage;
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.put(&key(1, "a"), Bytes::from_static(b"gone")).unwrap();
            log.put(&key(2, "b"), Bytes::from_static(b"kept")).unwrap();
            assert!(log.del(&key(1, "a")).unwrap());
            log.sync(false).unwrap();
            size_with_garbage = log.byte_size();
        }

        let log = RecordLog::open(&path).unwrap();
        assert_eq!(log.count(), 1);
        assert!(log.byte_size() < size_with_garbage);
        assert!(log.contains(&key(2, "b")));
    }

    #[test]
    fn deleting_missing_key_is_a_clean_false() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("broker.log")).unwrap();
        assert!(!log.del(&key(9, "nope")).unwrap());
    }

    #[test]
    fn iteration_is_numeric_order() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordLog::open(&dir.path().join("broker.log")).unwrap();
        log.put(&key(10, "a"), Bytes::from_static(b"ten")).unwrap();
        log.put(&key(9, "a"), Bytes::from_static(b"nine")).unwrap();

        let (first, _) = log.next_after(None).unwrap();
        assert_eq!(first.timestamp_micros(), 9);
        let (second, _) = log.next_after(Some(&first)).unwrap();
        assert_eq!(second.timestamp_micros(), 10);
        assert!(log.next_after(Some(&second)).is_none());
    }

    #[test]
    fn torn_tail_keeps_earlier_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broker.log");
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.put(&key(1, "a"), Bytes::from_static(b"ok")).unwrap();
            log.sync(false).unwrap();
        }
        // Simulate a torn write: append garbage that is not a whole frame.
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        }

        let log = RecordLog::open(&path).unwrap();
        assert_eq!(log.count(), 1);
        assert!(log.contains(&key(1, "a")));
    }
}
