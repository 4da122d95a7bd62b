//! Pending replica-quorum table.
//!
//! Each entry buffers the producer ack until every expected replica
//! confirms. Two indexes stay consistent under the single manager owner: a
//! hash map by message id for O(1) resolve, and an ordered map by deadline
//! for earliest-deadline lookup. The replication timeout is a global
//! countdown sized from the earliest deadline, not per-entry timers.

use std::collections::{BTreeMap, HashMap};

use crate::time::microsecond_timestamp;
use crate::wire::Frames;

struct AckEntry {
    frames: Frames,
    deadline: u64,
    seq: u64,
    remaining: u32,
}

pub struct AckWaitTable {
    /// Microseconds granted for the whole quorum.
    timeout: u64,
    by_id: HashMap<String, AckEntry>,
    by_deadline: BTreeMap<(u64, u64), String>,
    seq: u64,
}

impl AckWaitTable {
    pub fn new(timeout: u64) -> Self {
        Self {
            timeout,
            by_id: HashMap::new(),
            by_deadline: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Register a pending quorum of `remaining` replica acks.
    pub fn push(&mut self, id: String, frames: Frames, remaining: u32) {
        debug_assert!(remaining > 0);
        let deadline = microsecond_timestamp() + self.timeout;
        let seq = self.seq;
        self.seq += 1;
        self.by_deadline.insert((deadline, seq), id.clone());
        self.by_id.insert(
            id,
            AckEntry {
                frames,
                deadline,
                seq,
                remaining,
            },
        );
    }

    /// Count one replica ack. Returns the buffered producer ack only when
    /// the countdown reaches zero; the entry is removed at that point.
    pub fn resolve_replica_ack(&mut self, id: &str) -> Option<Frames> {
        let entry = self.by_id.get_mut(id)?;
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining > 0 {
            return None;
        }
        self.remove(id)
    }

    /// Drop an entry outright (negative replica ack fails the quorum).
    pub fn remove(&mut self, id: &str) -> Option<Frames> {
        let entry = self.by_id.remove(id)?;
        self.by_deadline.remove(&(entry.deadline, entry.seq));
        Some(entry.frames)
    }

    /// Microseconds until the earliest deadline; negative once overdue.
    pub fn next_deadline_delta(&self, now: u64) -> Option<i64> {
        self.by_deadline
            .keys()
            .next()
            .map(|(deadline, _)| *deadline as i64 - now as i64)
    }

    /// Remove and return the earliest entry if its deadline has passed.
    pub fn pop_expired(&mut self, now: u64) -> Option<Frames> {
        let ((deadline, seq), id) = {
            let (key, id) = self.by_deadline.iter().next()?;
            (*key, id.clone())
        };
        if deadline > now {
            return None;
        }
        self.by_deadline.remove(&(deadline, seq));
        self.by_id.remove(&id).map(|entry| entry.frames)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ack(id: &str) -> Frames {
        let mut frames = Frames::new();
        frames.push("producer-1");
        frames.push(Bytes::new());
        frames.push(id.to_string());
        frames.push("1");
        frames
    }

    #[test]
    fn quorum_completes_only_after_every_replica_acks() {
        let mut table = AckWaitTable::new(5_000_000);
        table.push("m1".to_string(), ack("m1"), 2);

        assert!(table.resolve_replica_ack("m1").is_none());
        let frames = table.resolve_replica_ack("m1").unwrap();
        assert_eq!(frames.text(2), Some("m1"));
        assert!(table.is_empty());
    }

    #[test]
    fn resolving_unknown_id_is_none() {
        let mut table = AckWaitTable::new(5_000_000);
        assert!(table.resolve_replica_ack("ghost").is_none());
    }

    #[test]
    fn earliest_deadline_drives_the_delta() {
        let mut table = AckWaitTable::new(1_000);
        let now = microsecond_timestamp();
        table.push("m1".to_string(), ack("m1"), 1);

        let delta = table.next_deadline_delta(now).unwrap();
        assert!(delta > 0 && delta <= 1_000);
        assert!(table.next_deadline_delta(now + 2_000).unwrap() < 0);
    }

    #[test]
    fn pop_expired_returns_only_overdue_entries_oldest_first() {
        let mut table = AckWaitTable::new(1_000);
        let now = microsecond_timestamp();
        table.push("m1".to_string(), ack("m1"), 1);
        table.push("m2".to_string(), ack("m2"), 1);

        assert!(table.pop_expired(now).is_none());

        let first = table.pop_expired(now + 10_000).unwrap();
        assert_eq!(first.text(2), Some("m1"));
        let second = table.pop_expired(now + 10_000).unwrap();
        assert_eq!(second.text(2), Some("m2"));
        assert!(table.pop_expired(now + 10_000).is_none());
    }

    #[test]
    fn removed_entries_cannot_complete_later() {
        let mut table = AckWaitTable::new(5_000_000);
        table.push("m1".to_string(), ack("m1"), 2);
        assert!(table.remove("m1").is_some());
        assert!(table.resolve_replica_ack("m1").is_none());
        assert!(table.pop_expired(u64::MAX).is_none());
    }
}
