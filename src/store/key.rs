//! Record keys: `timestamp_micros|uuid`.
//!
//! Keys order by the numeric value of the timestamp prefix, then the suffix.
//! Parsing the prefix into a `u64` is what makes the order numeric-aware:
//! `9|...` sorts before `10|...` even though it is lexicographically larger.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

use crate::time::microsecond_timestamp;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed record key {key:?}: {reason}")]
pub struct KeyError {
    pub key: String,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    timestamp: u64,
    suffix: String,
}

impl RecordKey {
    /// Fresh key for an original message: current time plus a random uuid.
    pub fn generate() -> Self {
        Self {
            timestamp: microsecond_timestamp(),
            suffix: Uuid::new_v4().to_string(),
        }
    }

    #[cfg(test)]
    pub fn from_parts(timestamp: u64, suffix: &str) -> Self {
        Self {
            timestamp,
            suffix: suffix.to_string(),
        }
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.timestamp
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.timestamp, self.suffix)
    }
}

impl FromStr for RecordKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| KeyError {
            key: s.to_string(),
            reason,
        };
        let (ts, suffix) = s.split_once('|').ok_or_else(|| err("missing separator"))?;
        let timestamp: u64 = ts.parse().map_err(|_| err("non-numeric timestamp"))?;
        if suffix.is_empty() {
            return Err(err("empty suffix"));
        }
        Ok(Self {
            timestamp,
            suffix: suffix.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_numerically_not_lexicographically() {
        let nine: RecordKey = "9|a".parse().unwrap();
        let ten: RecordKey = "10|a".parse().unwrap();
        assert!(nine < ten);
        // The string forms would order the other way.
        assert!("9|a" > "10|a");
    }

    #[test]
    fn display_parse_roundtrip() {
        let key = RecordKey::generate();
        let parsed: RecordKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!("no-separator".parse::<RecordKey>().is_err());
        assert!("abc|x".parse::<RecordKey>().is_err());
        assert!("123|".parse::<RecordKey>().is_err());
    }

    #[test]
    fn same_timestamp_breaks_ties_on_suffix() {
        let a = RecordKey::from_parts(5, "aaa");
        let b = RecordKey::from_parts(5, "bbb");
        assert!(a < b);
    }
}
