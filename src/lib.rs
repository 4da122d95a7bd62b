#![forbid(unsafe_code)]

//! duraq: a durable, at-least-once message broker with optional synchronous
//! multi-node replication.
//!
//! Producers hand messages to the broker over a router socket; the broker
//! persists them in an append-only record log, forwards them to consumers
//! over a streaming socket, and removes them only after a positive
//! acknowledgment. Unacknowledged messages are redelivered after a timeout.
//! When replication is configured, each message is copied to peer nodes and
//! the producer ack is withheld until the replica quorum confirms.

pub mod broker;
pub mod config;
pub mod error;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod transport;
pub mod wire;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types that wiring code touches most.
pub use crate::broker::{AckWaitTable, ClusterView, Manager, Reaper, Shutdown, Syncer};
pub use crate::store::{RecordKey, Store};
pub use crate::wire::Frames;
