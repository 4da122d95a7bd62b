//! The broker core: one manager thread multiplexing the producer,
//! consumer, monitor, and cluster sockets, plus the reaper and syncer
//! background threads.

pub mod ack_table;
pub mod cluster;
pub mod dispatch;
pub mod manager;
pub mod reaper;
pub mod shutdown;
pub mod syncer;

pub use ack_table::AckWaitTable;
pub use cluster::ClusterView;
pub use dispatch::DISPATCH_CAP;
pub use manager::Manager;
pub use reaper::Reaper;
pub use shutdown::Shutdown;
pub use syncer::Syncer;
