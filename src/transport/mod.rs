//! Socket layer: ordered multipart frame sequences over TCP, with
//! channel-backed in-memory variants for tests.

pub mod frame;
pub mod socket;

use thiserror::Error;

pub use frame::{FrameError, FrameReader, FrameWriter};
pub use socket::{
    DealerPeer, DealerSocket, MemoryPeer, PubSocket, PubTap, RouterConnector, RouterSocket,
    StreamPeer, StreamSocket, SubSocket, MAX_FRAME_BYTES,
};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The outbound queue is full; retry on a later tick.
    #[error("socket would block")]
    WouldBlock,

    /// The peer is gone or was never connected.
    #[error("socket disconnected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl TransportError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::WouldBlock)
    }
}
