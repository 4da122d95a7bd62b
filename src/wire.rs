//! Frame-level protocol: multipart messages, producer/consumer/monitor and
//! cluster control framing, and the on-disk record value codec.
//!
//! A message is an ordered sequence of opaque byte frames. The broker never
//! interprets payload frames beyond the leading replica marker.

use bytes::Bytes;
use thiserror::Error;

/// Marker prefix on the first payload frame of a relayed replica copy.
pub const REPLICA_PREFIX: &str = "REPLICA:";
/// Topic prefix for cluster control frames on the broadcast bus.
pub const CLUSTER_TOPIC: &str = "CLUSTER";
pub const STATUS_OK: &str = "1";
pub const STATUS_FAIL: &str = "0";
/// Distinct third terminal status appended when the replica quorum times out.
pub const REPLICATION_FAILED: &str = "REPLICATION_FAILED";
pub const MONITOR_COMMAND: &str = "MONITOR";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message has too few frames: got {got}, need {need}")]
    TooFewFrames { got: usize, need: usize },

    #[error("missing empty delimiter frame")]
    MissingDelimiter,

    #[error("message has no payload frames")]
    EmptyPayload,

    #[error("frame {frame} is not valid utf-8")]
    BadText { frame: usize },

    #[error("unknown cluster control subtype {subtype:?}")]
    UnknownControl { subtype: String },

    #[error("corrupt record value: {reason}")]
    CorruptValue { reason: &'static str },
}

/// An ordered multipart message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frames(Vec<Bytes>);

impl Frames {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, part: impl Into<Bytes>) {
        self.0.push(part.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Bytes> {
        self.0.get(idx)
    }

    /// Replace an existing frame in place.
    pub fn set(&mut self, idx: usize, part: impl Into<Bytes>) {
        if let Some(slot) = self.0.get_mut(idx) {
            *slot = part.into();
        }
    }

    /// UTF-8 view of a frame, if it is text.
    pub fn text(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Bytes] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Bytes> {
        self.0
    }
}

impl From<Vec<Bytes>> for Frames {
    fn from(parts: Vec<Bytes>) -> Self {
        Self(parts)
    }
}

impl FromIterator<Bytes> for Frames {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn text_frame(frames: &Frames, idx: usize) -> Result<&str, WireError> {
    frames.text(idx).ok_or(WireError::BadText { frame: idx })
}

/// A parsed producer request: `[peerId][msgId][empty][payload...]`.
///
/// A payload whose first frame carries the replica marker is a relayed copy
/// from a peer; its id frame is reused verbatim as the storage key.
#[derive(Clone, Debug)]
pub struct ProducerRequest {
    pub peer: Bytes,
    pub id: Bytes,
    pub payload: Vec<Bytes>,
    pub replica_owner: Option<String>,
}

pub fn parse_producer(frames: &Frames) -> Result<ProducerRequest, WireError> {
    if frames.len() < 3 {
        return Err(WireError::TooFewFrames {
            got: frames.len(),
            need: 3,
        });
    }
    let peer = frames.get(0).cloned().unwrap_or_default();
    let id = frames.get(1).cloned().unwrap_or_default();
    if !frames.get(2).map(|f| f.is_empty()).unwrap_or(false) {
        return Err(WireError::MissingDelimiter);
    }
    let payload: Vec<Bytes> = frames.as_slice()[3..].to_vec();
    if payload.is_empty() {
        return Err(WireError::EmptyPayload);
    }

    let replica_owner = replica_owner(&payload[0]);
    Ok(ProducerRequest {
        peer,
        id,
        payload,
        replica_owner,
    })
}

/// The owner node name, if the frame carries a `REPLICA:<node>` marker.
pub fn replica_owner(frame: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(frame).ok()?;
    text.strip_prefix(REPLICA_PREFIX).map(|owner| owner.to_string())
}

/// Producer ack reply: `[peerId][empty][msgId][status][optional detail]`.
pub fn build_producer_ack(peer: &Bytes, id: &Bytes, status: &str, detail: Option<&str>) -> Frames {
    let mut frames = Frames::new();
    frames.push(peer.clone());
    frames.push(Bytes::new());
    frames.push(id.clone());
    frames.push(status.to_string());
    if let Some(detail) = detail {
        frames.push(detail.to_string());
    }
    frames
}

/// Replica relay to a peer's producer socket: the peer sees
/// `[msgId][empty][REPLICA:<node>][payload...]` after its router id.
pub fn build_replica(key: &str, node: &str, payload: &[Bytes]) -> Frames {
    let mut frames = Frames::new();
    frames.push(key.to_string());
    frames.push(Bytes::new());
    frames.push(format!("{REPLICA_PREFIX}{node}"));
    frames.extend_payload(payload);
    frames
}

impl Frames {
    fn extend_payload(&mut self, payload: &[Bytes]) {
        for part in payload {
            self.push(part.clone());
        }
    }
}

/// Consumer dispatch: `[key][dispatchTimestampMicros][ackTimeoutMicros][payload...]`.
pub fn build_dispatch(key: &str, dispatched_at: u64, ack_timeout: u64, payload: &[Bytes]) -> Frames {
    let mut frames = Frames::new();
    frames.push(key.to_string());
    frames.push(dispatched_at.to_string());
    frames.push(ack_timeout.to_string());
    frames.extend_payload(payload);
    frames
}

/// Consumer ack: `[key][status]`. Returns the key and whether it was positive.
pub fn parse_consumer_ack(frames: &Frames) -> Result<(String, bool), WireError> {
    if frames.len() < 2 {
        return Err(WireError::TooFewFrames {
            got: frames.len(),
            need: 2,
        });
    }
    let key = text_frame(frames, 0)?.to_string();
    let positive = frames.text(1) == Some(STATUS_OK);
    Ok((key, positive))
}

/// Cluster ack from a peer, arriving on the dealer link. Router-replied acks
/// carry a leading empty delimiter; tolerate its absence.
pub fn parse_cluster_ack(frames: &Frames) -> Result<(String, bool), WireError> {
    let parts: Vec<&Bytes> = frames.iter().filter(|f| !f.is_empty()).collect();
    if parts.len() < 2 {
        return Err(WireError::TooFewFrames {
            got: parts.len(),
            need: 2,
        });
    }
    let id = std::str::from_utf8(parts[0])
        .map_err(|_| WireError::BadText { frame: 0 })?
        .to_string();
    let positive = parts[1].first() == Some(&b'1');
    Ok((id, positive))
}

/// Monitor request handling: returns the requesting peer when the message is
/// a `MONITOR` command (the command frame is the last non-empty frame).
pub fn parse_monitor_request(frames: &Frames) -> Option<Bytes> {
    let peer = frames.get(0)?.clone();
    let command = frames.iter().skip(1).rev().find(|f| !f.is_empty())?;
    if command.as_ref() == MONITOR_COMMAND.as_bytes() {
        Some(peer)
    } else {
        None
    }
}

pub fn build_monitor_reply(peer: &Bytes, text: &str) -> Frames {
    let mut frames = Frames::new();
    frames.push(peer.clone());
    frames.push(Bytes::new());
    frames.push(text.to_string());
    frames
}

/// Parsed cluster control frame from the broadcast bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterControl {
    KeepAlive { node: String },
    Remove { id: String },
    Check { id: String, owner: String },
}

pub fn parse_cluster_control(frames: &Frames) -> Result<ClusterControl, WireError> {
    if frames.len() < 3 {
        return Err(WireError::TooFewFrames {
            got: frames.len(),
            need: 3,
        });
    }
    // Frame 0 is the topic; the sub socket already filtered on it.
    let subtype = text_frame(frames, 1)?;
    match subtype {
        "KALV" => Ok(ClusterControl::KeepAlive {
            node: text_frame(frames, 2)?.to_string(),
        }),
        "REMOVE" => Ok(ClusterControl::Remove {
            id: text_frame(frames, 2)?.to_string(),
        }),
        "CHECK" => {
            if frames.len() < 4 {
                return Err(WireError::TooFewFrames {
                    got: frames.len(),
                    need: 4,
                });
            }
            Ok(ClusterControl::Check {
                id: text_frame(frames, 2)?.to_string(),
                owner: text_frame(frames, 3)?.to_string(),
            })
        }
        other => Err(WireError::UnknownControl {
            subtype: other.to_string(),
        }),
    }
}

pub fn build_keepalive(node: &str) -> Frames {
    let mut frames = Frames::new();
    frames.push(CLUSTER_TOPIC);
    frames.push("KALV");
    frames.push(node.to_string());
    frames
}

pub fn build_remove(id: &str) -> Frames {
    let mut frames = Frames::new();
    frames.push(CLUSTER_TOPIC);
    frames.push("REMOVE");
    frames.push(id.to_string());
    frames
}

pub fn build_check(id: &str, owner: &str) -> Frames {
    let mut frames = Frames::new();
    frames.push(CLUSTER_TOPIC);
    frames.push("CHECK");
    frames.push(id.to_string());
    frames.push(owner.to_string());
    frames
}

/// Encode payload frames as the stored record value: repeated `(u64 len, bytes)`.
pub fn encode_value(payload: &[Bytes]) -> Bytes {
    let total: usize = payload.iter().map(|p| 8 + p.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for part in payload {
        buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
        buf.extend_from_slice(part);
    }
    Bytes::from(buf)
}

pub fn decode_value(value: &[u8]) -> Result<Vec<Bytes>, WireError> {
    let mut parts = Vec::new();
    let mut pos = 0usize;
    while pos < value.len() {
        if value.len() - pos < 8 {
            return Err(WireError::CorruptValue {
                reason: "truncated length header",
            });
        }
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&value[pos..pos + 8]);
        let len = u64::from_le_bytes(len_buf) as usize;
        pos += 8;
        if value.len() - pos < len {
            return Err(WireError::CorruptValue {
                reason: "truncated frame body",
            });
        }
        parts.push(Bytes::copy_from_slice(&value[pos..pos + len]));
        pos += len;
    }
    if parts.is_empty() {
        return Err(WireError::CorruptValue {
            reason: "value holds no frames",
        });
    }
    Ok(parts)
}
