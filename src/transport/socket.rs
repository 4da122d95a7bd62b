//! Channel-backed socket kinds over the crc framing layer.
//!
//! Every socket exposes its inbound side as a crossbeam receiver so the
//! broker loop can poll all of them with one `Select`. Outbound sides are
//! bounded queues; a full queue is the non-blocking "would block" readiness
//! signal. Each kind also has an in-memory constructor so the broker core is
//! testable without TCP.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use super::frame::{FrameReader, FrameWriter};
use super::TransportError;
use crate::wire::Frames;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Per-connection outbound queue depth for routed and fan-out links.
const LINK_QUEUE: usize = 64;

/// Reconnect backoff for outbound links.
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) {
    let _ = thread::Builder::new().name(name.to_string()).spawn(f);
}

// ---------------------------------------------------------------------------
// Router: many peers in, replies routed by the leading identity frame.
// ---------------------------------------------------------------------------

/// Many-to-one request/reply socket. `recv` yields messages with a synthetic
/// peer-identity frame prepended; `send` strips that frame and routes on it.
pub struct RouterSocket {
    incoming_rx: Receiver<Frames>,
    peers: Arc<Mutex<HashMap<Bytes, Sender<Frames>>>>,
    closed: Arc<AtomicBool>,
}

impl RouterSocket {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let (incoming_tx, incoming_rx) = unbounded();
        let peers: Arc<Mutex<HashMap<Bytes, Sender<Frames>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let next_peer = Arc::new(AtomicU64::new(1));

        {
            let peers = Arc::clone(&peers);
            let closed = Arc::clone(&closed);
            spawn("router-accept", move || loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let id = Bytes::from(
                            format!("peer-{}", next_peer.fetch_add(1, Ordering::Relaxed))
                                .into_bytes(),
                        );
                        serve_routed_conn(
                            stream,
                            id,
                            incoming_tx.clone(),
                            Arc::clone(&peers),
                            Arc::clone(&closed),
                        );
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        tracing::warn!("router accept error: {e}");
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            });
        }

        Ok(Self {
            incoming_rx,
            peers,
            closed,
        })
    }

    /// In-memory router plus a connector handle for tests.
    pub fn memory() -> (Self, RouterConnector) {
        let (incoming_tx, incoming_rx) = unbounded();
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let socket = Self {
            incoming_rx,
            peers: Arc::clone(&peers),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (socket, RouterConnector { incoming_tx, peers })
    }

    pub fn receiver(&self) -> &Receiver<Frames> {
        &self.incoming_rx
    }

    /// Route a reply; the first frame names the destination peer.
    pub fn send(&self, frames: Frames) -> Result<(), TransportError> {
        let mut parts = frames.into_vec();
        if parts.is_empty() {
            return Err(TransportError::Disconnected);
        }
        let peer = parts.remove(0);
        let tx = {
            let peers = self.peers.lock().unwrap_or_else(|p| p.into_inner());
            peers.get(&peer).cloned()
        };
        let Some(tx) = tx else {
            return Err(TransportError::Disconnected);
        };
        match tx.try_send(Frames::from(parts)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::WouldBlock),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn serve_routed_conn(
    stream: TcpStream,
    id: Bytes,
    incoming: Sender<Frames>,
    peers: Arc<Mutex<HashMap<Bytes, Sender<Frames>>>>,
    closed: Arc<AtomicBool>,
) {
    let (out_tx, out_rx) = bounded::<Frames>(LINK_QUEUE);
    {
        let mut map = peers.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(id.clone(), out_tx);
    }

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("router conn clone failed: {e}");
            return;
        }
    };

    spawn("router-conn-write", move || {
        let mut writer = FrameWriter::new(writer_stream, MAX_FRAME_BYTES);
        while let Ok(frames) = out_rx.recv() {
            if writer.write_message(&frames).is_err() {
                return;
            }
        }
    });

    spawn("router-conn-read", move || {
        let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
        loop {
            if closed.load(Ordering::Relaxed) {
                break;
            }
            match reader.read_message() {
                Ok(Some(frames)) => {
                    let mut parts = vec![id.clone()];
                    parts.extend(frames.into_vec());
                    if incoming.send(Frames::from(parts)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("router conn read error: {e}");
                    break;
                }
            }
        }
        let mut map = peers.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&id);
    });
}

/// Test-side handle for an in-memory [`RouterSocket`].
pub struct RouterConnector {
    incoming_tx: Sender<Frames>,
    peers: Arc<Mutex<HashMap<Bytes, Sender<Frames>>>>,
}

impl RouterConnector {
    pub fn connect(&self, id: &str) -> MemoryPeer {
        let id = Bytes::from(id.to_string().into_bytes());
        let (out_tx, out_rx) = bounded(LINK_QUEUE);
        {
            let mut map = self.peers.lock().unwrap_or_else(|p| p.into_inner());
            map.insert(id.clone(), out_tx);
        }
        MemoryPeer {
            id,
            tx: self.incoming_tx.clone(),
            rx: out_rx,
        }
    }
}

/// One in-memory connection to a router socket.
pub struct MemoryPeer {
    id: Bytes,
    tx: Sender<Frames>,
    rx: Receiver<Frames>,
}

impl MemoryPeer {
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// Send a message; the router side sees it with this peer's id prepended.
    pub fn send(&self, frames: Frames) -> Result<(), TransportError> {
        let mut parts = vec![self.id.clone()];
        parts.extend(frames.into_vec());
        self.tx
            .send(Frames::from(parts))
            .map_err(|_| TransportError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frames> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Frames> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Stream: one-to-one delivery with a bounded outbound queue.
// ---------------------------------------------------------------------------

/// Consumer-facing streaming socket. Outbound capacity is the backpressure
/// window: `try_send` fails with `WouldBlock` when the queue is full.
pub struct StreamSocket {
    incoming_rx: Receiver<Frames>,
    outgoing_tx: Sender<Frames>,
    closed: Arc<AtomicBool>,
}

impl StreamSocket {
    pub fn bind(addr: &str, capacity: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let (incoming_tx, incoming_rx) = unbounded();
        let (outgoing_tx, outgoing_rx) = bounded::<Frames>(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        {
            let closed = Arc::clone(&closed);
            spawn("stream-accept", move || loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        serve_stream_conn(stream, incoming_tx.clone(), outgoing_rx.clone());
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        tracing::warn!("stream accept error: {e}");
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            });
        }

        Ok(Self {
            incoming_rx,
            outgoing_tx,
            closed,
        })
    }

    pub fn memory(capacity: usize) -> (Self, StreamPeer) {
        let (incoming_tx, incoming_rx) = unbounded();
        let (outgoing_tx, outgoing_rx) = bounded(capacity);
        let socket = Self {
            incoming_rx,
            outgoing_tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (
            socket,
            StreamPeer {
                tx: incoming_tx,
                rx: outgoing_rx,
            },
        )
    }

    pub fn receiver(&self) -> &Receiver<Frames> {
        &self.incoming_rx
    }

    /// Non-blocking readiness query for the dispatch pass.
    pub fn can_write(&self) -> bool {
        !self.outgoing_tx.is_full()
    }

    pub fn try_send(&self, frames: Frames) -> Result<(), TransportError> {
        match self.outgoing_tx.try_send(frames) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::WouldBlock),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn serve_stream_conn(stream: TcpStream, incoming: Sender<Frames>, outgoing: Receiver<Frames>) {
    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("stream conn clone failed: {e}");
            return;
        }
    };

    spawn("stream-conn-write", move || {
        let mut writer = FrameWriter::new(writer_stream, MAX_FRAME_BYTES);
        while let Ok(frames) = outgoing.recv() {
            if writer.write_message(&frames).is_err() {
                return;
            }
        }
    });

    spawn("stream-conn-read", move || {
        let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
        while let Ok(Some(frames)) = reader.read_message() {
            if incoming.send(frames).is_err() {
                return;
            }
        }
    });
}

/// Test-side handle for an in-memory [`StreamSocket`].
pub struct StreamPeer {
    tx: Sender<Frames>,
    rx: Receiver<Frames>,
}

impl StreamPeer {
    pub fn send(&self, frames: Frames) -> Result<(), TransportError> {
        self.tx.send(frames).map_err(|_| TransportError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frames> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Frames> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Dealer: fan-out across peer links, fair-queued fan-in.
// ---------------------------------------------------------------------------

/// Outbound replica link. `send` round-robins across currently connected
/// peers; replies from all peers fair-queue into one receiver.
pub struct DealerSocket {
    incoming_rx: Receiver<Frames>,
    links: Arc<Mutex<Vec<Sender<Frames>>>>,
    round_robin: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl DealerSocket {
    pub fn connect(addrs: &[String]) -> Self {
        let (incoming_tx, incoming_rx) = unbounded();
        let links: Arc<Mutex<Vec<Sender<Frames>>>> = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        for addr in addrs {
            let addr = addr.clone();
            let incoming_tx = incoming_tx.clone();
            let links = Arc::clone(&links);
            let closed = Arc::clone(&closed);
            spawn("dealer-link", move || loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match TcpStream::connect(&addr) {
                    Ok(stream) => {
                        run_dealer_link(stream, &incoming_tx, &links, &closed);
                    }
                    Err(e) => {
                        tracing::debug!("dealer connect {addr} failed: {e}");
                    }
                }
                thread::sleep(RECONNECT_DELAY);
            });
        }

        Self {
            incoming_rx,
            links,
            round_robin: AtomicUsize::new(0),
            closed,
        }
    }

    /// In-memory dealer with `n` attached peers for tests.
    pub fn memory(n: usize) -> (Self, Vec<DealerPeer>) {
        let (incoming_tx, incoming_rx) = unbounded();
        let links = Arc::new(Mutex::new(Vec::new()));
        let mut peers = Vec::with_capacity(n);
        {
            let mut guard = links.lock().unwrap_or_else(|p| p.into_inner());
            for _ in 0..n {
                let (out_tx, out_rx) = bounded(LINK_QUEUE);
                guard.push(out_tx);
                peers.push(DealerPeer {
                    tx: incoming_tx.clone(),
                    rx: out_rx,
                });
            }
        }
        let socket = Self {
            incoming_rx,
            links,
            round_robin: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (socket, peers)
    }

    pub fn receiver(&self) -> &Receiver<Frames> {
        &self.incoming_rx
    }

    /// Send one message to the next live peer, round-robin. Fan-out of `n`
    /// copies is `n` calls; the rotation spreads them across peers.
    pub fn send(&self, frames: Frames) -> Result<(), TransportError> {
        let links = self.links.lock().unwrap_or_else(|p| p.into_inner());
        if links.is_empty() {
            return Err(TransportError::Disconnected);
        }
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % links.len();
        let mut frames = frames;
        for i in 0..links.len() {
            let link = &links[(start + i) % links.len()];
            match link.try_send(frames) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(f)) | Err(TrySendError::Disconnected(f)) => frames = f,
            }
        }
        Err(TransportError::WouldBlock)
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn run_dealer_link(
    stream: TcpStream,
    incoming: &Sender<Frames>,
    links: &Arc<Mutex<Vec<Sender<Frames>>>>,
    closed: &Arc<AtomicBool>,
) {
    let (out_tx, out_rx) = bounded::<Frames>(LINK_QUEUE);
    {
        let mut guard = links.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(out_tx.clone());
    }

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("dealer link clone failed: {e}");
            return;
        }
    };

    spawn("dealer-link-write", move || {
        let mut writer = FrameWriter::new(writer_stream, MAX_FRAME_BYTES);
        while let Ok(frames) = out_rx.recv() {
            if writer.write_message(&frames).is_err() {
                return;
            }
        }
    });

    // Reader runs on the connect loop's thread; returning triggers reconnect.
    let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
    loop {
        if closed.load(Ordering::Relaxed) {
            break;
        }
        match reader.read_message() {
            Ok(Some(frames)) => {
                if incoming.send(frames).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("dealer link read error: {e}");
                break;
            }
        }
    }

    let mut guard = links.lock().unwrap_or_else(|p| p.into_inner());
    guard.retain(|link| !link.same_channel(&out_tx));
}

/// Test-side handle for one in-memory dealer link.
pub struct DealerPeer {
    tx: Sender<Frames>,
    rx: Receiver<Frames>,
}

impl DealerPeer {
    /// Reply toward the dealer (fair-queued with other peers).
    pub fn send(&self, frames: Frames) -> Result<(), TransportError> {
        self.tx.send(frames).map_err(|_| TransportError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frames> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Frames> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Pub/Sub: broadcast bus with a topic prefix filter.
// ---------------------------------------------------------------------------

/// Broadcast publisher. Sends are best-effort to every connected subscriber;
/// a slow subscriber drops frames rather than stalling the broker.
pub struct PubSocket {
    subs: Arc<Mutex<Vec<Sender<Frames>>>>,
    closed: Arc<AtomicBool>,
}

impl PubSocket {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let subs: Arc<Mutex<Vec<Sender<Frames>>>> = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        {
            let subs = Arc::clone(&subs);
            let closed = Arc::clone(&closed);
            spawn("pub-accept", move || loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let (out_tx, out_rx) = bounded::<Frames>(LINK_QUEUE);
                        {
                            let mut guard = subs.lock().unwrap_or_else(|p| p.into_inner());
                            guard.push(out_tx);
                        }
                        spawn("pub-conn-write", move || {
                            let mut writer = FrameWriter::new(stream, MAX_FRAME_BYTES);
                            while let Ok(frames) = out_rx.recv() {
                                if writer.write_message(&frames).is_err() {
                                    return;
                                }
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        tracing::warn!("pub accept error: {e}");
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            });
        }

        Ok(Self { subs, closed })
    }

    pub fn memory() -> (Self, PubTap) {
        let subs = Arc::new(Mutex::new(Vec::new()));
        let socket = Self {
            subs: Arc::clone(&subs),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (socket, PubTap { subs })
    }

    pub fn send(&self, frames: Frames) {
        let mut guard = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|sub| match sub.try_send(frames.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Test-side handle for attaching subscribers to an in-memory [`PubSocket`].
pub struct PubTap {
    subs: Arc<Mutex<Vec<Sender<Frames>>>>,
}

impl PubTap {
    pub fn subscribe(&self) -> Receiver<Frames> {
        let (tx, rx) = bounded(LINK_QUEUE);
        let mut guard = self.subs.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(tx);
        rx
    }
}

/// Subscriber side of the broadcast bus, filtered on a topic prefix.
pub struct SubSocket {
    incoming_rx: Receiver<Frames>,
    feeder: Sender<Frames>,
    closed: Arc<AtomicBool>,
}

impl SubSocket {
    pub fn connect(addrs: &[String], topic: &str) -> Self {
        let (incoming_tx, incoming_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let topic = topic.as_bytes().to_vec();

        for addr in addrs {
            let addr = addr.clone();
            let incoming_tx = incoming_tx.clone();
            let closed = Arc::clone(&closed);
            let topic = topic.clone();
            spawn("sub-link", move || loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                match TcpStream::connect(&addr) {
                    Ok(stream) => {
                        let mut reader = FrameReader::new(stream, MAX_FRAME_BYTES);
                        loop {
                            if closed.load(Ordering::Relaxed) {
                                return;
                            }
                            match reader.read_message() {
                                Ok(Some(frames)) => {
                                    let matches = frames
                                        .get(0)
                                        .map(|f| f.as_ref() == topic.as_slice())
                                        .unwrap_or(false);
                                    if matches && incoming_tx.send(frames).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::debug!("sub link read error: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("sub connect {addr} failed: {e}");
                    }
                }
                thread::sleep(RECONNECT_DELAY);
            });
        }

        Self {
            incoming_rx,
            feeder: incoming_tx,
            closed,
        }
    }

    /// In-memory subscriber; the returned feeder injects control frames.
    pub fn memory() -> (Self, Sender<Frames>) {
        let (incoming_tx, incoming_rx) = unbounded();
        let socket = Self {
            incoming_rx,
            feeder: incoming_tx.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (socket, incoming_tx)
    }

    /// Attach this subscriber to an in-memory publisher.
    pub fn attach(&self, tap: &PubTap) {
        let rx = tap.subscribe();
        let feeder = self.feeder.clone();
        let closed = Arc::clone(&self.closed);
        spawn("sub-mem-link", move || {
            while let Ok(frames) = rx.recv() {
                if closed.load(Ordering::Relaxed) || feeder.send(frames).is_err() {
                    return;
                }
            }
        });
    }

    pub fn receiver(&self) -> &Receiver<Frames> {
        &self.incoming_rx
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frames(parts: &[&str]) -> Frames {
        parts
            .iter()
            .map(|p| Bytes::from(p.to_string().into_bytes()))
            .collect()
    }

    #[test]
    fn router_prepends_and_routes_on_identity() {
        let (router, connector) = RouterSocket::memory();
        let peer = connector.connect("client-a");

        peer.send(text_frames(&["msg-1", "", "body"])).unwrap();
        let seen = router.receiver().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(seen.text(0), Some("client-a"));
        assert_eq!(seen.text(1), Some("msg-1"));

        router
            .send(text_frames(&["client-a", "", "msg-1", "1"]))
            .unwrap();
        let reply = peer.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.text(1), Some("msg-1"));
    }

    #[test]
    fn stream_backpressure_reports_would_block() {
        let (socket, peer) = StreamSocket::memory(1);
        assert!(socket.can_write());
        socket.try_send(text_frames(&["a"])).unwrap();
        assert!(!socket.can_write());
        assert!(matches!(
            socket.try_send(text_frames(&["b"])),
            Err(TransportError::WouldBlock)
        ));

        peer.try_recv().unwrap();
        assert!(socket.can_write());
    }

    #[test]
    fn dealer_round_robins_across_peers() {
        let (dealer, peers) = DealerSocket::memory(2);
        dealer.send(text_frames(&["copy-1"])).unwrap();
        dealer.send(text_frames(&["copy-2"])).unwrap();

        let got_a = peers[0].recv_timeout(Duration::from_secs(1)).unwrap();
        let got_b = peers[1].recv_timeout(Duration::from_secs(1)).unwrap();
        let mut texts = vec![
            got_a.text(0).unwrap().to_string(),
            got_b.text(0).unwrap().to_string(),
        ];
        texts.sort();
        assert_eq!(texts, vec!["copy-1", "copy-2"]);
    }

    #[test]
    fn pub_sub_filters_on_topic() {
        let (publisher, tap) = PubSocket::memory();
        let (sub, _feeder) = SubSocket::memory();
        sub.attach(&tap);

        publisher.send(text_frames(&["CLUSTER", "KALV", "node-a"]));
        let seen = sub.receiver().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(seen.text(1), Some("KALV"));
    }
}
