//! The dispatch pass: walk pending records in key order and push them to
//! the consumer socket until backpressure, the in-flight cap, or the end of
//! the log stops the pass.

use crate::broker::cluster::ClusterView;
use crate::store::Store;
use crate::time::microsecond_timestamp;
use crate::transport::StreamSocket;
use crate::wire;

/// Hard cap on concurrently in-flight messages, independent of the socket
/// queue depth. Keeps redelivery bursts after an ack timeout bounded.
pub const DISPATCH_CAP: u64 = 10;

/// Run one dispatch pass. Replica copies are skipped while their owner is
/// alive; a send that would block ends the pass without marking anything.
pub fn run_pass(store: &Store, consumer: &StreamSocket, cluster: &ClusterView) {
    let ack_timeout = store.ack_timeout();
    loop {
        if !consumer.can_write() || store.messages_in_flight() >= DISPATCH_CAP {
            return;
        }
        let Some((key, value)) = store.next_record() else {
            return;
        };
        if store.is_in_flight(&key) {
            continue;
        }
        let payload = match wire::decode_value(&value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %key, "skipping undecodable record: {e}");
                continue;
            }
        };

        let now = microsecond_timestamp();
        if let Some(owner) = wire::replica_owner(&payload[0]) {
            if owner != cluster.node_name() && !cluster.should_dispatch_replica(&owner, now) {
                cluster.check_replica(&key, &owner, now);
                continue;
            }
        }

        let frames = wire::build_dispatch(&key.to_string(), now, ack_timeout, &payload);
        match consumer.try_send(frames) {
            Ok(()) => store.mark_in_flight(&key),
            Err(e) if e.is_would_block() => return,
            Err(e) => {
                tracing::warn!("consumer send failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::store::StoreOptions;
    use crate::transport::{DealerSocket, PubSocket, StreamSocket, SubSocket};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(StoreOptions {
            path: dir.path().join("broker.log"),
            inflight_size: 1 << 20,
            ack_timeout: 5_000_000,
            hard_sync: false,
        })
        .unwrap()
    }

    fn standalone_cluster() -> ClusterView {
        let (replica_link, _peers) = DealerSocket::memory(0);
        let (bus_pub, _tap) = PubSocket::memory();
        let (bus_sub, _feeder) = SubSocket::memory();
        ClusterView::with_sockets(
            &ClusterConfig::default(),
            0,
            replica_link,
            bus_pub,
            bus_sub,
        )
    }

    #[test]
    fn dispatches_in_key_order_with_timing_frames() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let cluster = standalone_cluster();
        let (consumer, peer) = StreamSocket::memory(16);

        let first = store.save(&[Bytes::from_static(b"one")], None).unwrap();
        let second = store.save(&[Bytes::from_static(b"two")], None).unwrap();

        run_pass(&store, &consumer, &cluster);

        let mut expected = vec![first, second];
        expected.sort();
        let a = peer.recv_timeout(Duration::from_secs(1)).unwrap();
        let b = peer.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(a.text(0), Some(expected[0].to_string().as_str()));
        assert_eq!(b.text(0), Some(expected[1].to_string().as_str()));
        assert_eq!(a.text(2), Some("5000000"));
        assert_eq!(a.text(3), Some("one"));
        assert_eq!(store.messages_in_flight(), 2);
    }

    #[test]
    fn in_flight_records_are_not_redispatched() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let cluster = standalone_cluster();
        let (consumer, peer) = StreamSocket::memory(16);

        store.save(&[Bytes::from_static(b"solo")], None).unwrap();
        run_pass(&store, &consumer, &cluster);
        assert!(peer.try_recv().is_some());

        run_pass(&store, &consumer, &cluster);
        assert!(peer.try_recv().is_none());
    }

    #[test]
    fn backpressure_ends_the_pass_without_marking() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let cluster = standalone_cluster();
        let (consumer, peer) = StreamSocket::memory(1);

        store.save(&[Bytes::from_static(b"one")], None).unwrap();
        store.save(&[Bytes::from_static(b"two")], None).unwrap();
        run_pass(&store, &consumer, &cluster);
        assert_eq!(store.messages_in_flight(), 1);

        peer.try_recv().unwrap();
        run_pass(&store, &consumer, &cluster);
        assert_eq!(store.messages_in_flight(), 2);
    }

    #[test]
    fn the_in_flight_cap_bounds_a_pass() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let cluster = standalone_cluster();
        let (consumer, _peer) = StreamSocket::memory(64);

        for i in 0..15u32 {
            store
                .save(&[Bytes::from(format!("m{i}").into_bytes())], None)
                .unwrap();
        }
        run_pass(&store, &consumer, &cluster);
        assert_eq!(store.messages_in_flight(), DISPATCH_CAP);
    }

    #[test]
    fn parked_replica_copies_are_skipped_while_the_owner_lives() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let (consumer, peer) = StreamSocket::memory(16);

        let (replica_link, _peers) = DealerSocket::memory(0);
        let (bus_pub, _tap) = PubSocket::memory();
        let (bus_sub, _feeder) = SubSocket::memory();
        let config = ClusterConfig {
            node_name: "node-a".to_string(),
            replicas: 1,
            timeout_nodes: 10_000_000,
            ..ClusterConfig::default()
        };
        let mut cluster =
            ClusterView::with_sockets(&config, 0, replica_link, bus_pub, bus_sub);

        let mut kalv = crate::wire::Frames::new();
        kalv.push(crate::wire::CLUSTER_TOPIC);
        kalv.push("KALV");
        kalv.push("node-b");
        cluster.handle_nodes_message(&kalv, &store);

        store
            .save(
                &[
                    Bytes::from_static(b"REPLICA:node-b"),
                    Bytes::from_static(b"payload"),
                ],
                None,
            )
            .unwrap();

        run_pass(&store, &consumer, &cluster);
        assert!(peer.try_recv().is_none());
        assert_eq!(store.messages_in_flight(), 0);
    }
}
