//! Single-node broker flows driven through in-memory sockets: produce,
//! dispatch, ack, redelivery, and the monitor snapshot.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use duraq::broker::{ClusterView, Manager, Shutdown};
use duraq::config::ClusterConfig;
use duraq::store::{Store, StoreOptions};
use duraq::transport::{
    DealerSocket, MemoryPeer, PubSocket, RouterSocket, StreamPeer, StreamSocket, SubSocket,
};
use duraq::wire::Frames;

fn frames(parts: &[&str]) -> Frames {
    parts
        .iter()
        .map(|p| Bytes::from(p.to_string().into_bytes()))
        .collect()
}

struct Broker {
    manager: Manager,
    producer: MemoryPeer,
    consumer: StreamPeer,
    monitor: MemoryPeer,
    store: Arc<Store>,
    _dir: TempDir,
}

fn standalone(ack_timeout: u64) -> Broker {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        Store::open(StoreOptions {
            path: dir.path().join("broker.log"),
            inflight_size: 1 << 20,
            ack_timeout,
            hard_sync: false,
        })
        .unwrap(),
    );

    let (producer_sock, producer_conn) = RouterSocket::memory();
    let producer = producer_conn.connect("producer-1");
    let (consumer_sock, consumer) = StreamSocket::memory(16);
    let (monitor_sock, monitor_conn) = RouterSocket::memory();
    let monitor = monitor_conn.connect("mon-1");

    let (replica_link, _peers) = DealerSocket::memory(0);
    let (bus_pub, _tap) = PubSocket::memory();
    let (bus_sub, _feeder) = SubSocket::memory();
    let cluster = ClusterView::with_sockets(
        &ClusterConfig::default(),
        0,
        replica_link,
        bus_pub,
        bus_sub,
    );

    let manager = Manager::new(
        producer_sock,
        consumer_sock,
        monitor_sock,
        Arc::clone(&store),
        cluster,
        5_000_000,
        Shutdown::new(),
    );

    Broker {
        manager,
        producer,
        consumer,
        monitor,
        store,
        _dir: dir,
    }
}

fn monitor_snapshot(broker: &mut Broker) -> String {
    broker.monitor.send(frames(&["MONITOR"])).unwrap();
    broker.manager.tick();
    let reply = broker
        .monitor
        .recv_timeout(Duration::from_secs(1))
        .expect("monitor reply");
    reply.text(1).unwrap().to_string()
}

#[test]
fn produce_dispatch_ack_lifecycle() {
    let mut broker = standalone(5_000_000);

    broker
        .producer
        .send(frames(&["msg-1", "", "hello", "world"]))
        .unwrap();
    broker.manager.tick();

    let ack = broker
        .producer
        .recv_timeout(Duration::from_secs(1))
        .expect("producer ack");
    assert_eq!(ack.text(1), Some("msg-1"));
    assert_eq!(ack.text(2), Some("1"));

    let delivery = broker
        .consumer
        .recv_timeout(Duration::from_secs(1))
        .expect("dispatch");
    let key = delivery.text(0).unwrap().to_string();
    assert_eq!(delivery.text(2), Some("5000000"));
    assert_eq!(delivery.text(3), Some("hello"));
    assert_eq!(delivery.text(4), Some("world"));
    assert_eq!(broker.store.messages(), 1);
    assert_eq!(broker.store.messages_in_flight(), 1);

    broker.consumer.send(frames(&[&key, "1"])).unwrap();
    broker.manager.tick();
    assert_eq!(broker.store.messages(), 0);
    assert_eq!(broker.store.messages_in_flight(), 0);
}

#[test]
fn monitor_reports_queue_counters() {
    let mut broker = standalone(5_000_000);

    broker.producer.send(frames(&["msg-1", "", "body"])).unwrap();
    broker.manager.tick();
    broker.producer.recv_timeout(Duration::from_secs(1)).unwrap();

    let snapshot = monitor_snapshot(&mut broker);
    assert!(snapshot.contains("messages: 1\n"), "snapshot: {snapshot}");
    assert!(snapshot.contains("messages_inflight: 1\n"));
    assert!(snapshot.contains("expired_messages: 0\n"));
    assert!(snapshot.contains("syncs: "));
    assert!(snapshot.contains("db_size: "));
    assert!(snapshot.contains("inflight_db_size: "));

    let key = broker
        .consumer
        .recv_timeout(Duration::from_secs(1))
        .unwrap()
        .text(0)
        .unwrap()
        .to_string();
    broker.consumer.send(frames(&[&key, "1"])).unwrap();
    broker.manager.tick();

    let snapshot = monitor_snapshot(&mut broker);
    assert!(snapshot.contains("messages: 0\n"), "snapshot: {snapshot}");
    assert!(snapshot.contains("messages_inflight: 0\n"));
}

#[test]
fn unacked_message_is_redelivered_after_the_timeout() {
    let mut broker = standalone(50_000);

    broker.producer.send(frames(&["msg-1", "", "retry me"])).unwrap();
    broker.manager.tick();

    let first = broker
        .consumer
        .recv_timeout(Duration::from_secs(1))
        .expect("first dispatch");
    let key = first.text(0).unwrap().to_string();

    thread::sleep(Duration::from_millis(100));
    broker.manager.tick();

    let second = broker
        .consumer
        .recv_timeout(Duration::from_secs(2))
        .expect("redelivery");
    assert_eq!(second.text(0), Some(key.as_str()));
    assert_eq!(second.text(3), Some("retry me"));
    assert!(broker.store.num_expired() >= 1);
}

#[test]
fn negative_consumer_ack_requeues_the_message() {
    let mut broker = standalone(5_000_000);

    broker.producer.send(frames(&["msg-1", "", "again"])).unwrap();
    broker.manager.tick();
    let key = broker
        .consumer
        .recv_timeout(Duration::from_secs(1))
        .unwrap()
        .text(0)
        .unwrap()
        .to_string();

    broker.consumer.send(frames(&[&key, "0"])).unwrap();
    broker.manager.tick();
    assert_eq!(broker.store.messages_in_flight(), 0);
    assert_eq!(broker.store.messages(), 1);

    broker.manager.tick();
    let redelivered = broker
        .consumer
        .recv_timeout(Duration::from_secs(2))
        .expect("requeue dispatch");
    assert_eq!(redelivered.text(0), Some(key.as_str()));
}

#[test]
fn double_ack_is_an_idempotent_no_op() {
    let mut broker = standalone(5_000_000);

    broker.producer.send(frames(&["msg-1", "", "once"])).unwrap();
    broker.manager.tick();
    let key = broker
        .consumer
        .recv_timeout(Duration::from_secs(1))
        .unwrap()
        .text(0)
        .unwrap()
        .to_string();

    broker.consumer.send(frames(&[&key, "1"])).unwrap();
    broker.consumer.send(frames(&[&key, "1"])).unwrap();
    broker.manager.tick();
    broker.manager.tick();

    assert_eq!(broker.store.messages(), 0);
    assert!(broker.consumer.try_recv().is_none());
}

#[test]
fn malformed_producer_request_gets_a_negative_ack() {
    let mut broker = standalone(5_000_000);

    // No empty delimiter frame.
    broker.producer.send(frames(&["msg-1", "oops"])).unwrap();
    broker.manager.tick();

    let reply = broker
        .producer
        .recv_timeout(Duration::from_secs(1))
        .expect("nack");
    assert_eq!(reply.text(1), Some("msg-1"));
    assert_eq!(reply.text(2), Some("0"));
    assert_eq!(broker.store.messages(), 0);
}

#[test]
fn dispatch_follows_numeric_key_order() {
    let mut broker = standalone(5_000_000);

    // Replica writes carry explicit keys, letting us pin the order.
    broker
        .producer
        .send(frames(&["10|bb", "", "REPLICA:node-a", "second"]))
        .unwrap();
    broker
        .producer
        .send(frames(&["9|aa", "", "REPLICA:node-a", "first"]))
        .unwrap();
    broker.manager.tick();

    // The owner never sends keepalives, so both copies dispatch locally.
    let a = broker.consumer.recv_timeout(Duration::from_secs(1)).unwrap();
    let b = broker.consumer.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(a.text(0), Some("9|aa"));
    assert_eq!(b.text(0), Some("10|bb"));
}
