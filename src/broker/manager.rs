//! The broker event loop.
//!
//! One thread owns every socket, the ack table, and the cluster view, and
//! multiplexes them with a single `Select`. The poll timeout shrinks to the
//! nearest pending deadline (replica ack expiry, keepalive broadcast, peer
//! timeout) so timed work happens close to when it is due without a busy
//! loop. The store is shared with the reaper and syncer threads; everything
//! else is loop-local.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Select;

use crate::broker::ack_table::AckWaitTable;
use crate::broker::cluster::ClusterView;
use crate::broker::dispatch::{self, DISPATCH_CAP};
use crate::broker::shutdown::Shutdown;
use crate::config::Config;
use crate::store::{RecordKey, Store, StoreError};
use crate::time::microsecond_timestamp;
use crate::transport::{RouterSocket, StreamSocket};
use crate::wire::{self, Frames, ProducerRequest, REPLICATION_FAILED, STATUS_FAIL, STATUS_OK};

/// Poll ceiling while messages wait for a consumer.
const BUSY_POLL_MICROS: i64 = 100_000;
/// Poll ceiling when the queue is drained.
const IDLE_POLL_MICROS: i64 = 1_000_000;

pub struct Manager {
    producer: RouterSocket,
    consumer: StreamSocket,
    monitor: RouterSocket,
    store: Arc<Store>,
    cluster: ClusterView,
    acks: AckWaitTable,
    shutdown: Shutdown,
}

impl Manager {
    pub fn new(
        producer: RouterSocket,
        consumer: StreamSocket,
        monitor: RouterSocket,
        store: Arc<Store>,
        cluster: ClusterView,
        timeout_replication: u64,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            producer,
            consumer,
            monitor,
            store,
            cluster,
            acks: AckWaitTable::new(timeout_replication),
            shutdown,
        }
    }

    /// Bind all listening sockets and connect the cluster links.
    pub fn bind(config: &Config, store: Arc<Store>, shutdown: Shutdown) -> std::io::Result<Self> {
        let producer = RouterSocket::bind(&config.receive_addr)?;
        let consumer = StreamSocket::bind(&config.send_addr, DISPATCH_CAP as usize)?;
        let monitor = RouterSocket::bind(&config.monitor_addr)?;
        let cluster = ClusterView::connect(&config.cluster, microsecond_timestamp())?;
        tracing::info!(
            receive = %config.receive_addr,
            send = %config.send_addr,
            monitor = %config.monitor_addr,
            "broker listening"
        );
        Ok(Self::new(
            producer,
            consumer,
            monitor,
            store,
            cluster,
            config.cluster.timeout_replication,
            shutdown,
        ))
    }

    pub fn run(&mut self) {
        tracing::info!(
            node = self.cluster.node_name(),
            replicas = self.cluster.replicas_configured(),
            "broker manager running"
        );
        while !self.shutdown.is_cancelled() {
            self.tick();
        }
        tracing::info!("broker manager stopped");
    }

    /// One poll-and-drain cycle. Exposed for deterministic tests.
    pub fn tick(&mut self) {
        let timeout = self.poll_timeout();
        {
            let mut sel = Select::new();
            sel.recv(self.producer.receiver());
            sel.recv(self.consumer.receiver());
            sel.recv(self.monitor.receiver());
            sel.recv(self.cluster.ack_receiver());
            sel.recv(self.cluster.sub_receiver());
            let _ = sel.ready_timeout(timeout);
        }

        let producer_rx = self.producer.receiver().clone();
        while let Ok(frames) = producer_rx.try_recv() {
            self.handle_producer(frames);
        }
        let consumer_rx = self.consumer.receiver().clone();
        while let Ok(frames) = consumer_rx.try_recv() {
            self.handle_consumer_ack(&frames);
        }
        let monitor_rx = self.monitor.receiver().clone();
        while let Ok(frames) = monitor_rx.try_recv() {
            self.handle_monitor(&frames);
        }
        let ack_rx = self.cluster.ack_receiver().clone();
        while let Ok(frames) = ack_rx.try_recv() {
            self.cluster.handle_ack(&frames, &mut self.acks, &self.producer);
        }
        let sub_rx = self.cluster.sub_receiver().clone();
        while let Ok(frames) = sub_rx.try_recv() {
            self.cluster.handle_nodes_message(&frames, &self.store);
        }

        dispatch::run_pass(&self.store, &self.consumer, &self.cluster);
        self.expire_overdue_acks();

        if self.cluster.enabled() {
            let now = microsecond_timestamp();
            if self.cluster.broadcast_due(now) {
                self.cluster.broadcast_keep_alive(now);
            }
            if self.cluster.node_overdue(now) {
                tracing::warn!("peer node timed out, rescanning for orphaned replica copies");
                self.cluster.enter_timeout_state();
                self.store.reset_cursor();
            }
        }
    }

    /// Time until the nearest piece of timed work, floored at zero.
    fn poll_timeout(&self) -> Duration {
        let now = microsecond_timestamp();
        let mut delay = if self.store.messages_pending() {
            BUSY_POLL_MICROS
        } else {
            IDLE_POLL_MICROS
        };
        if let Some(d) = self.acks.next_deadline_delta(now) {
            delay = delay.min(d);
        }
        if self.cluster.enabled() {
            delay = delay.min(self.cluster.delay_until_next_broadcast(now));
            if let Some(d) = self.cluster.delay_until_next_node_timeout(now) {
                delay = delay.min(d);
            }
        }
        Duration::from_micros(delay.max(0) as u64)
    }

    fn send_producer_reply(&self, frames: Frames) {
        if let Err(e) = self.producer.send(frames) {
            tracing::debug!("producer reply failed: {e}");
        }
    }

    fn handle_producer(&mut self, frames: Frames) {
        let request = match wire::parse_producer(&frames) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("malformed producer request: {e}");
                if frames.len() >= 2 {
                    let peer = frames.get(0).cloned().unwrap_or_default();
                    let id = frames.get(1).cloned().unwrap_or_default();
                    self.send_producer_reply(wire::build_producer_ack(
                        &peer,
                        &id,
                        STATUS_FAIL,
                        Some(&e.to_string()),
                    ));
                }
                return;
            }
        };

        if let Some(owner) = request.replica_owner.clone() {
            self.handle_replica_write(&request, &owner);
            return;
        }

        let key = match self.store.save(&request.payload, None) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("store save failed: {e}");
                self.send_producer_reply(wire::build_producer_ack(
                    &request.peer,
                    &request.id,
                    STATUS_FAIL,
                    Some(&e.to_string()),
                ));
                return;
            }
        };

        let ack = wire::build_producer_ack(&request.peer, &request.id, STATUS_OK, None);
        if !self.cluster.enabled() {
            self.send_producer_reply(ack);
            return;
        }

        let wanted = self.cluster.replicas_configured();
        let now = microsecond_timestamp();
        let active = self.cluster.count_active_nodes(now);
        let fan_out = wanted.min(active);
        if fan_out == 0 {
            tracing::warn!(key = %key, "no active peers, acking without replication");
            self.send_producer_reply(ack);
            return;
        }
        if fan_out < wanted {
            tracing::warn!(key = %key, wanted, active, "degraded replication fan-out");
        }

        let replica = self.cluster.create_replica(&key, &request.payload);
        let mut sent = 0u32;
        for _ in 0..fan_out {
            match self.cluster.send_replica(replica.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(key = %key, "replica send failed: {e}");
                    break;
                }
            }
        }
        if sent == 0 {
            tracing::warn!(key = %key, "replica links down, acking without replication");
            self.send_producer_reply(ack);
        } else {
            // Producer ack is withheld until every sent copy is confirmed.
            self.acks.push(key.to_string(), ack, sent);
        }
    }

    /// Store a relayed copy under the owner's key and ack over the same
    /// connection; the peer's dealer link reads that ack as a replica ack.
    fn handle_replica_write(&mut self, request: &ProducerRequest, owner: &str) {
        let key = std::str::from_utf8(&request.id)
            .ok()
            .and_then(|s| s.parse::<RecordKey>().ok());
        let Some(key) = key else {
            tracing::warn!(%owner, "replica write with an unusable key");
            self.send_producer_reply(wire::build_producer_ack(
                &request.peer,
                &request.id,
                STATUS_FAIL,
                Some("bad replica key"),
            ));
            return;
        };

        match self.store.save(&request.payload, Some(key)) {
            Ok(key) => {
                tracing::debug!(key = %key, %owner, "stored replica copy");
                self.send_producer_reply(wire::build_producer_ack(
                    &request.peer,
                    &request.id,
                    STATUS_OK,
                    None,
                ));
            }
            Err(e) => {
                tracing::error!(%owner, "replica store failed: {e}");
                self.send_producer_reply(wire::build_producer_ack(
                    &request.peer,
                    &request.id,
                    STATUS_FAIL,
                    Some(&e.to_string()),
                ));
            }
        }
    }

    fn handle_consumer_ack(&mut self, frames: &Frames) {
        let (id, positive) = match wire::parse_consumer_ack(frames) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("malformed consumer ack: {e}");
                return;
            }
        };
        let Ok(key) = id.parse::<RecordKey>() else {
            tracing::warn!(%id, "consumer ack with an unusable key");
            return;
        };

        if positive {
            match self.store.remove(&key) {
                Ok(()) => {
                    if self.cluster.enabled() {
                        self.cluster.broadcast_remove(&id);
                    }
                }
                Err(StoreError::KeyNotFound { .. }) => {
                    tracing::debug!(%id, "ack for an already removed message");
                }
                Err(e) => tracing::warn!(%id, "remove failed: {e}"),
            }
        } else {
            // The message stays durable and returns to pending.
            self.store.remove_inflight_only(&key);
            tracing::debug!(%id, "negative consumer ack");
        }
    }

    fn handle_monitor(&mut self, frames: &Frames) {
        let Some(peer) = wire::parse_monitor_request(frames) else {
            tracing::debug!("unrecognized monitor command");
            return;
        };
        let reply = wire::build_monitor_reply(&peer, &self.monitor_snapshot());
        if let Err(e) = self.monitor.send(reply) {
            tracing::debug!("monitor reply failed: {e}");
        }
    }

    fn monitor_snapshot(&self) -> String {
        format!(
            "messages: {}\nmessages_inflight: {}\ndb_size: {}\ninflight_db_size: {}\nsyncs: {}\nexpired_messages: {}\n",
            self.store.messages(),
            self.store.messages_in_flight(),
            self.store.db_size(),
            self.store.inflight_db_size(),
            self.store.num_syncs(),
            self.store.num_expired(),
        )
    }

    /// Fail quorums whose replication deadline passed: the buffered ack goes
    /// out with a trailing failure marker and the message stays durable
    /// locally, so delivery degrades to unreplicated rather than lost.
    fn expire_overdue_acks(&mut self) {
        let now = microsecond_timestamp();
        while let Some(mut buffered) = self.acks.pop_expired(now) {
            tracing::warn!("replica quorum timed out");
            buffered.push(REPLICATION_FAILED);
            if let Err(e) = self.producer.send(buffered) {
                tracing::debug!("replication failure reply failed: {e}");
            }
        }
    }
}
