//! Cluster membership and replication plumbing.
//!
//! One `ClusterView` tracks peer liveness from keepalives on the broadcast
//! bus, fans replica copies out over the dealer link, and settles pending
//! producer acks as replica confirmations arrive. A node is active while
//! its last keepalive is younger than `timeout_nodes`; replica copies owned
//! by an inactive node become eligible for local dispatch.

use std::collections::BTreeMap;

use crossbeam::channel::Receiver;

use crate::broker::ack_table::AckWaitTable;
use crate::config::ClusterConfig;
use crate::store::{RecordKey, Store, StoreError};
use crate::transport::{DealerSocket, PubSocket, RouterSocket, SubSocket, TransportError};
use crate::wire::{
    self, ClusterControl, Frames, CLUSTER_TOPIC, STATUS_FAIL,
};

pub struct ClusterView {
    node: String,
    replicas: u32,
    timeout_nodes: u64,
    /// Last keepalive per peer node, microseconds.
    nodes: BTreeMap<String, u64>,
    /// Set after a node timeout until the next keepalive arrives. Suppresses
    /// repeated timeout handling for the same outage.
    in_timeout_state: bool,
    next_broadcast: u64,
    replica_link: DealerSocket,
    bus_pub: PubSocket,
    bus_sub: SubSocket,
}

impl ClusterView {
    /// Build the view with live sockets from the cluster section.
    pub fn connect(config: &ClusterConfig, now: u64) -> std::io::Result<Self> {
        let peer_addrs: Vec<String> = config.peers.iter().map(|p| p.addr.clone()).collect();
        let peer_buses: Vec<String> = config
            .peers
            .iter()
            .map(|p| p.broadcast_addr.clone())
            .collect();

        let replica_link = DealerSocket::connect(&peer_addrs);
        let bus_pub = PubSocket::bind(&config.broadcast_addr)?;
        let bus_sub = SubSocket::connect(&peer_buses, CLUSTER_TOPIC);

        Ok(Self::with_sockets(config, now, replica_link, bus_pub, bus_sub))
    }

    /// Assemble from pre-built sockets (in-memory sockets in tests).
    pub fn with_sockets(
        config: &ClusterConfig,
        now: u64,
        replica_link: DealerSocket,
        bus_pub: PubSocket,
        bus_sub: SubSocket,
    ) -> Self {
        // Configured peers start with a full keepalive window of grace.
        let nodes = config
            .peers
            .iter()
            .map(|peer| (peer.name.clone(), now))
            .collect();
        Self {
            node: config.node_name.clone(),
            replicas: config.replicas,
            timeout_nodes: config.timeout_nodes,
            nodes,
            in_timeout_state: false,
            next_broadcast: now,
            replica_link,
            bus_pub,
            bus_sub,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn replicas_configured(&self) -> u32 {
        self.replicas
    }

    /// Replication is on when the node has a name and wants copies.
    pub fn enabled(&self) -> bool {
        self.replicas > 0 && !self.node.is_empty()
    }

    pub fn ack_receiver(&self) -> &Receiver<Frames> {
        self.replica_link.receiver()
    }

    pub fn sub_receiver(&self) -> &Receiver<Frames> {
        self.bus_sub.receiver()
    }

    /// Peers whose keepalive is still fresh.
    pub fn count_active_nodes(&self, now: u64) -> u32 {
        self.nodes
            .values()
            .filter(|&&last| now.saturating_sub(last) < self.timeout_nodes)
            .count() as u32
    }

    /// A replica copy is dispatched locally only once its owner has gone
    /// quiet; while the owner is alive the copy stays parked here.
    pub fn should_dispatch_replica(&self, owner: &str, now: u64) -> bool {
        match self.nodes.get(owner) {
            Some(&last) => now.saturating_sub(last) >= self.timeout_nodes,
            None => true,
        }
    }

    /// A parked replica copy older than the node timeout is suspicious: the
    /// owner may have delivered and removed its original while our copy
    /// lingered. Ask the owner whether the message still exists.
    pub fn check_replica(&self, key: &RecordKey, owner: &str, now: u64) {
        if now.saturating_sub(key.timestamp_micros()) > self.timeout_nodes {
            self.broadcast_check(&key.to_string(), owner);
        }
    }

    /// Frame a stored message as a replica copy tagged with this node.
    pub fn create_replica(&self, key: &RecordKey, payload: &[bytes::Bytes]) -> Frames {
        wire::build_replica(&key.to_string(), &self.node, payload)
    }

    pub fn send_replica(&self, frames: Frames) -> Result<(), TransportError> {
        self.replica_link.send(frames)
    }

    /// Settle one replica ack against the pending table. Completed quorums
    /// release the buffered producer ack through the producer socket; a
    /// negative ack fails the quorum immediately. An ack for an id no longer
    /// pending tells the peers to drop their copies, since the producer has
    /// already been answered (usually with a replication failure).
    pub fn handle_ack(
        &mut self,
        frames: &Frames,
        table: &mut AckWaitTable,
        producer: &RouterSocket,
    ) {
        let (id, positive) = match wire::parse_cluster_ack(frames) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("malformed replica ack: {e}");
                return;
            }
        };

        if !table.contains(&id) {
            tracing::debug!(%id, "late replica ack, broadcasting remove");
            self.broadcast_remove(&id);
            return;
        }

        if positive {
            if let Some(buffered) = table.resolve_replica_ack(&id) {
                tracing::debug!(%id, "replica quorum complete");
                if let Err(e) = producer.send(buffered) {
                    tracing::warn!(%id, "producer ack send failed: {e}");
                }
            }
        } else if let Some(mut buffered) = table.remove(&id) {
            tracing::warn!(%id, "peer rejected replica write, failing quorum");
            buffered.set(3, STATUS_FAIL);
            buffered.push("replica write rejected");
            if let Err(e) = producer.send(buffered) {
                tracing::warn!(%id, "producer nack send failed: {e}");
            }
            self.broadcast_remove(&id);
        }
    }

    /// Apply one control frame from the broadcast bus.
    pub fn handle_nodes_message(&mut self, frames: &Frames, store: &Store) {
        if frames.text(0) != Some(CLUSTER_TOPIC) {
            tracing::debug!("dropping non-cluster frame on the bus");
            return;
        }
        let control = match wire::parse_cluster_control(frames) {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!("malformed cluster control frame: {e}");
                return;
            }
        };

        match control {
            ClusterControl::KeepAlive { node } => {
                if node == self.node {
                    return;
                }
                let now = crate::time::microsecond_timestamp();
                tracing::trace!(%node, "keepalive");
                self.nodes.insert(node, now);
                self.in_timeout_state = false;
            }
            ClusterControl::Remove { id } => {
                let Ok(key) = id.parse::<RecordKey>() else {
                    tracing::warn!(%id, "remove for unparseable key");
                    return;
                };
                match store.remove_replica_only(&key) {
                    Ok(()) => tracing::debug!(%id, "dropped replica copy"),
                    Err(StoreError::KeyNotFound { .. }) => {}
                    Err(e) => tracing::warn!(%id, "replica remove failed: {e}"),
                }
            }
            ClusterControl::Check { id, owner } => {
                if owner != self.node {
                    return;
                }
                let Ok(key) = id.parse::<RecordKey>() else {
                    tracing::warn!(%id, "check for unparseable key");
                    return;
                };
                if !store.contains(&key) {
                    tracing::debug!(%id, "checked message is gone, broadcasting remove");
                    self.broadcast_remove(&id);
                }
            }
        }
    }

    pub fn broadcast_keep_alive(&mut self, now: u64) {
        self.bus_pub.send(wire::build_keepalive(&self.node));
        self.next_broadcast = now + self.timeout_nodes / 10;
    }

    pub fn broadcast_remove(&self, id: &str) {
        self.bus_pub.send(wire::build_remove(id));
    }

    pub fn broadcast_check(&self, id: &str, owner: &str) {
        self.bus_pub.send(wire::build_check(id, owner));
    }

    pub fn broadcast_due(&self, now: u64) -> bool {
        now >= self.next_broadcast
    }

    /// Microseconds until the next keepalive is due; negative when overdue.
    pub fn delay_until_next_broadcast(&self, now: u64) -> i64 {
        self.next_broadcast as i64 - now as i64
    }

    /// Microseconds until the oldest peer keepalive crosses the node
    /// timeout. `None` while no peer is tracked or a timeout was already
    /// handled and has not recovered yet.
    pub fn delay_until_next_node_timeout(&self, now: u64) -> Option<i64> {
        if self.in_timeout_state {
            return None;
        }
        self.nodes
            .values()
            .min()
            .map(|&oldest| (oldest + self.timeout_nodes) as i64 - now as i64)
    }

    /// True when some tracked peer has missed its keepalive window and the
    /// timeout has not been handled yet.
    pub fn node_overdue(&self, now: u64) -> bool {
        !self.in_timeout_state
            && self
                .nodes
                .values()
                .any(|&last| now.saturating_sub(last) >= self.timeout_nodes)
    }

    pub fn enter_timeout_state(&mut self) {
        self.in_timeout_state = true;
    }
}
