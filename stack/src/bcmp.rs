//! Control-message protocol: neighbor discovery, echo, renegotiation.
//!
//! Every node floods periodic heartbeats carrying its 64-bit identifier and
//! a sequence number. The first heartbeat from a node establishes it as a
//! neighbor; silence past the configured timeout retires it. An echo
//! request/reply pair rides the same ethertype for reachability probes.
//!
//! Neighbors are keyed by node identifier, not ingress port: the port byte
//! on the local datagram fabric is the sender's egress slot, so two
//! neighbors of a multi-peer node can legitimately arrive with the same
//! ingress number. Directed replies therefore go out as address-filtered
//! floods; every peer's L2 sees them, only the addressee keeps them.
//!
//! Discovery does not wait for link-up events: a per-port retry loop calls
//! [`bm_net::NetworkDevice::retry_negotiation`] every second until the port
//! connects, which is what brings up peers that started late. The device
//! intentionally never signals link-up from `enable`, so this loop is the
//! only path to a connected port.

use crate::l2::{L2Addr, L2Protocol, ETHERTYPE_BCMP, L2};
use crate::topology::Topology;
use crate::StackError;
use async_trait::async_trait;
use bm_net::SendPort;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MSG_HEARTBEAT: u8 = 0x01;
const MSG_ECHO_REQUEST: u8 = 0x02;
const MSG_ECHO_REPLY: u8 = 0x03;

/// Message kind + node identifier + sequence number.
const MESSAGE_LEN: usize = 1 + 8 + 4;

/// Cadence of the per-port reconnect poll.
const RENEGOTIATE_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the neighbor expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs for discovery.
#[derive(Debug, Clone)]
pub struct BcmpConfig {
    /// Interval between heartbeat floods.
    pub heartbeat_interval: Duration,
    /// Silence after which a neighbor is considered gone.
    pub neighbor_timeout: Duration,
}

impl Default for BcmpConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            neighbor_timeout: Duration::from_secs(30),
        }
    }
}

/// A directly-connected node.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighbor's identifier.
    pub node_id: u64,
    /// Ingress port of its most recent message.
    pub port: u8,
    /// When it was last heard from.
    pub last_seen: Instant,
}

/// Invoked with `true` when a neighbor appears and `false` when it goes.
pub type DiscoveryCallback = Arc<dyn Fn(bool, &Neighbor) + Send + Sync>;

/// Discovery state and the workers driving it.
pub struct Bcmp {
    l2: Arc<L2>,
    cfg: BcmpConfig,
    neighbors: Mutex<HashMap<u64, Neighbor>>,
    callbacks: Mutex<Vec<DiscoveryCallback>>,
    topology: Mutex<Option<Arc<Topology>>>,
    seq: AtomicU32,
}

impl Bcmp {
    /// Register on the BCMP ethertype and start the heartbeat, sweep, and
    /// renegotiation workers.
    pub async fn init(l2: Arc<L2>, cfg: BcmpConfig) -> Result<Arc<Self>, StackError> {
        let bcmp = Arc::new(Self {
            l2: l2.clone(),
            cfg,
            neighbors: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            topology: Mutex::new(None),
            seq: AtomicU32::new(0),
        });
        l2.register(ETHERTYPE_BCMP, bcmp.clone());

        tokio::spawn(heartbeat_loop(bcmp.clone()));
        tokio::spawn(sweep_loop(bcmp.clone()));
        tokio::spawn(renegotiation_loop(bcmp.clone()));
        Ok(bcmp)
    }

    /// Register a callback for neighbor up/down transitions.
    pub fn register_discovery_callback(&self, callback: DiscoveryCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Wire the topology table that mirrors the neighbor state.
    pub fn attach_topology(&self, topology: Arc<Topology>) {
        *self.topology.lock().unwrap() = Some(topology);
    }

    /// Flood an echo request to every reachable port.
    ///
    /// Replies are logged with their sequence number.
    pub async fn send_ping(&self) -> Result<u32, StackError> {
        let seq = self.next_seq();
        self.l2
            .send(
                L2Addr::BROADCAST,
                ETHERTYPE_BCMP,
                &pack(MSG_ECHO_REQUEST, self.l2.node_id(), seq),
                SendPort::Flood,
            )
            .await?;
        Ok(seq)
    }

    /// Snapshot of the current neighbor table.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbors.lock().unwrap().values().cloned().collect()
    }

    /// Any neighbor whose traffic last arrived on `port`.
    pub fn neighbor_on(&self, port: u8) -> Option<Neighbor> {
        self.neighbors
            .lock()
            .unwrap()
            .values()
            .find(|neighbor| neighbor.port == port)
            .cloned()
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.lock().unwrap().clone()
    }

    fn fire_callbacks(&self, discovered: bool, neighbor: &Neighbor) {
        let callbacks: Vec<DiscoveryCallback> = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            callback(discovered, neighbor);
        }
    }

    async fn flood_heartbeat(&self) {
        let message = pack(MSG_HEARTBEAT, self.l2.node_id(), self.next_seq());
        if let Err(err) = self
            .l2
            .send(L2Addr::BROADCAST, ETHERTYPE_BCMP, &message, SendPort::Flood)
            .await
        {
            debug!("bcmp: heartbeat flood failed: {err}");
        }
    }

    async fn on_heartbeat(&self, port: u8, node_id: u64) {
        let discovered = {
            let mut table = self.neighbors.lock().unwrap();
            match table.get_mut(&node_id) {
                Some(known) => {
                    known.last_seen = Instant::now();
                    known.port = port;
                    None
                }
                None => {
                    let neighbor = Neighbor {
                        node_id,
                        port,
                        last_seen: Instant::now(),
                    };
                    table.insert(node_id, neighbor.clone());
                    Some(neighbor)
                }
            }
        };

        if let Some(neighbor) = discovered {
            info!("NEIGHBOR_UP node={node_id:016x} port={port}");
            if let Some(topology) = self.topology() {
                topology.record(port, node_id);
            }
            self.fire_callbacks(true, &neighbor);
            // Heartbeat back right away so the peer discovers us without
            // waiting for the next interval.
            self.flood_heartbeat().await;
        }
    }

    async fn retire_node(&self, node_id: u64, reason: &str) {
        let retired = self.neighbors.lock().unwrap().remove(&node_id);
        if let Some(neighbor) = retired {
            info!(
                "NEIGHBOR_DOWN node={node_id:016x} port={} ({reason})",
                neighbor.port
            );
            if let Some(topology) = self.topology() {
                topology.clear(neighbor.port);
            }
            self.fire_callbacks(false, &neighbor);
        }
    }
}

#[async_trait]
impl L2Protocol for Bcmp {
    async fn receive(&self, port: u8, src: L2Addr, payload: &[u8]) {
        if payload.len() < MESSAGE_LEN {
            debug!("bcmp: dropping short message ({} bytes)", payload.len());
            return;
        }
        let mut cursor = payload;
        let kind = cursor.get_u8();
        let node_id = cursor.get_u64();
        let seq = cursor.get_u32();

        match kind {
            MSG_HEARTBEAT => self.on_heartbeat(port, node_id).await,
            MSG_ECHO_REQUEST => {
                // The request itself proves the sender is alive.
                self.on_heartbeat(port, node_id).await;
                // Directed reply: flooded on the fabric, filtered by the
                // destination address at every other receiver.
                let reply = pack(MSG_ECHO_REPLY, self.l2.node_id(), seq);
                if let Err(err) = self
                    .l2
                    .send(src, ETHERTYPE_BCMP, &reply, SendPort::Flood)
                    .await
                {
                    debug!("bcmp: echo reply failed: {err}");
                }
            }
            MSG_ECHO_REPLY => {
                info!("bcmp: ping reply from={node_id:016x} bcmp_seq={seq}");
            }
            other => debug!("bcmp: unknown message kind {other:#04x}"),
        }
    }

    async fn link_change(&self, port: u8, up: bool) {
        if up {
            // Greet the fresh link immediately.
            self.flood_heartbeat().await;
        } else {
            let lost: Vec<u64> = {
                let table = self.neighbors.lock().unwrap();
                table
                    .values()
                    .filter(|neighbor| neighbor.port == port)
                    .map(|neighbor| neighbor.node_id)
                    .collect()
            };
            for node_id in lost {
                self.retire_node(node_id, "link down").await;
            }
        }
    }
}

fn pack(kind: u8, node_id: u64, seq: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MESSAGE_LEN);
    buf.put_u8(kind);
    buf.put_u64(node_id);
    buf.put_u32(seq);
    buf
}

async fn heartbeat_loop(bcmp: Arc<Bcmp>) {
    let mut interval = tokio::time::interval(bcmp.cfg.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        bcmp.flood_heartbeat().await;
    }
}

async fn sweep_loop(bcmp: Arc<Bcmp>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let expired: Vec<u64> = {
            let table = bcmp.neighbors.lock().unwrap();
            table
                .values()
                .filter(|neighbor| neighbor.last_seen.elapsed() > bcmp.cfg.neighbor_timeout)
                .map(|neighbor| neighbor.node_id)
                .collect()
        };
        for node_id in expired {
            bcmp.retire_node(node_id, "timeout").await;
        }
    }
}

async fn renegotiation_loop(bcmp: Arc<Bcmp>) {
    let device = bcmp.l2.device();
    let mut pending: Vec<u8> = (1..=bcmp.l2.num_ports()).collect();
    let mut interval = tokio::time::interval(RENEGOTIATE_INTERVAL);
    while !pending.is_empty() {
        interval.tick().await;
        let mut still_down = Vec::new();
        for port in pending {
            // Traffic on the port already proves it is connected (the
            // serial leg of a gateway never negotiates).
            if bcmp.neighbor_on(port).is_some() {
                continue;
            }
            match device.retry_negotiation(port).await {
                Ok(true) => {}
                Ok(false) => still_down.push(port),
                Err(err) => {
                    debug!("bcmp: renegotiation on port {port} failed: {err}");
                    still_down.push(port);
                }
            }
        }
        pending = still_down;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let buf = pack(MSG_ECHO_REQUEST, 0xDEAD_BEEF_0000_0001, 42);
        assert_eq!(buf.len(), MESSAGE_LEN);

        let mut cursor = &buf[..];
        assert_eq!(cursor.get_u8(), MSG_ECHO_REQUEST);
        assert_eq!(cursor.get_u64(), 0xDEAD_BEEF_0000_0001);
        assert_eq!(cursor.get_u32(), 42);
    }
}
