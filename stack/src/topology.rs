//! Port-indexed view of the direct neighborhood.
//!
//! Fed by the control-message protocol; queried by applications that want
//! to know who sits behind which port.

use crate::bcmp::Bcmp;
use crate::StackError;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Who is reachable through each device port.
pub struct Topology {
    /// Index `i` is port `i + 1`.
    ports: Mutex<Vec<Option<u64>>>,
}

impl Topology {
    /// Build the table for `num_ports` ports and wire it to discovery.
    pub fn init(bcmp: &Bcmp, num_ports: u8) -> Result<Arc<Self>, StackError> {
        let topology = Arc::new(Self {
            ports: Mutex::new(vec![None; usize::from(num_ports)]),
        });
        bcmp.attach_topology(topology.clone());
        debug!("topology: tracking {num_ports} ports");
        Ok(topology)
    }

    /// Number of tracked ports.
    pub fn num_ports(&self) -> u8 {
        self.ports.lock().unwrap().len() as u8
    }

    /// Record the node behind `port`.
    pub fn record(&self, port: u8, node_id: u64) {
        if let Some(slot) = port_slot(&mut self.ports.lock().unwrap(), port) {
            *slot = Some(node_id);
        }
    }

    /// Forget the node behind `port`.
    pub fn clear(&self, port: u8) {
        if let Some(slot) = port_slot(&mut self.ports.lock().unwrap(), port) {
            *slot = None;
        }
    }

    /// The node behind `port`, if known.
    pub fn neighbor_on(&self, port: u8) -> Option<u64> {
        let ports = self.ports.lock().unwrap();
        ports
            .get(usize::from(port).checked_sub(1)?)
            .copied()
            .flatten()
    }

    /// Every known `(port, node)` pair, in port order.
    pub fn neighbors(&self) -> Vec<(u8, u64)> {
        self.ports
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.map(|node_id| (idx as u8 + 1, node_id)))
            .collect()
    }
}

fn port_slot(ports: &mut [Option<u64>], port: u8) -> Option<&mut Option<u64>> {
    ports.get_mut(usize::from(port).checked_sub(1)?)
}
