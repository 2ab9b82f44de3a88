//! Virtual-port network device over Unix datagram sockets.
//!
//! Each directly-connected local peer occupies one slot in a fixed peer
//! table; slot `i` is port `i + 1`. Every process binds one receive socket
//! at a path derived from its own node identifier, and holds one unbound
//! sending socket per peer. A datagram carries a single port byte — the
//! sender's egress port, which is by construction the receiver's ingress
//! port — followed by the raw L2 frame.
//!
//! Ports do not come up in [`VirtualPortDevice::enable`]: the stack above
//! arms its renegotiation timers concurrently with `enable`, and a link-up
//! fired here could land before those timers exist and would never be
//! re-delivered. [`VirtualPortDevice::retry_negotiation`] is the only
//! source of link-up events.

use crate::{
    socket_path, CallbackCell, DeviceError, DeviceHandler, NetworkDevice, PortStats, SendPort,
    MAX_DATAGRAM_FRAME, MAX_VIRTUAL_PORTS, MIN_L2_FRAME,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UnixDatagram;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Launch topology for one virtual-port device.
#[derive(Debug, Clone)]
pub struct VirtualPortConfig {
    /// This process's node identifier.
    pub node_id: u64,
    /// Peer node identifiers, in declared order; peer `i` gets port `i + 1`.
    pub peers: Vec<u64>,
    /// Directory holding the datagram socket files.
    pub socket_dir: PathBuf,
}

#[derive(Default)]
struct PortCounters {
    tx_frames: AtomicU64,
    tx_errors: AtomicU64,
    rx_frames: AtomicU64,
}

struct PeerSlot {
    node_id: u64,
    sock_path: PathBuf,
    active: bool,
    /// Unbound sending socket; `None` until the peer negotiates or the
    /// port is administratively enabled.
    tx: Option<Arc<UnixDatagram>>,
    /// Link-up has been signalled for this slot.
    link_up: bool,
}

struct VpdState {
    slots: Vec<PeerSlot>,
    rx: Option<Arc<UnixDatagram>>,
    enabled: bool,
    running: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

/// Local-IPC network device with one virtual port per declared peer.
pub struct VirtualPortDevice {
    node_id: u64,
    own_path: PathBuf,
    state: Mutex<VpdState>,
    counters: Arc<Vec<PortCounters>>,
    callbacks: CallbackCell,
}

impl VirtualPortDevice {
    /// Build the device from the launch topology.
    ///
    /// Port numbers are assigned in declared order and stay fixed for the
    /// device's lifetime. Declaring more than [`MAX_VIRTUAL_PORTS`] peers
    /// keeps the first fifteen and drops the rest with a warning.
    pub fn new(cfg: VirtualPortConfig) -> Self {
        let mut peers = cfg.peers;
        if peers.len() > MAX_VIRTUAL_PORTS {
            warn!(
                "vpd: peer count {} exceeds cap {}",
                peers.len(),
                MAX_VIRTUAL_PORTS
            );
            peers.truncate(MAX_VIRTUAL_PORTS);
        }

        let slots: Vec<PeerSlot> = peers
            .iter()
            .map(|&node_id| PeerSlot {
                node_id,
                sock_path: socket_path(&cfg.socket_dir, node_id),
                active: node_id != 0,
                tx: None,
                link_up: false,
            })
            .collect();
        // Counters cover the full port range: the ingress port byte is the
        // remote sender's egress slot, which can exceed our own slot count.
        let counters: Arc<Vec<PortCounters>> = Arc::new(
            (0..MAX_VIRTUAL_PORTS)
                .map(|_| PortCounters::default())
                .collect(),
        );

        Self {
            node_id: cfg.node_id,
            own_path: socket_path(&cfg.socket_dir, cfg.node_id),
            state: Mutex::new(VpdState {
                slots,
                rx: None,
                enabled: false,
                running: None,
                worker: None,
            }),
            counters,
            callbacks: CallbackCell::new(),
        }
    }

    /// This process's node identifier.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// The callback cell, for composition with a gateway device.
    pub fn callback_cell(&self) -> CallbackCell {
        self.callbacks.clone()
    }

    /// Node identifier of the peer behind `port`, if that slot is active.
    pub fn peer_id(&self, port: u8) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .get(usize::from(port).checked_sub(1)?)
            .filter(|slot| slot.active)
            .map(|slot| slot.node_id)
    }

    fn slot_index(&self, port: u8) -> Result<usize, DeviceError> {
        if port == 0 || usize::from(port) > MAX_VIRTUAL_PORTS {
            return Err(DeviceError::InvalidArgument);
        }
        Ok(usize::from(port) - 1)
    }
}

#[async_trait]
impl NetworkDevice for VirtualPortDevice {
    fn num_ports(&self) -> u8 {
        // Always the full range: port numbers on received datagrams are
        // assigned by the sender and are independent of how many peers
        // this process declared.
        MAX_VIRTUAL_PORTS as u8
    }

    fn set_handler(&self, handler: Arc<dyn DeviceHandler>) {
        self.callbacks.install(handler);
    }

    async fn send(&self, frame: &[u8], port: SendPort) -> Result<(), DeviceError> {
        if frame.is_empty() || frame.len() > MAX_DATAGRAM_FRAME {
            return Err(DeviceError::InvalidArgument);
        }

        match port {
            SendPort::Port(port) => {
                let idx = self.slot_index(port)?;
                let (tx, path) = {
                    let state = self.state.lock().unwrap();
                    let slot = state.slots.get(idx).ok_or(DeviceError::InvalidArgument)?;
                    if !slot.active {
                        return Err(DeviceError::InvalidArgument);
                    }
                    let tx = slot.tx.clone().ok_or(DeviceError::InvalidArgument)?;
                    (tx, slot.sock_path.clone())
                };

                let mut datagram = Vec::with_capacity(1 + frame.len());
                datagram.push(port);
                datagram.extend_from_slice(frame);

                match tx.send_to(&datagram, &path).await {
                    Ok(_) => {
                        self.counters[idx].tx_frames.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(err) => {
                        self.counters[idx].tx_errors.fetch_add(1, Ordering::Relaxed);
                        Err(DeviceError::Io(err))
                    }
                }
            }
            SendPort::Flood => {
                // Slots whose sender is closed are administratively down
                // and skipped; failures on open slots do not stop the walk.
                let targets: Vec<(usize, Arc<UnixDatagram>, PathBuf)> = {
                    let state = self.state.lock().unwrap();
                    state
                        .slots
                        .iter()
                        .enumerate()
                        .filter(|(_, slot)| slot.active)
                        .filter_map(|(idx, slot)| {
                            slot.tx
                                .clone()
                                .map(|tx| (idx, tx, slot.sock_path.clone()))
                        })
                        .collect()
                };

                let mut datagram = Vec::with_capacity(1 + frame.len());
                datagram.push(0);
                datagram.extend_from_slice(frame);

                let mut failures = 0usize;
                for (idx, tx, path) in targets {
                    datagram[0] = idx as u8 + 1;
                    match tx.send_to(&datagram, &path).await {
                        Ok(_) => {
                            self.counters[idx].tx_frames.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            debug!("vpd: flood send on port {} failed: {err}", idx + 1);
                            self.counters[idx].tx_errors.fetch_add(1, Ordering::Relaxed);
                            failures += 1;
                        }
                    }
                }

                if failures > 0 {
                    Err(DeviceError::Io(std::io::Error::other(format!(
                        "flood delivery failed on {failures} port(s)"
                    ))))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn enable(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            return Ok(());
        }

        // A previous instance of this node may have leaked its socket
        // file; the bind below fails unless it is gone.
        match std::fs::remove_file(&self.own_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(DeviceError::Io(err)),
        }

        let rx = Arc::new(UnixDatagram::bind(&self.own_path)?);
        for slot in state.slots.iter_mut().filter(|slot| slot.active) {
            if slot.tx.is_none() {
                slot.tx = Some(Arc::new(UnixDatagram::unbound()?));
            }
        }

        let (running_tx, running_rx) = watch::channel(true);
        state.rx = Some(rx.clone());
        state.running = Some(running_tx);
        state.worker = Some(tokio::spawn(recv_loop(
            rx,
            running_rx,
            self.callbacks.clone(),
            self.counters.clone(),
        )));
        state.enabled = true;
        drop(state);

        debug!("vpd: enabled, listening on {}", self.own_path.display());
        Ok(())
    }

    async fn disable(&self) -> Result<(), DeviceError> {
        let (worker, down_ports) = {
            let mut state = self.state.lock().unwrap();
            if !state.enabled {
                return Ok(());
            }
            state.enabled = false;
            if let Some(running) = state.running.take() {
                let _ = running.send(false);
            }
            state.rx = None;

            let mut down_ports = Vec::new();
            for (idx, slot) in state.slots.iter_mut().enumerate() {
                if slot.active {
                    slot.tx = None;
                    slot.link_up = false;
                    down_ports.push(idx as u8 + 1);
                }
            }
            (state.worker.take(), down_ports)
        };

        if let Some(worker) = worker {
            let _ = worker.await;
        }

        if let Some(handler) = self.callbacks.snapshot() {
            for port in down_ports {
                handler.link_change(port, false).await;
            }
        }
        Ok(())
    }

    async fn enable_port(&self, port: u8) -> Result<(), DeviceError> {
        let idx = self.slot_index(port)?;
        {
            let mut state = self.state.lock().unwrap();
            let slot = state
                .slots
                .get_mut(idx)
                .ok_or(DeviceError::InvalidArgument)?;
            if !slot.active {
                return Err(DeviceError::InvalidArgument);
            }
            if slot.tx.is_none() {
                slot.tx = Some(Arc::new(UnixDatagram::unbound()?));
            }
            slot.link_up = true;
        }
        if let Some(handler) = self.callbacks.snapshot() {
            handler.link_change(port, true).await;
        }
        Ok(())
    }

    async fn disable_port(&self, port: u8) -> Result<(), DeviceError> {
        let idx = self.slot_index(port)?;
        {
            let mut state = self.state.lock().unwrap();
            let slot = state
                .slots
                .get_mut(idx)
                .ok_or(DeviceError::InvalidArgument)?;
            if !slot.active {
                return Err(DeviceError::InvalidArgument);
            }
            slot.tx = None;
            slot.link_up = false;
        }
        if let Some(handler) = self.callbacks.snapshot() {
            handler.link_change(port, false).await;
        }
        Ok(())
    }

    async fn retry_negotiation(&self, port: u8) -> Result<bool, DeviceError> {
        let idx = self.slot_index(port)?;
        let emit_link_up = {
            let mut state = self.state.lock().unwrap();
            let Some(slot) = state.slots.get_mut(idx) else {
                return Ok(false);
            };
            if !slot.active {
                return Ok(false);
            }
            if !slot.sock_path.exists() {
                // Peer has not bound its receive socket yet.
                return Ok(false);
            }
            if slot.tx.is_none() {
                slot.tx = Some(Arc::new(UnixDatagram::unbound()?));
            }
            let first = !slot.link_up;
            slot.link_up = true;
            first
        };

        if emit_link_up {
            if let Some(handler) = self.callbacks.snapshot() {
                handler.link_change(port, true).await;
            }
        }
        // Still true on repeat calls so the caller's retry timer stops.
        Ok(true)
    }

    fn port_stats(&self, port: u8) -> Result<PortStats, DeviceError> {
        let idx = self.slot_index(port)?;
        let counters = self.counters.get(idx).ok_or(DeviceError::InvalidArgument)?;
        Ok(PortStats {
            tx_frames: counters.tx_frames.load(Ordering::Relaxed),
            tx_errors: counters.tx_errors.load(Ordering::Relaxed),
            rx_frames: counters.rx_frames.load(Ordering::Relaxed),
        })
    }
}

async fn recv_loop(
    rx: Arc<UnixDatagram>,
    mut running: watch::Receiver<bool>,
    callbacks: CallbackCell,
    counters: Arc<Vec<PortCounters>>,
) {
    let mut buf = vec![0u8; 1 + MAX_DATAGRAM_FRAME];
    loop {
        tokio::select! {
            biased;
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            result = rx.recv(&mut buf) => {
                let len = match result {
                    Ok(len) => len,
                    Err(err) if err.kind() == ErrorKind::Interrupted
                        || err.kind() == ErrorKind::WouldBlock => continue,
                    Err(err) => {
                        error!("vpd: receive failed: {err}");
                        break;
                    }
                };

                if len < 1 + MIN_L2_FRAME {
                    debug!("vpd: dropping runt datagram ({len} bytes)");
                    continue;
                }
                let port = buf[0];
                if port == 0 || usize::from(port) > MAX_VIRTUAL_PORTS {
                    debug!("vpd: dropping datagram with bad port byte {port}");
                    continue;
                }

                counters[usize::from(port) - 1]
                    .rx_frames
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(handler) = callbacks.snapshot() {
                    handler.receive(port, &buf[1..len]).await;
                }
            }
        }
    }
}
