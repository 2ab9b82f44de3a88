//! Network devices for a bm-sbc mesh node.
//!
//! The mesh stack above this crate talks to exactly one [`NetworkDevice`]:
//! a set of numbered ports, a send surface, and a pair of callbacks
//! (receive, link change) installed by the stack. Two devices exist:
//!
//! - [`vpd::VirtualPortDevice`] — up to fifteen per-peer virtual ports over
//!   Unix datagram sockets, one port per directly-connected local process.
//! - [`gateway::GatewayDevice`] — composes a virtual-port device with a
//!   serial [`uart::UartTransport`], presenting N local ports plus one
//!   serial port behind a single device surface.
//!
//! ## Callback discipline
//!
//! Callback dispatch never happens with a device lock held: the handler is
//! snapshotted under the lock and invoked after release. Handlers are free
//! to re-enter the device (a receive handler may call `send`).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gateway;
pub mod uart;
pub mod vpd;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Hard cap on per-peer virtual ports; the port number must fit the
/// protocol's 4-bit field, with 0 reserved for flooding.
pub const MAX_VIRTUAL_PORTS: usize = 15;

/// Smallest L2 frame: destination + source address + ethertype.
pub const MIN_L2_FRAME: usize = 14;

/// Largest L2 frame accepted by the local datagram transport.
pub const MAX_DATAGRAM_FRAME: usize = 1514;

/// Maximum Unix socket path length, NUL terminator included.
pub const MAX_SOCKET_PATH: usize = 108;

/// Socket file for the node with the given identifier.
///
/// The name embeds the identifier as sixteen lowercase hex digits so peers
/// can derive each other's paths from the launch topology alone.
pub fn socket_path(dir: &Path, node_id: u64) -> PathBuf {
    dir.join(format!("bm_sbc_{node_id:016x}.sock"))
}

/// Network device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Rejected input: bad port number, empty or oversize frame,
    /// inactive slot
    #[error("invalid argument")]
    InvalidArgument,

    /// Socket or descriptor failure
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port open/configuration failure
    #[error("serial failure: {0}")]
    Serial(String),

    /// Bit rate outside the supported set
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),

    /// Frame failed wire encoding
    #[error("framing: {0}")]
    Wire(#[from] bm_wire::WireError),
}

/// Destination selector for [`NetworkDevice::send`].
///
/// The wire encodes "all ports" as port byte 0; that sentinel never leaves
/// the send path, so the API keeps it out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPort {
    /// Deliver to every active port.
    Flood,
    /// Deliver to a single 1-based port.
    Port(u8),
}

/// Callbacks installed by the mesh stack.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// A frame arrived on `port`.
    async fn receive(&self, port: u8, frame: &[u8]);

    /// The link on `port` came up or went down.
    async fn link_change(&self, port: u8, up: bool);
}

/// Shared slot for the installed [`DeviceHandler`].
///
/// The virtual-port device and the gateway composite share one cell, so
/// frames received by either reach whatever handler the stack installed
/// last. [`CallbackCell::snapshot`] clones the handle under the lock;
/// callers dispatch on the clone with the lock released.
#[derive(Clone, Default)]
pub struct CallbackCell(Arc<Mutex<Option<Arc<dyn DeviceHandler>>>>);

impl CallbackCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the handler.
    pub fn install(&self, handler: Arc<dyn DeviceHandler>) {
        *self.0.lock().unwrap() = Some(handler);
    }

    /// Clone the current handler out of the cell.
    pub fn snapshot(&self) -> Option<Arc<dyn DeviceHandler>> {
        self.0.lock().unwrap().clone()
    }
}

/// Per-port traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Frames handed to the kernel for this port.
    pub tx_frames: u64,
    /// Send attempts that failed.
    pub tx_errors: u64,
    /// Frames delivered to the receive callback from this port.
    pub rx_frames: u64,
}

/// One mesh-facing network device.
#[async_trait]
pub trait NetworkDevice: Send + Sync {
    /// Number of ports this device presents.
    fn num_ports(&self) -> u8;

    /// Install the stack's callbacks.
    fn set_handler(&self, handler: Arc<dyn DeviceHandler>);

    /// Send an L2 frame out of `port`.
    async fn send(&self, frame: &[u8], port: SendPort) -> Result<(), DeviceError>;

    /// Bind resources and start the receive worker.
    ///
    /// Does not signal link-up for any port; links come up through
    /// [`NetworkDevice::retry_negotiation`].
    async fn enable(&self) -> Result<(), DeviceError>;

    /// Stop the receive worker, release resources, and signal link-down for
    /// every active port.
    async fn disable(&self) -> Result<(), DeviceError>;

    /// Administratively bring one port up.
    async fn enable_port(&self, port: u8) -> Result<(), DeviceError>;

    /// Administratively take one port down.
    async fn disable_port(&self, port: u8) -> Result<(), DeviceError>;

    /// Try to bring up a port whose peer was not reachable at enable time.
    ///
    /// Returns `true` once the peer is (or already was) connected, so the
    /// caller's retry timer can stop.
    async fn retry_negotiation(&self, port: u8) -> Result<bool, DeviceError>;

    /// Traffic counters for one port.
    fn port_stats(&self, port: u8) -> Result<PortStats, DeviceError>;
}
