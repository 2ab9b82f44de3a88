//! Device assembly and the fixed stack bring-up sequence.

use crate::config::LaunchConfig;
use bm_net::gateway::{GatewayDevice, UartBridge};
use bm_net::uart::UartTransport;
use bm_net::vpd::{VirtualPortConfig, VirtualPortDevice};
use bm_net::NetworkDevice;
use bm_stack::bcmp::{Bcmp, BcmpConfig};
use bm_stack::l2::L2;
use bm_stack::pubsub::PubSub;
use bm_stack::topology::Topology;
use bm_stack::{ip, middleware, service, StackError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// One initialization step of the upper stack gave up.
///
/// The stage number doubles as the process exit code.
#[derive(Error, Debug)]
#[error("{name} init failed: {source}")]
pub struct StartupError {
    stage: u8,
    name: &'static str,
    #[source]
    source: StackError,
}

impl StartupError {
    /// 1-based index of the failed stage in the bring-up order.
    pub fn stage(&self) -> u8 {
        self.stage
    }
}

/// Handles to the running node.
pub struct Runtime {
    /// This node's identifier.
    pub node_id: u64,
    /// The network device carrying all mesh traffic.
    pub device: Arc<dyn NetworkDevice>,
    /// L2 dispatch.
    pub l2: Arc<L2>,
    /// Neighbor discovery and echo.
    pub bcmp: Arc<Bcmp>,
    /// Port-indexed neighbor table.
    pub topology: Arc<Topology>,
    /// Publish/subscribe endpoint.
    pub pubsub: Arc<PubSub>,
}

/// Build the network device and run the bring-up sequence, halting on the
/// first failing stage.
pub async fn start(cfg: &LaunchConfig) -> anyhow::Result<Runtime> {
    let device = build_device(cfg)?;

    let stage = |stage: u8, name: &'static str| {
        move |source: StackError| StartupError {
            stage,
            name,
            source,
        }
    };

    let l2 = L2::init(device.clone(), cfg.node_id)
        .await
        .map_err(stage(1, "l2"))?;
    ip::init().map_err(stage(2, "ip"))?;
    let bcmp = Bcmp::init(
        l2.clone(),
        BcmpConfig {
            heartbeat_interval: cfg.heartbeat_interval,
            neighbor_timeout: cfg.neighbor_timeout,
        },
    )
    .await
    .map_err(stage(3, "bcmp"))?;
    let topology = Topology::init(&bcmp, l2.num_ports()).map_err(stage(4, "topology"))?;
    service::init().map_err(stage(5, "service"))?;
    let pubsub = PubSub::init(l2.clone()).map_err(stage(6, "pubsub"))?;
    middleware::init().map_err(stage(7, "middleware"))?;

    info!("stack initialized");
    Ok(Runtime {
        node_id: cfg.node_id,
        device,
        l2,
        bcmp,
        topology,
        pubsub,
    })
}

/// Virtual ports alone, or the gateway composite when a serial line is
/// configured.
fn build_device(cfg: &LaunchConfig) -> anyhow::Result<Arc<dyn NetworkDevice>> {
    let vpd = Arc::new(VirtualPortDevice::new(VirtualPortConfig {
        node_id: cfg.node_id,
        peers: cfg.peers.clone(),
        socket_dir: cfg.socket_dir.clone(),
    }));

    let Some(uart_cfg) = &cfg.uart else {
        return Ok(vpd);
    };

    let serial_port = vpd.num_ports() + 1;
    let bridge = Arc::new(UartBridge::new(vpd.callback_cell(), serial_port));
    let uart = UartTransport::open(uart_cfg, bridge).map_err(|err| {
        error!("UART transport init failed: {err}");
        err
    })?;
    info!(
        "gateway: port {serial_port} is {} at {} baud",
        uart_cfg.path, uart_cfg.baud
    );
    Ok(Arc::new(GatewayDevice::new(vpd, uart)))
}
