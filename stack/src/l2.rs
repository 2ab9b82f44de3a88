//! L2 frame dispatch over the network device.
//!
//! Frames are Ethernet-shaped: 6-byte destination, 6-byte source, 2-byte
//! ethertype, payload. Addresses derive from the low 48 bits of a node
//! identifier. Inbound frames are filtered on the destination address and
//! handed to the protocol registered for their ethertype.

use crate::StackError;
use async_trait::async_trait;
use bm_net::{DeviceHandler, NetworkDevice, SendPort};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Ethertype carrying control-plane messages (heartbeats, echo).
pub const ETHERTYPE_BCMP: u16 = 0xB101;

/// Ethertype carrying pub/sub messages.
pub const ETHERTYPE_PUBSUB: u16 = 0xB102;

/// Destination + source + ethertype.
pub const L2_HEADER: usize = 14;

/// 48-bit interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct L2Addr(pub [u8; 6]);

impl L2Addr {
    /// The all-nodes address.
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// Address of the node with the given identifier (low 48 bits).
    pub fn from_node_id(node_id: u64) -> Self {
        let bytes = node_id.to_be_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[2..8]);
        Self(addr)
    }

    /// Whether this is the all-nodes address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

/// One protocol above L2, keyed by ethertype.
#[async_trait]
pub trait L2Protocol: Send + Sync {
    /// A frame for this protocol arrived on `port`.
    async fn receive(&self, port: u8, src: L2Addr, payload: &[u8]);

    /// A device port changed link state.
    async fn link_change(&self, _port: u8, _up: bool) {}
}

/// L2 dispatch: owns the device handle and the ethertype registry.
pub struct L2 {
    device: Arc<dyn NetworkDevice>,
    node_id: u64,
    local_addr: L2Addr,
    protocols: Mutex<HashMap<u16, Arc<dyn L2Protocol>>>,
}

impl L2 {
    /// Install device callbacks and enable the device.
    ///
    /// No link comes up inside this call; ports connect later through
    /// renegotiation.
    pub async fn init(
        device: Arc<dyn NetworkDevice>,
        node_id: u64,
    ) -> Result<Arc<Self>, StackError> {
        let l2 = Arc::new(Self {
            device: device.clone(),
            node_id,
            local_addr: L2Addr::from_node_id(node_id),
            protocols: Mutex::new(HashMap::new()),
        });
        device.set_handler(Arc::new(Dispatch { l2: l2.clone() }));
        device.enable().await?;
        Ok(l2)
    }

    /// This node's identifier.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// This node's interface address.
    pub fn local_addr(&self) -> L2Addr {
        self.local_addr
    }

    /// Ports presented by the underlying device.
    pub fn num_ports(&self) -> u8 {
        self.device.num_ports()
    }

    /// The underlying device.
    pub fn device(&self) -> Arc<dyn NetworkDevice> {
        self.device.clone()
    }

    /// Register the protocol for an ethertype, replacing any previous one.
    pub fn register(&self, ethertype: u16, protocol: Arc<dyn L2Protocol>) {
        self.protocols.lock().unwrap().insert(ethertype, protocol);
    }

    /// Build a frame and send it out of `port`.
    pub async fn send(
        &self,
        dst: L2Addr,
        ethertype: u16,
        payload: &[u8],
        port: SendPort,
    ) -> Result<(), StackError> {
        let mut frame = BytesMut::with_capacity(L2_HEADER + payload.len());
        frame.put_slice(&dst.0);
        frame.put_slice(&self.local_addr.0);
        frame.put_u16(ethertype);
        frame.put_slice(payload);
        self.device.send(&frame, port).await?;
        Ok(())
    }
}

struct Dispatch {
    l2: Arc<L2>,
}

#[async_trait]
impl DeviceHandler for Dispatch {
    async fn receive(&self, port: u8, frame: &[u8]) {
        if frame.len() < L2_HEADER {
            trace!("l2: dropping short frame ({} bytes)", frame.len());
            return;
        }

        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        let dst = L2Addr(dst);
        if dst != self.l2.local_addr && !dst.is_broadcast() {
            trace!("l2: frame for {dst:?} is not ours");
            return;
        }

        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

        let protocol = self.l2.protocols.lock().unwrap().get(&ethertype).cloned();
        match protocol {
            Some(protocol) => {
                protocol
                    .receive(port, L2Addr(src), &frame[L2_HEADER..])
                    .await
            }
            None => trace!("l2: no protocol for ethertype {ethertype:#06x}"),
        }
    }

    async fn link_change(&self, port: u8, up: bool) {
        let protocols: Vec<Arc<dyn L2Protocol>> = {
            let registry = self.l2.protocols.lock().unwrap();
            registry.values().cloned().collect()
        };
        for protocol in protocols {
            protocol.link_change(port, up).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_net::{DeviceError, PortStats};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_addr_from_node_id() {
        assert_eq!(
            L2Addr::from_node_id(0x0000_1122_3344_5566),
            L2Addr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
        );
        assert_eq!(L2Addr::from_node_id(0x2).0, [0, 0, 0, 0, 0, 0x02]);
        assert!(!L2Addr::from_node_id(0x2).is_broadcast());
        assert!(L2Addr::BROADCAST.is_broadcast());
    }

    /// Device stub that records sends and lets tests inject frames.
    #[derive(Default)]
    struct FakeDevice {
        sent: StdMutex<Vec<(SendPort, Vec<u8>)>>,
        handler: bm_net::CallbackCell,
    }

    #[async_trait]
    impl NetworkDevice for FakeDevice {
        fn num_ports(&self) -> u8 {
            2
        }
        fn set_handler(&self, handler: Arc<dyn DeviceHandler>) {
            self.handler.install(handler);
        }
        async fn send(&self, frame: &[u8], port: SendPort) -> Result<(), DeviceError> {
            self.sent.lock().unwrap().push((port, frame.to_vec()));
            Ok(())
        }
        async fn enable(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disable(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn enable_port(&self, _port: u8) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disable_port(&self, _port: u8) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn retry_negotiation(&self, _port: u8) -> Result<bool, DeviceError> {
            Ok(true)
        }
        fn port_stats(&self, _port: u8) -> Result<PortStats, DeviceError> {
            Ok(PortStats::default())
        }
    }

    struct Collector {
        frames: StdMutex<Vec<(u8, L2Addr, Vec<u8>)>>,
    }

    #[async_trait]
    impl L2Protocol for Collector {
        async fn receive(&self, port: u8, src: L2Addr, payload: &[u8]) {
            self.frames
                .lock()
                .unwrap()
                .push((port, src, payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_send_prepends_header() {
        let device = Arc::new(FakeDevice::default());
        let l2 = L2::init(device.clone(), 0xAB).await.unwrap();

        l2.send(L2Addr::BROADCAST, ETHERTYPE_BCMP, &[1, 2, 3], SendPort::Flood)
            .await
            .unwrap();

        let sent = device.sent.lock().unwrap();
        let (port, frame) = &sent[0];
        assert_eq!(*port, SendPort::Flood);
        assert_eq!(&frame[..6], &[0xFF; 6]);
        assert_eq!(&frame[6..12], &L2Addr::from_node_id(0xAB).0);
        assert_eq!(&frame[12..14], &ETHERTYPE_BCMP.to_be_bytes());
        assert_eq!(&frame[14..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dispatch_filters_and_routes() {
        let device = Arc::new(FakeDevice::default());
        let l2 = L2::init(device.clone(), 0xAB).await.unwrap();

        let collector = Arc::new(Collector {
            frames: StdMutex::new(Vec::new()),
        });
        l2.register(ETHERTYPE_BCMP, collector.clone());

        let handler = device.handler.snapshot().unwrap();
        let build = |dst: L2Addr, ethertype: u16| {
            let mut frame = Vec::new();
            frame.extend_from_slice(&dst.0);
            frame.extend_from_slice(&L2Addr::from_node_id(0xCD).0);
            frame.extend_from_slice(&ethertype.to_be_bytes());
            frame.extend_from_slice(b"payload");
            frame
        };

        // For us, broadcast, someone else, unknown ethertype.
        handler
            .receive(1, &build(L2Addr::from_node_id(0xAB), ETHERTYPE_BCMP))
            .await;
        handler
            .receive(2, &build(L2Addr::BROADCAST, ETHERTYPE_BCMP))
            .await;
        handler
            .receive(1, &build(L2Addr::from_node_id(0x77), ETHERTYPE_BCMP))
            .await;
        handler
            .receive(1, &build(L2Addr::from_node_id(0xAB), 0x9999))
            .await;
        handler.receive(1, &[0u8; 5]).await;

        let frames = collector.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[1].0, 2);
        assert_eq!(frames[0].1, L2Addr::from_node_id(0xCD));
        assert_eq!(frames[0].2, b"payload");
    }
}
