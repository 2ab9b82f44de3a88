//! Composite device joining local virtual ports with a serial mesh segment.
//!
//! The gateway presents one [`NetworkDevice`] to the stack: ports `1..=N`
//! belong to the wrapped [`VirtualPortDevice`], port `N + 1` is the serial
//! link. It shares the virtual-port device's callback cell, so frames from
//! either leg reach the same installed handler.

use crate::uart::{FrameSink, UartTransport};
use crate::vpd::VirtualPortDevice;
use crate::{CallbackCell, DeviceError, DeviceHandler, NetworkDevice, PortStats, SendPort};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Delivers frames decoded by the UART receive worker to the stack as
/// arriving on the gateway's serial port.
pub struct UartBridge {
    callbacks: CallbackCell,
    uart_port: u8,
}

impl UartBridge {
    /// Bridge into `callbacks` with the given serial port number.
    pub fn new(callbacks: CallbackCell, uart_port: u8) -> Self {
        Self {
            callbacks,
            uart_port,
        }
    }
}

#[async_trait]
impl FrameSink for UartBridge {
    async fn deliver(&self, frame: &[u8]) {
        if frame.is_empty() {
            return;
        }
        if let Some(handler) = self.callbacks.snapshot() {
            handler.receive(self.uart_port, frame).await;
        }
    }
}

/// Network device multiplexing N virtual ports and one serial port.
pub struct GatewayDevice {
    vpd: Arc<VirtualPortDevice>,
    uart: UartTransport,
    vpd_ports: u8,
    uart_port: u8,
    callbacks: CallbackCell,
}

impl GatewayDevice {
    /// Compose an initialized UART transport with a virtual-port device.
    ///
    /// The transport must have been opened with a [`UartBridge`] built from
    /// this device's callback cell and serial port number.
    pub fn new(vpd: Arc<VirtualPortDevice>, uart: UartTransport) -> Self {
        let vpd_ports = vpd.num_ports();
        let callbacks = vpd.callback_cell();
        Self {
            vpd,
            uart,
            vpd_ports,
            uart_port: vpd_ports + 1,
            callbacks,
        }
    }

    /// Port number of the serial link.
    pub fn uart_port(&self) -> u8 {
        self.uart_port
    }
}

#[async_trait]
impl NetworkDevice for GatewayDevice {
    fn num_ports(&self) -> u8 {
        self.vpd_ports + 1
    }

    fn set_handler(&self, handler: Arc<dyn DeviceHandler>) {
        self.callbacks.install(handler);
    }

    async fn send(&self, frame: &[u8], port: SendPort) -> Result<(), DeviceError> {
        match port {
            SendPort::Flood => {
                let local = self.vpd.send(frame, SendPort::Flood).await;
                let serial = self.uart.send(frame).await;
                // One reachable leg is enough for a flood.
                match (local, serial) {
                    (Err(err), Err(serial_err)) => {
                        debug!("gateway: flood failed on both legs: {serial_err}");
                        Err(err)
                    }
                    _ => Ok(()),
                }
            }
            SendPort::Port(port) if port >= 1 && port <= self.vpd_ports => {
                self.vpd.send(frame, SendPort::Port(port)).await
            }
            SendPort::Port(port) if port == self.uart_port => self.uart.send(frame).await,
            SendPort::Port(_) => Err(DeviceError::InvalidArgument),
        }
    }

    async fn enable(&self) -> Result<(), DeviceError> {
        self.vpd.enable().await?;
        // The serial link is up as soon as its transport is; no
        // negotiation happens on that leg.
        if let Some(handler) = self.callbacks.snapshot() {
            handler.link_change(self.uart_port, true).await;
        }
        Ok(())
    }

    async fn disable(&self) -> Result<(), DeviceError> {
        if let Some(handler) = self.callbacks.snapshot() {
            handler.link_change(self.uart_port, false).await;
        }
        self.uart.shutdown().await;
        self.vpd.disable().await
    }

    async fn enable_port(&self, port: u8) -> Result<(), DeviceError> {
        if port >= 1 && port <= self.vpd_ports {
            return self.vpd.enable_port(port).await;
        }
        if port == self.uart_port {
            return Ok(());
        }
        Err(DeviceError::InvalidArgument)
    }

    async fn disable_port(&self, port: u8) -> Result<(), DeviceError> {
        if port >= 1 && port <= self.vpd_ports {
            return self.vpd.disable_port(port).await;
        }
        if port == self.uart_port {
            return Ok(());
        }
        Err(DeviceError::InvalidArgument)
    }

    async fn retry_negotiation(&self, port: u8) -> Result<bool, DeviceError> {
        if port >= 1 && port <= self.vpd_ports {
            return self.vpd.retry_negotiation(port).await;
        }
        if port == self.uart_port {
            // Nothing to negotiate on the serial leg.
            return Ok(false);
        }
        Err(DeviceError::InvalidArgument)
    }

    fn port_stats(&self, port: u8) -> Result<PortStats, DeviceError> {
        if port >= 1 && port <= self.vpd_ports {
            return self.vpd.port_stats(port);
        }
        if port == self.uart_port {
            return Ok(PortStats::default());
        }
        Err(DeviceError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpd::VirtualPortConfig;
    use crate::{MAX_DATAGRAM_FRAME, MIN_L2_FRAME};
    use bm_wire::{frame, MAX_L2_FRAME, MAX_WIRE_FRAME};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Receive { port: u8, frame: Vec<u8> },
        Link { port: u8, up: bool },
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<Event>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl DeviceHandler for Recorder {
        async fn receive(&self, port: u8, frame: &[u8]) {
            self.events.lock().unwrap().push(Event::Receive {
                port,
                frame: frame.to_vec(),
            });
        }

        async fn link_change(&self, port: u8, up: bool) {
            self.events.lock().unwrap().push(Event::Link { port, up });
        }
    }

    /// Gateway over a tempdir topology and an in-memory serial line;
    /// returns the far end of the line.
    fn gateway(
        dir: &TempDir,
        node_id: u64,
        peers: &[u64],
    ) -> (GatewayDevice, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let vpd = Arc::new(VirtualPortDevice::new(VirtualPortConfig {
            node_id,
            peers: peers.to_vec(),
            socket_dir: dir.path().to_path_buf(),
        }));
        let uart_port = vpd.num_ports() + 1;
        let bridge = Arc::new(UartBridge::new(vpd.callback_cell(), uart_port));

        let (near, far) = tokio::io::duplex(16 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        let uart = UartTransport::from_stream(near_read, near_write, bridge);

        (GatewayDevice::new(vpd, uart), far_read, far_write)
    }

    async fn read_wire_frame(reader: &mut ReadHalf<DuplexStream>) -> Vec<u8> {
        let mut accum = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            timeout(Duration::from_secs(2), reader.read_exact(&mut byte))
                .await
                .expect("timed out reading the serial line")
                .unwrap();
            if byte[0] == 0x00 {
                let mut l2 = vec![0u8; MAX_L2_FRAME];
                let n = frame::decode(&mut l2, &accum).unwrap();
                l2.truncate(n);
                return l2;
            }
            accum.push(byte[0]);
        }
    }

    #[test]
    fn test_port_arithmetic() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let dir = TempDir::new().unwrap();
        let (gateway, _far_read, _far_write) = gateway(&dir, 0x1, &[0x2, 0x3]);
        assert_eq!(gateway.num_ports(), 16);
        assert_eq!(gateway.uart_port(), 16);
    }

    #[tokio::test]
    async fn test_uart_port_send_and_receive() {
        let dir = TempDir::new().unwrap();
        let (gateway, mut far_read, mut far_write) = gateway(&dir, 0x1, &[]);
        let recorder = Arc::new(Recorder::default());
        gateway.set_handler(recorder.clone());
        gateway.enable().await.unwrap();

        // Enable brings the serial link up immediately.
        assert_eq!(recorder.take(), vec![Event::Link { port: 16, up: true }]);

        let outbound = vec![0xC3; 100];
        gateway.send(&outbound, SendPort::Port(16)).await.unwrap();
        assert_eq!(read_wire_frame(&mut far_read).await, outbound);

        let inbound = vec![0x3C; MIN_L2_FRAME];
        let mut wire = vec![0u8; MAX_WIRE_FRAME];
        let n = frame::encode(&mut wire, &inbound).unwrap();
        far_write.write_all(&wire[..n]).await.unwrap();
        far_write.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            recorder.take(),
            vec![Event::Receive {
                port: 16,
                frame: inbound,
            }]
        );
    }

    #[tokio::test]
    async fn test_routing_delegates_and_rejects() {
        let dir = TempDir::new().unwrap();
        let (gateway, _far_read, _far_write) = gateway(&dir, 0x1, &[0x2]);
        gateway.enable().await.unwrap();

        let peer = VirtualPortDevice::new(VirtualPortConfig {
            node_id: 0x2,
            peers: vec![0x1],
            socket_dir: dir.path().to_path_buf(),
        });
        let peer_rec = Arc::new(Recorder::default());
        peer.set_handler(peer_rec.clone());
        peer.enable().await.unwrap();

        let frame_bytes = vec![0x66; MIN_L2_FRAME];
        gateway
            .send(&frame_bytes, SendPort::Port(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            peer_rec.take(),
            vec![Event::Receive {
                port: 1,
                frame: frame_bytes.clone(),
            }]
        );

        // Undeclared virtual port.
        assert!(matches!(
            gateway.send(&frame_bytes, SendPort::Port(5)).await,
            Err(DeviceError::InvalidArgument)
        ));
        assert!(matches!(
            gateway.enable_port(5).await,
            Err(DeviceError::InvalidArgument)
        ));
        // Past the serial port.
        assert!(matches!(
            gateway.send(&frame_bytes, SendPort::Port(17)).await,
            Err(DeviceError::InvalidArgument)
        ));
        assert!(matches!(
            gateway.retry_negotiation(17).await,
            Err(DeviceError::InvalidArgument)
        ));
        // Serial port no-ops.
        assert!(gateway.enable_port(16).await.is_ok());
        assert!(!gateway.retry_negotiation(16).await.unwrap());
    }

    #[tokio::test]
    async fn test_flood_covers_both_legs() {
        let dir = TempDir::new().unwrap();
        let (gateway, mut far_read, _far_write) = gateway(&dir, 0x1, &[0x2]);
        gateway.enable().await.unwrap();

        let peer = VirtualPortDevice::new(VirtualPortConfig {
            node_id: 0x2,
            peers: vec![0x1],
            socket_dir: dir.path().to_path_buf(),
        });
        let peer_rec = Arc::new(Recorder::default());
        peer.set_handler(peer_rec.clone());
        peer.enable().await.unwrap();

        let frame_bytes = vec![0x99; MIN_L2_FRAME];
        gateway.send(&frame_bytes, SendPort::Flood).await.unwrap();

        assert_eq!(read_wire_frame(&mut far_read).await, frame_bytes);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            peer_rec.take(),
            vec![Event::Receive {
                port: 1,
                frame: frame_bytes,
            }]
        );
    }

    #[tokio::test]
    async fn test_oversize_for_datagram_still_fits_serial() {
        let dir = TempDir::new().unwrap();
        let (gateway, mut far_read, _far_write) = gateway(&dir, 0x1, &[]);
        gateway.enable().await.unwrap();

        // 1522 bytes exceeds the datagram limit but not the serial one.
        let jumbo = vec![0xEE; MAX_DATAGRAM_FRAME + 8];
        gateway.send(&jumbo, SendPort::Port(16)).await.unwrap();
        assert_eq!(read_wire_frame(&mut far_read).await, jumbo);
    }
}
