//! Serial Port Transport
//!
//! Many Bluetooth ELM327 dongles are reached through an RFCOMM/SPP bridge that
//! the OS exposes as a serial device (`/dev/rfcomm0`, `COM5`), and wired
//! adapters show up as USB serial ports. Scanning lists the ports the OS
//! currently knows about.

use crate::error::{ConnectionError, TransportError};
use crate::transport::{Advertisement, Link, Transport};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortInfo, SerialPortType,
    SerialStream, StopBits,
};
use tracing::{debug, info};

const READ_BUFFER_BYTES: usize = 256;

/// Transport over OS serial ports
#[derive(Debug, Clone)]
pub struct SerialTransport {
    baud_rate: u32,
    /// Per-operation timeout configured on the port itself
    port_timeout: Duration,
}

impl SerialTransport {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            port_timeout: Duration::from_millis(1000),
        }
    }

    fn ports() -> Result<Vec<SerialPortInfo>, ConnectionError> {
        tokio_serial::available_ports().map_err(|e| ConnectionError::Unavailable(e.to_string()))
    }
}

fn describe(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .unwrap_or_else(|| format!("USB serial {:04X}:{:04X}", usb.vid, usb.pid)),
        SerialPortType::BluetoothPort => format!("Bluetooth serial {}", port.port_name),
        SerialPortType::PciPort => format!("PCI serial {}", port.port_name),
        SerialPortType::Unknown => port.port_name.clone(),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn is_available(&self) -> bool {
        Self::ports().map(|ports| !ports.is_empty()).unwrap_or(false)
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, ConnectionError> {
        let ports = Self::ports()?;
        let (tx, rx) = mpsc::channel(ports.len().max(1));

        for port in &ports {
            let advertisement = Advertisement {
                id: port.port_name.clone(),
                name: Some(describe(port)),
                rssi: None,
            };
            // capacity matches the port count, so this never fills up
            let _ = tx.try_send(advertisement);
        }
        debug!("Serial scan found {} port(s)", ports.len());

        Ok(rx)
    }

    async fn open(&self, device_id: &str) -> Result<Box<dyn Link>, ConnectionError> {
        if !Self::ports()?.iter().any(|p| p.port_name == device_id) {
            return Err(ConnectionError::NotFound(device_id.to_string()));
        }

        let stream = tokio_serial::new(device_id, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.port_timeout)
            .open_native_async()
            .map_err(|e| ConnectionError::Unavailable(format!("{}: {}", device_id, e)))?;

        info!("Opened serial port {} at {} baud", device_id, self.baud_rate);
        Ok(Box::new(SerialLink { stream }))
    }
}

struct SerialLink {
    stream: SerialStream,
}

#[async_trait]
impl Link for SerialLink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; READ_BUFFER_BYTES];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::LinkLost);
        }
        Ok(buf[..n].to_vec())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
