//! UART transport using the `serialport` crate.

use {
    crate::{
        error::{Error, ErrorCode, Result},
        transport::{DeviceKind, PortEnumerator, PortInfo, ReadPoll, SerialConfig, Transport},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::io::{self, Read, Write},
};

/// Serial port link to a UART bootloader.
///
/// Each [`Transport::read`] poll waits up to the configured timeout and keeps
/// what arrived, so a response split across polls is reassembled.
pub struct NativeTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    pending: Vec<u8>,
}

impl NativeTransport {
    /// Create a closed transport.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            pending: Vec::new(),
        }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.config.port_name
    }

    /// Check if the port is open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::comm(ErrorCode::Device, "port closed"))
    }
}

impl Transport for NativeTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!(
            "Opening {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        port.clear(ClearBuffer::All)?;

        self.port = Some(port);
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        self.pending.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {data:02X?}");
        self.pending.clear();
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, expected: usize) -> Result<ReadPoll> {
        let missing = expected.saturating_sub(self.pending.len());
        if missing > 0 {
            let mut buf = vec![0u8; missing];
            let port = self.port_mut()?;
            let n = match port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) => return Err(e.into()),
            };
            self.pending.extend_from_slice(&buf[..n]);
        }

        if self.pending.len() >= expected {
            let mut response = std::mem::take(&mut self.pending);
            response.truncate(expected);
            trace!("RX {response:02X?}");
            Ok(ReadPoll::Complete(response))
        } else {
            Ok(ReadPoll::Incomplete {
                code: ErrorCode::Length,
                received: self.pending.clone(),
            })
        }
    }

    fn max_transfer_size(&self) -> usize {
        self.config.max_transfer_size
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => PortInfo {
                    name: p.port_name,
                    kind: DeviceKind::from_vid_pid(info.vid, info.pid),
                    vid: Some(info.vid),
                    pid: Some(info.pid),
                    manufacturer: info.manufacturer,
                    product: info.product,
                    serial_number: info.serial_number,
                },
                _ => PortInfo {
                    name: p.port_name,
                    kind: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                },
            })
            .collect())
    }
}
