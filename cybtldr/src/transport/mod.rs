//! Transport abstraction for talking to a bootloader.
//!
//! The bootloader protocol only needs five primitives from the link: open,
//! close, write a whole packet, poll for a response of known size, and report
//! the largest packet the link can carry. Anything that provides them (UART,
//! USB HID, I2C bridge, a test double) can implement [`Transport`].
//!
//! ```text
//! +------------------+
//! |    Bootloader    |  session, row operations
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Transport trait |  open / close / write / read / max_transfer_size
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | NativeTransport  |
//! |   (serialport)   |
//! +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use crate::error::{ErrorCode, Result};
use std::time::Duration;

/// Default baud rate of UART bootloaders.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default largest packet for UART bootloaders.
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 64;

/// Outcome of one read poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPoll {
    /// The expected number of bytes arrived.
    Complete(Vec<u8>),
    /// Fewer bytes than expected arrived so far.
    Incomplete {
        /// Transport code describing the shortfall.
        code: ErrorCode,
        /// Bytes received so far.
        received: Vec<u8>,
    },
}

/// A link to a bootloader.
///
/// `read` is polled repeatedly until it reports [`ReadPoll::Complete`]; an
/// `Err` counts as a failed poll as well.
pub trait Transport {
    /// Open the link.
    fn open(&mut self) -> Result<()>;

    /// Close the link.
    fn close(&mut self) -> Result<()>;

    /// Write one packet.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Poll for a response of `expected` bytes.
    fn read(&mut self, expected: usize) -> Result<ReadPoll>;

    /// Largest packet the link carries in one write.
    fn max_transfer_size(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, expected: usize) -> Result<ReadPoll> {
        (**self).read(expected)
    }

    fn max_transfer_size(&self) -> usize {
        (**self).max_transfer_size()
    }
}

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// How long a single read poll waits for data.
    pub timeout: Duration,
    /// Largest packet written at once.
    pub max_transfer_size: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(100),
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the per-poll timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the largest packet size.
    #[must_use]
    pub fn with_max_transfer_size(mut self, size: usize) -> Self {
        self.max_transfer_size = size;
        self
    }
}

/// Known USB bridges found on boards with a UART bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// Cypress/Infineon KitProg programmer bridge.
    KitProg,
    /// FTDI FT232/FT2232/FT4232.
    Ftdi,
    /// Silicon Labs CP210x.
    Cp210x,
    /// CH340/CH341.
    Ch340,
    /// Prolific PL2303.
    Prolific,
    /// Unknown device.
    Unknown,
}

const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x04B4, &[], DeviceKind::KitProg),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KitProg => "KitProg",
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// Classified bridge.
    pub kind: DeviceKind,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Listing of available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Ports behind a known USB bridge.
    fn known_ports() -> Result<Vec<PortInfo>> {
        Ok(Self::list_ports()?
            .into_iter()
            .filter(|p| p.kind.is_known())
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePortEnumerator, NativeTransport};
