//! # cybtldr
//!
//! Host-side driver for the Cypress/Infineon packet bootloader.
//!
//! This crate provides everything needed to program, erase and verify a
//! device running the bootloader over a byte-oriented link:
//!
//! - Packet framing with byte-sum or CRC-16 checksums
//! - `.cyacd` and `.cyacd2` firmware image parsing
//! - Row and address based flash commands with chunked data transfer
//! - A session orchestrator with cooperative abort and multi-application
//!   handling
//!
//! Every failure carries a numeric code compatible with the classic host
//! tools (see [`Error::code`]).
//!
//! ## Features
//!
//! - `native` (default): UART transport via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use cybtldr::{Bootloader, FirmwareImage, SecurityKey};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::open("firmware.cyacd")?;
//!     let key: SecurityKey = "0A0B0C0D0E0F".parse()?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use cybtldr::{NativeTransport, SerialConfig};
//!
//!         let transport = NativeTransport::new(SerialConfig::new("/dev/ttyACM0", 115_200));
//!         let mut bootloader = Bootloader::new(transport);
//!         bootloader.program(&image, Some(&key), 0, &mut |p: &cybtldr::Progress| {
//!             println!("{} {}/{}", p.action, p.line, p.total_lines);
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod error;
pub mod image;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::{NativePortEnumerator, NativeTransport};
pub use {
    bootloader::{
        AbortHandle, Action, Bootloader, Progress, SessionState, TransferConfig, transfer,
    },
    error::{BTLDR_MASK, BootloaderStatus, COMM_MASK, Error, ErrorCode, Result, result_code},
    image::cyacd::{AppInfo, DataRow, FirmwareImage, Header, HeaderV1, Row},
    protocol::{
        AppStatus, BootloaderInfo, ChecksumType, CommandCode, CommandFrame, RowRange, SecurityKey,
    },
    transport::{DeviceKind, PortEnumerator, PortInfo, ReadPoll, SerialConfig, Transport},
};
