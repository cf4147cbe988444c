//! Bootloader session.
//!
//! [`Bootloader`] owns a [`Transport`] and the state that lives for one
//! session: the frame checksum selected by the image header, the cached flash
//! row ranges and the abort flag. Taking `&mut self` in every operation keeps
//! sessions on one bootloader strictly sequential.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cybtldr::{Bootloader, FirmwareImage, NativeTransport, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::open("app.cyacd")?;
//!     let transport = NativeTransport::new(SerialConfig::new("/dev/ttyACM0", 115_200));
//!     let mut bootloader = Bootloader::new(transport);
//!
//!     bootloader.program(&image, None, 0, &mut |p: &cybtldr::Progress| {
//!         println!("line {}/{}", p.line, p.total_lines);
//!     })?;
//!     Ok(())
//! }
//! ```

mod ops;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod transfer;

pub use transfer::{TransferConfig, transfer};

use crate::protocol::checksum::ChecksumType;
use crate::protocol::command::RowRange;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of flash arrays a bootloader can expose.
pub const MAX_FLASH_ARRAYS: usize = 64;

/// Bootloader version family this host supports.
pub const SUPPORTED_BOOTLOADER: u32 = 0x01_0000;

/// Bits of the bootloader version compared against [`SUPPORTED_BOOTLOADER`].
pub const BOOTLOADER_VERSION_MASK: u32 = 0xFF_0000;

/// Operation applied to every row of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Action {
    /// Write and verify every row.
    Program,
    /// Erase every row.
    Erase,
    /// Compare every row against the device.
    Verify,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Program => "program",
            Self::Erase => "erase",
            Self::Verify => "verify",
        })
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session.
    #[default]
    Idle,
    /// Link open, entering the bootloader.
    Open,
    /// Processing image rows.
    RowLoop,
    /// Verifying and leaving the bootloader.
    Closing,
}

/// Progress of the row loop, reported after every processed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Running action.
    pub action: Action,
    /// Number of the line just processed, starting at 1.
    pub line: usize,
    /// Number of lines in the image.
    pub total_lines: usize,
    /// Rows processed so far.
    pub rows: usize,
}

/// Shared flag that stops a running session at the next row.
///
/// Cloning yields a handle to the same flag, so it can be moved into a
/// signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Request the running session to stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Host side of a bootloader session.
pub struct Bootloader<T: Transport> {
    transport: T,
    checksum: ChecksumType,
    valid_rows: [Option<RowRange>; MAX_FLASH_ARRAYS],
    transfer: TransferConfig,
    abort: AbortHandle,
    state: SessionState,
}

impl<T: Transport> Bootloader<T> {
    /// Create a bootloader over `transport` with default transfer settings.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            checksum: ChecksumType::default(),
            valid_rows: [None; MAX_FLASH_ARRAYS],
            transfer: TransferConfig::default(),
            abort: AbortHandle::default(),
            state: SessionState::Idle,
        }
    }

    /// Replace the transfer settings.
    #[must_use]
    pub fn with_transfer_config(mut self, config: TransferConfig) -> Self {
        self.transfer = config;
        self
    }

    /// Use an existing abort flag.
    #[must_use]
    pub fn with_abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = handle;
        self
    }

    /// Handle that stops the running session.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Request the running session to stop at the next row.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Frame checksum in use.
    pub fn checksum(&self) -> ChecksumType {
        self.checksum
    }

    /// Select the frame checksum for the following commands.
    pub fn set_checksum(&mut self, checksum: ChecksumType) {
        self.checksum = checksum;
    }

    /// Transfer settings.
    pub fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    /// Cached row range of a flash array.
    pub fn cached_row_range(&self, array_id: u8) -> Option<RowRange> {
        self.valid_rows
            .get(usize::from(array_id))
            .copied()
            .flatten()
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Release the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn reset_session(&mut self) {
        self.valid_rows = [None; MAX_FLASH_ARRAYS];
        self.abort.reset();
    }
}

impl<T: Transport> fmt::Debug for Bootloader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootloader")
            .field("checksum", &self.checksum)
            .field("state", &self.state)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}
