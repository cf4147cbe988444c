//! Error types for cybtldr.
//!
//! Every failure maps to a composed numeric code (see [`Error::code`]) made of
//! a host base code, optionally combined with [`COMM_MASK`] for transport
//! failures or [`BTLDR_MASK`] for device-reported status bytes. Scripts and
//! host applications that branch on the classic bootloader host codes can use
//! that value directly.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for cybtldr operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Mask applied to codes reported by the transport layer.
pub const COMM_MASK: u16 = 0x2000;

/// Mask applied to status bytes reported by the bootloader.
pub const BTLDR_MASK: u16 = 0x4000;

/// Host-side base error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// File is not accessible.
    File = 0x01,
    /// Reached the end of the file.
    Eof = 0x02,
    /// Amount of data is outside the expected range.
    Length = 0x03,
    /// Data is not of the proper form.
    Data = 0x04,
    /// Command is not recognized.
    Cmd = 0x05,
    /// Expected device does not match the detected device.
    Device = 0x06,
    /// Bootloader version does not match the expected one.
    Version = 0x07,
    /// Checksum does not match the expected value.
    Checksum = 0x08,
    /// Flash array is not valid.
    Array = 0x09,
    /// Flash row is not valid.
    Row = 0x0A,
    /// Bootloader is not ready to process commands.
    Btldr = 0x0B,
    /// Application is currently marked as active.
    Active = 0x0C,
    /// Unknown error.
    Unknown = 0x0F,
    /// Operation was aborted.
    Abort = 0xFF,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::File => "file not accessible",
            Self::Eof => "end of file",
            Self::Length => "length out of range",
            Self::Data => "malformed data",
            Self::Cmd => "unrecognized command",
            Self::Device => "device mismatch",
            Self::Version => "bootloader version mismatch",
            Self::Checksum => "checksum mismatch",
            Self::Array => "invalid flash array",
            Self::Row => "invalid flash row",
            Self::Btldr => "bootloader not ready",
            Self::Active => "application is active",
            Self::Unknown => "unknown error",
            Self::Abort => "aborted",
        };
        write!(f, "{text} (0x{:02X})", self.as_u8())
    }
}

/// Status byte reported by the bootloader in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootloaderStatus {
    /// Completed successfully.
    Success,
    /// Provided security key was incorrect.
    Key,
    /// Flash verification failed.
    Verify,
    /// Amount of data is outside the expected range.
    Length,
    /// Data is not of the proper form.
    Data,
    /// Command is not recognized.
    Cmd,
    /// Expected device does not match the detected device.
    Device,
    /// Bootloader version does not match.
    Version,
    /// Packet checksum does not match.
    Checksum,
    /// Flash array is not valid.
    Array,
    /// Flash row is not valid.
    Row,
    /// Flash row is protected.
    Protect,
    /// Application is not valid.
    App,
    /// Application is currently active.
    Active,
    /// Unknown error.
    Unknown,
    /// Status byte outside the documented set.
    Other(u8),
}

impl BootloaderStatus {
    /// Raw status byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Key => 0x01,
            Self::Verify => 0x02,
            Self::Length => 0x03,
            Self::Data => 0x04,
            Self::Cmd => 0x05,
            Self::Device => 0x06,
            Self::Version => 0x07,
            Self::Checksum => 0x08,
            Self::Array => 0x09,
            Self::Row => 0x0A,
            Self::Protect => 0x0B,
            Self::App => 0x0C,
            Self::Active => 0x0D,
            Self::Unknown => 0x0F,
            Self::Other(value) => value,
        }
    }

    /// Check if the status reports success.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<u8> for BootloaderStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Key,
            0x02 => Self::Verify,
            0x03 => Self::Length,
            0x04 => Self::Data,
            0x05 => Self::Cmd,
            0x06 => Self::Device,
            0x07 => Self::Version,
            0x08 => Self::Checksum,
            0x09 => Self::Array,
            0x0A => Self::Row,
            0x0B => Self::Protect,
            0x0C => Self::App,
            0x0D => Self::Active,
            0x0F => Self::Unknown,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for BootloaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Key => "invalid security key",
            Self::Verify => "flash verification failed",
            Self::Length => "length out of range",
            Self::Data => "malformed data",
            Self::Cmd => "unsupported command",
            Self::Device => "device mismatch",
            Self::Version => "version mismatch",
            Self::Checksum => "packet checksum mismatch",
            Self::Array => "invalid flash array",
            Self::Row => "invalid flash row",
            Self::Protect => "row is protected",
            Self::App => "invalid application",
            Self::Active => "application is active",
            Self::Unknown | Self::Other(_) => "unknown status",
        };
        write!(f, "{text} (0x{:02X})", self.as_u8())
    }
}

/// Error type for cybtldr operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading a firmware image.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed firmware image content.
    #[error("Invalid image ({code}): {message}")]
    InvalidImage {
        /// Base code classifying the defect.
        code: ErrorCode,
        /// Human readable description.
        message: String,
    },

    /// Command frame could not be encoded or a response frame is malformed.
    #[error("Invalid frame ({code}): {message}")]
    Frame {
        /// Base code classifying the defect.
        code: ErrorCode,
        /// Human readable description.
        message: String,
    },

    /// Device identity does not match the image header.
    #[error(
        "Device mismatch: image targets {expected_id:#010x} rev {expected_rev:#04x}, \
         device is {actual_id:#010x} rev {actual_rev:#04x}"
    )]
    DeviceMismatch {
        /// Silicon id from the image header.
        expected_id: u32,
        /// Silicon revision from the image header.
        expected_rev: u8,
        /// Silicon id reported by the device.
        actual_id: u32,
        /// Silicon revision reported by the device.
        actual_rev: u8,
    },

    /// Bootloader version is not supported.
    #[error("Unsupported bootloader version {0:#08x}")]
    UnsupportedVersion(u32),

    /// Flash array id out of range.
    #[error("Invalid flash array {0:#04x}")]
    InvalidArray(u8),

    /// Row number outside the array's flash range.
    #[error("Row {row} outside array {array_id:#04x} range {min}..={max}")]
    RowOutOfRange {
        /// Flash array id.
        array_id: u8,
        /// Requested row.
        row: u16,
        /// First valid row.
        min: u16,
        /// Last valid row.
        max: u16,
    },

    /// Row checksum reported by the device differs from the image.
    #[error("Row checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed from the image.
        expected: u8,
        /// Checksum reported by the device.
        actual: u8,
    },

    /// Application checksum is not valid on the device.
    #[error("Application checksum is not valid")]
    InvalidApplication,

    /// Target application is active and cannot be modified.
    #[error("Application {0} is active and cannot be erased or programmed")]
    ApplicationActive(u8),

    /// Transport failure.
    #[error("Communication failure ({code}): {message}")]
    Comm {
        /// Base code reported by the transport.
        code: ErrorCode,
        /// Human readable description.
        message: String,
        /// Bytes received before the failure, if any.
        received: Vec<u8>,
    },

    /// Bootloader reported a nonzero status byte.
    #[error("Bootloader reported {0}")]
    Bootloader(BootloaderStatus),

    /// Operation aborted by request.
    #[error("Operation aborted")]
    Aborted,

    /// Unsupported file format or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Build an image error.
    pub fn image(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::InvalidImage {
            code,
            message: message.into(),
        }
    }

    /// Build a frame error.
    pub fn frame(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Frame {
            code,
            message: message.into(),
        }
    }

    /// Build a transport error.
    pub fn comm(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Comm {
            code,
            message: message.into(),
            received: Vec::new(),
        }
    }

    /// Host base code, without masks.
    pub fn base_code(&self) -> u8 {
        match self {
            Self::Io(_) | Self::Unsupported(_) => ErrorCode::File.as_u8(),
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorCode::Device.as_u8(),
            Self::InvalidImage { code, .. }
            | Self::Frame { code, .. }
            | Self::Comm { code, .. } => code.as_u8(),
            Self::DeviceMismatch { .. } => ErrorCode::Device.as_u8(),
            Self::UnsupportedVersion(_) => ErrorCode::Version.as_u8(),
            Self::InvalidArray(_) => ErrorCode::Array.as_u8(),
            Self::RowOutOfRange { .. } => ErrorCode::Row.as_u8(),
            Self::ChecksumMismatch { .. } | Self::InvalidApplication => {
                ErrorCode::Checksum.as_u8()
            },
            Self::ApplicationActive(_) => ErrorCode::Active.as_u8(),
            Self::Bootloader(status) => status.as_u8(),
            Self::Aborted => ErrorCode::Abort.as_u8(),
        }
    }

    /// Composed host code: base code plus the communication or bootloader mask.
    pub fn code(&self) -> u16 {
        let base = u16::from(self.base_code());
        if self.is_comm() {
            base | COMM_MASK
        } else if matches!(self, Self::Bootloader(_)) {
            base | BTLDR_MASK
        } else {
            base
        }
    }

    /// Check if the error carries the communication mask.
    pub fn is_comm(&self) -> bool {
        match self {
            Self::Comm { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }

    /// Check if the device reported the given status.
    pub fn is_status(&self, status: BootloaderStatus) -> bool {
        matches!(self, Self::Bootloader(s) if *s == status)
    }

    /// Reclassify an error raised by a transport as a communication failure.
    pub(crate) fn into_comm(self) -> Self {
        match self {
            Self::Comm { .. } => self,
            #[cfg(feature = "native")]
            Self::Serial(_) => self,
            Self::Io(err) => Self::comm(ErrorCode::Device, err.to_string()),
            other => Self::Comm {
                code: ErrorCode::Device,
                message: other.to_string(),
                received: Vec::new(),
            },
        }
    }
}

/// Composed code of an operation result, `0` on success.
pub fn result_code<T>(result: &Result<T>) -> u16 {
    result
        .as_ref()
        .map_or_else(Error::code, |_| 0)
}
