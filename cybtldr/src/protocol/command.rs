//! Bootloader commands and response records.

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::checksum::ChecksumType;
use crate::protocol::frame::{BASE_CMD_SIZE, build_frame};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;
use std::str::FromStr;

/// Length of the bootloader security key.
pub const SECURITY_KEY_LEN: usize = 6;

/// Bootloader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Verify the application checksum (0x31).
    VerifyChecksum = 0x31,
    /// Query the row range of a flash array (0x32).
    GetFlashSize = 0x32,
    /// Query validity and active flags of an application (0x33).
    GetAppStatus = 0x33,
    /// Erase one row (0x34).
    EraseRow = 0x34,
    /// Resynchronize the bootloader (0x35).
    Sync = 0x35,
    /// Mark an application active (0x36).
    SetActiveApp = 0x36,
    /// Stage data for a following program/verify command (0x37).
    SendData = 0x37,
    /// Enter the bootloader (0x38).
    EnterBootloader = 0x38,
    /// Program one row (0x39).
    ProgramRow = 0x39,
    /// Read back the checksum of one row (0x3A).
    VerifyRow = 0x3A,
    /// Leave the bootloader and launch the application (0x3B).
    ExitBootloader = 0x3B,
    /// Erase data at an address (0x44).
    EraseData = 0x44,
    /// Program data at an address (0x49).
    ProgramData = 0x49,
    /// Verify data at an address (0x4A).
    VerifyData = 0x4A,
    /// Set application metadata (0x4C).
    SetMetadata = 0x4C,
    /// Set the encryption initial vector (0x4D).
    SetEiv = 0x4D,
}

impl CommandCode {
    /// Payload size of the response, or `None` when the device does not answer.
    pub fn response_data_len(self) -> Option<usize> {
        match self {
            Self::ExitBootloader => None,
            Self::EnterBootloader => Some(8),
            Self::GetFlashSize => Some(4),
            Self::GetAppStatus => Some(2),
            Self::VerifyRow | Self::VerifyChecksum => Some(1),
            _ => Some(0),
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x31 => Self::VerifyChecksum,
            0x32 => Self::GetFlashSize,
            0x33 => Self::GetAppStatus,
            0x34 => Self::EraseRow,
            0x35 => Self::Sync,
            0x36 => Self::SetActiveApp,
            0x37 => Self::SendData,
            0x38 => Self::EnterBootloader,
            0x39 => Self::ProgramRow,
            0x3A => Self::VerifyRow,
            0x3B => Self::ExitBootloader,
            0x44 => Self::EraseData,
            0x49 => Self::ProgramData,
            0x4A => Self::VerifyData,
            0x4C => Self::SetMetadata,
            0x4D => Self::SetEiv,
            other => {
                return Err(Error::frame(
                    ErrorCode::Cmd,
                    format!("unknown command {other:#04x}"),
                ));
            },
        })
    }
}

/// Six-byte key required by secured bootloaders.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecurityKey([u8; SECURITY_KEY_LEN]);

impl SecurityKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; SECURITY_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key bytes in transmission order.
    pub fn as_bytes(&self) -> &[u8; SECURITY_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityKey(******)")
    }
}

impl FromStr for SecurityKey {
    type Err = Error;

    /// Parse twelve hex digits, optionally prefixed with `0x` and separated
    /// by `:`, `-` or `_`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let digits: String = s
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '_'))
            .collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| Error::frame(ErrorCode::Data, format!("invalid security key: {e}")))?;
        let key: [u8; SECURITY_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::frame(
                ErrorCode::Length,
                format!(
                    "security key must be {SECURITY_KEY_LEN} bytes, got {}",
                    b.len()
                ),
            )
        })?;
        Ok(Self(key))
    }
}

/// Command packet builder.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    command: CommandCode,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a command with an empty payload.
    pub fn new(command: CommandCode) -> Self {
        Self {
            command,
            data: Vec::new(),
        }
    }

    /// Enter the bootloader, presenting the security key if one is set.
    pub fn enter_bootloader(key: Option<&SecurityKey>) -> Self {
        let mut frame = Self::new(CommandCode::EnterBootloader);
        if let Some(key) = key {
            frame
                .data
                .extend_from_slice(key.as_bytes());
        }
        frame
    }

    /// Enter the bootloader of an address-based image, checking the product id.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn enter_bootloader_v1(product_id: u32) -> Self {
        let mut frame = Self::new(CommandCode::EnterBootloader);
        frame.data.write_u32::<LittleEndian>(product_id).unwrap();
        frame.data.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    /// Leave the bootloader. The device does not answer.
    pub fn exit_bootloader() -> Self {
        Self::new(CommandCode::ExitBootloader)
    }

    /// Query the row range of a flash array.
    pub fn get_flash_size(array_id: u8) -> Self {
        let mut frame = Self::new(CommandCode::GetFlashSize);
        frame.data.push(array_id);
        frame
    }

    /// Query application status.
    pub fn get_app_status(app_id: u8) -> Self {
        let mut frame = Self::new(CommandCode::GetAppStatus);
        frame.data.push(app_id);
        frame
    }

    /// Mark an application active.
    pub fn set_active_app(app_id: u8) -> Self {
        let mut frame = Self::new(CommandCode::SetActiveApp);
        frame.data.push(app_id);
        frame
    }

    /// Erase one row.
    pub fn erase_row(array_id: u8, row: u16) -> Self {
        Self::row_command(CommandCode::EraseRow, array_id, row)
    }

    /// Program one row. `data` is the part not already staged with
    /// [`CommandFrame::send_data`].
    pub fn program_row(array_id: u8, row: u16, data: &[u8]) -> Self {
        let mut frame = Self::row_command(CommandCode::ProgramRow, array_id, row);
        frame.data.extend_from_slice(data);
        frame
    }

    /// Read back the checksum of one row.
    pub fn verify_row(array_id: u8, row: u16) -> Self {
        Self::row_command(CommandCode::VerifyRow, array_id, row)
    }

    /// Stage a chunk of row data.
    pub fn send_data(data: &[u8]) -> Self {
        let mut frame = Self::new(CommandCode::SendData);
        frame.data.extend_from_slice(data);
        frame
    }

    /// Verify the checksum of the single application.
    pub fn verify_checksum() -> Self {
        Self::new(CommandCode::VerifyChecksum)
    }

    /// Verify the checksum of one application of an address-based image.
    pub fn verify_checksum_v1(app_id: u8) -> Self {
        let mut frame = Self::new(CommandCode::VerifyChecksum);
        frame.data.push(app_id);
        frame
    }

    /// Program data at `address`; `crc` is the CRC-32C of the whole row.
    pub fn program_data(address: u32, crc: u32, data: &[u8]) -> Self {
        Self::address_command(CommandCode::ProgramData, address, crc, data)
    }

    /// Verify data at `address`; `crc` is the CRC-32C of the whole row.
    pub fn verify_data(address: u32, crc: u32, data: &[u8]) -> Self {
        Self::address_command(CommandCode::VerifyData, address, crc, data)
    }

    /// Erase the row holding `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase_data(address: u32) -> Self {
        let mut frame = Self::new(CommandCode::EraseData);
        frame.data.write_u32::<LittleEndian>(address).unwrap();
        frame
    }

    /// Record start address and size of an application.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_metadata(app_id: u8, start: u32, size: u32) -> Self {
        let mut frame = Self::new(CommandCode::SetMetadata);
        frame.data.push(app_id);
        frame.data.write_u32::<LittleEndian>(start).unwrap();
        frame.data.write_u32::<LittleEndian>(size).unwrap();
        frame
    }

    /// Set the encryption initial vector.
    pub fn set_eiv(iv: &[u8]) -> Self {
        let mut frame = Self::new(CommandCode::SetEiv);
        frame.data.extend_from_slice(iv);
        frame
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn row_command(command: CommandCode, array_id: u8, row: u16) -> Self {
        let mut frame = Self::new(command);
        frame.data.push(array_id);
        frame.data.write_u16::<LittleEndian>(row).unwrap();
        frame
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn address_command(command: CommandCode, address: u32, crc: u32, data: &[u8]) -> Self {
        let mut frame = Self::new(command);
        frame.data.write_u32::<LittleEndian>(address).unwrap();
        frame.data.write_u32::<LittleEndian>(crc).unwrap();
        frame.data.extend_from_slice(data);
        frame
    }

    /// Get the command code.
    pub fn command(&self) -> CommandCode {
        self.command
    }

    /// Get the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Size of the full response packet, or `None` when there is no response.
    pub fn response_len(&self) -> Option<usize> {
        self.command
            .response_data_len()
            .map(|len| len + BASE_CMD_SIZE)
    }

    /// Encode the packet.
    pub fn build(&self, checksum: ChecksumType) -> Result<Vec<u8>> {
        build_frame(self.command as u8, &self.data, checksum)
    }
}

fn expect_len(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() == len {
        Ok(())
    } else {
        Err(Error::frame(
            ErrorCode::Length,
            format!("{what} response carries {} bytes, expected {len}", data.len()),
        ))
    }
}

/// Identity reported when entering the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootloaderInfo {
    /// Silicon id.
    pub silicon_id: u32,
    /// Silicon revision.
    pub silicon_rev: u8,
    /// Bootloader version, 24 bits.
    pub bootloader_version: u32,
}

impl BootloaderInfo {
    /// Parse the enter-bootloader response payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, 8, "enter bootloader")?;
        Ok(Self {
            silicon_id: LittleEndian::read_u32(&data[0..4]),
            silicon_rev: data[4],
            bootloader_version: LittleEndian::read_u24(&data[5..8]),
        })
    }
}

/// Inclusive row range of a flash array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RowRange {
    /// First valid row.
    pub start: u16,
    /// Last valid row.
    pub end: u16,
}

impl RowRange {
    /// Parse the get-flash-size response payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, 4, "get flash size")?;
        Ok(Self {
            start: LittleEndian::read_u16(&data[0..2]),
            end: LittleEndian::read_u16(&data[2..4]),
        })
    }

    /// Check if `row` lies within the range.
    pub fn contains(&self, row: u16) -> bool {
        (self.start..=self.end).contains(&row)
    }
}

/// Application status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AppStatus {
    /// Validation result; the bootloader reports 0 for an application whose
    /// checksum passes.
    pub validation: u8,
    /// Whether the application is marked active.
    pub is_active: bool,
}

impl AppStatus {
    /// Parse the get-application-status response payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        expect_len(data, 2, "get application status")?;
        Ok(Self {
            validation: data[0],
            is_active: data[1] == 1,
        })
    }

    /// Check if the application validated.
    pub fn is_valid(&self) -> bool {
        self.validation == 0
    }
}
