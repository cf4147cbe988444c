//! Single bootloader operations.
//!
//! Each operation builds one command, exchanges it, checks the response and
//! translates the device status. The first failure is returned unchanged.

use crate::{
    bootloader::{BOOTLOADER_VERSION_MASK, Bootloader, MAX_FLASH_ARRAYS, SUPPORTED_BOOTLOADER, transfer},
    error::{Error, ErrorCode, Result},
    protocol::{
        checksum32,
        command::{AppStatus, BootloaderInfo, CommandFrame, RowRange, SecurityKey},
        frame::{BASE_CMD_SIZE, MAX_PAYLOAD_SIZE, parse_response, try_parse_status},
    },
    transport::Transport,
};
use log::{debug, trace, warn};

/// Frame overhead of ProgramRow: packet header plus array id and row number.
const ROW_COMMAND_OVERHEAD: usize = BASE_CMD_SIZE + 3;

/// Frame overhead of ProgramData/VerifyData: packet header plus address and CRC.
const DATA_COMMAND_OVERHEAD: usize = BASE_CMD_SIZE + 8;

/// Largest data tail a ProgramRow frame can carry.
const ROW_COMMAND_MAX_DATA: usize = MAX_PAYLOAD_SIZE - (ROW_COMMAND_OVERHEAD - BASE_CMD_SIZE);

/// Largest data tail a ProgramData/VerifyData frame can carry.
const DATA_COMMAND_MAX_DATA: usize = MAX_PAYLOAD_SIZE - (DATA_COMMAND_OVERHEAD - BASE_CMD_SIZE);

impl<T: Transport> Bootloader<T> {
    /// Exchange one command and return the response payload.
    ///
    /// When no response of the expected size arrives but the received bytes
    /// form a valid packet with an error status, the device status is
    /// reported instead of the transport failure.
    fn execute(&mut self, frame: &CommandFrame) -> Result<Vec<u8>> {
        let request = frame.build(self.checksum)?;
        trace!("{:?}: {} byte request", frame.command(), request.len());

        let response = match transfer(
            &mut self.transport,
            &request,
            frame.response_len(),
            &self.transfer,
        ) {
            Ok(response) => response,
            Err(Error::Comm {
                code,
                message,
                received,
            }) => {
                return Err(match try_parse_status(&received, self.checksum) {
                    Some(status) if !status.is_success() => Error::Bootloader(status),
                    _ => Error::Comm {
                        code,
                        message,
                        received,
                    },
                });
            },
            Err(e) => return Err(e),
        };

        match frame
            .command()
            .response_data_len()
        {
            Some(len) => parse_response(&response, len).map(<[u8]>::to_vec),
            None => Ok(Vec::new()),
        }
    }

    /// Open the transport and enter the bootloader.
    pub fn enter_bootloader(&mut self, key: Option<&SecurityKey>) -> Result<BootloaderInfo> {
        self.enter(&CommandFrame::enter_bootloader(key))
    }

    /// Open the transport and enter the bootloader of an address-based image.
    pub fn enter_bootloader_v1(&mut self, product_id: u32) -> Result<BootloaderInfo> {
        self.enter(&CommandFrame::enter_bootloader_v1(product_id))
    }

    fn enter(&mut self, frame: &CommandFrame) -> Result<BootloaderInfo> {
        self.reset_session();
        self.transport
            .open()
            .map_err(Error::into_comm)?;

        let info = BootloaderInfo::parse(&self.execute(frame)?)?;
        debug!(
            "Bootloader entered: silicon {:#010x} rev {:#04x}, version {:#08x}",
            info.silicon_id, info.silicon_rev, info.bootloader_version
        );
        Ok(info)
    }

    /// Enter the bootloader and check that it matches the image.
    pub fn start_bootload(
        &mut self,
        silicon_id: u32,
        silicon_rev: u8,
        key: Option<&SecurityKey>,
    ) -> Result<BootloaderInfo> {
        let info = self.enter_bootloader(key)?;
        check_device(&info, silicon_id, silicon_rev)?;

        if info.bootloader_version & BOOTLOADER_VERSION_MASK != SUPPORTED_BOOTLOADER {
            return Err(Error::UnsupportedVersion(info.bootloader_version));
        }
        Ok(info)
    }

    /// Enter the bootloader of an address-based image and check the device.
    pub fn start_bootload_v1(
        &mut self,
        silicon_id: u32,
        silicon_rev: u8,
        product_id: u32,
    ) -> Result<BootloaderInfo> {
        let info = self.enter_bootloader_v1(product_id)?;
        check_device(&info, silicon_id, silicon_rev)?;
        Ok(info)
    }

    /// Leave the bootloader and close the transport.
    ///
    /// The device does not answer this command.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.execute(&CommandFrame::exit_bootloader())?;
        self.transport
            .close()
            .map_err(Error::into_comm)?;
        debug!("Bootloader exited");
        Ok(())
    }

    /// Query the row range of a flash array.
    pub fn get_flash_size(&mut self, array_id: u8) -> Result<RowRange> {
        let data = self.execute(&CommandFrame::get_flash_size(array_id))?;
        RowRange::parse(&data)
    }

    /// Check that a row exists, fetching and caching the array's range on
    /// first use.
    pub fn validate_row(&mut self, array_id: u8, row: u16) -> Result<()> {
        let index = usize::from(array_id);
        if index >= MAX_FLASH_ARRAYS {
            return Err(Error::InvalidArray(array_id));
        }

        let range = match self.valid_rows[index] {
            Some(range) => range,
            None => {
                let range = self.get_flash_size(array_id)?;
                debug!(
                    "Array {array_id:#04x}: rows {}..={}",
                    range.start, range.end
                );
                self.valid_rows[index] = Some(range);
                range
            },
        };

        if range.contains(row) {
            Ok(())
        } else {
            Err(Error::RowOutOfRange {
                array_id,
                row,
                min: range.start,
                max: range.end,
            })
        }
    }

    /// Stage `data` with SendData commands until at most `max_remaining`
    /// bytes are left. Returns the number of bytes sent.
    pub fn send_data(&mut self, data: &[u8], max_remaining: usize) -> Result<usize> {
        let chunk = self
            .transport
            .max_transfer_size()
            .saturating_sub(BASE_CMD_SIZE)
            .min(MAX_PAYLOAD_SIZE)
            .min(data.len());

        let mut offset = 0;
        while data.len() - offset > max_remaining {
            if chunk == 0 {
                return Err(Error::frame(
                    ErrorCode::Length,
                    format!(
                        "transport packets of {} bytes cannot carry data",
                        self.transport.max_transfer_size()
                    ),
                ));
            }
            let len = chunk.min(data.len() - offset);
            self.execute(&CommandFrame::send_data(&data[offset..offset + len]))?;
            offset += len;
        }

        Ok(offset)
    }

    /// Range-check a row of a flash array. EEPROM arrays expose no flash
    /// size and pass unchecked.
    fn check_row(&mut self, array_id: u8, row: u16) -> Result<()> {
        if usize::from(array_id) < MAX_FLASH_ARRAYS {
            self.validate_row(array_id, row)
        } else {
            trace!("Array {array_id:#04x} is not flash; row {row} not range checked");
            Ok(())
        }
    }

    /// Erase one row.
    pub fn erase_row(&mut self, array_id: u8, row: u16) -> Result<()> {
        self.check_row(array_id, row)?;
        self.execute(&CommandFrame::erase_row(array_id, row))?;
        Ok(())
    }

    /// Program one row, splitting the data over SendData commands as needed.
    pub fn program_row(&mut self, array_id: u8, row: u16, data: &[u8]) -> Result<()> {
        self.check_row(array_id, row)?;

        let reserved = self
            .transport
            .max_transfer_size()
            .saturating_sub(ROW_COMMAND_OVERHEAD)
            .min(ROW_COMMAND_MAX_DATA);
        let offset = self.send_data(data, reserved)?;
        self.execute(&CommandFrame::program_row(array_id, row, &data[offset..]))?;
        Ok(())
    }

    /// Compare the device's checksum of one row with `expected`.
    pub fn verify_row(&mut self, array_id: u8, row: u16, expected: u8) -> Result<()> {
        self.check_row(array_id, row)?;

        let data = self.execute(&CommandFrame::verify_row(array_id, row))?;
        let actual = data[0];
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    /// Query validity and active flags of an application.
    pub fn get_app_status(&mut self, app_id: u8) -> Result<AppStatus> {
        let data = self.execute(&CommandFrame::get_app_status(app_id))?;
        AppStatus::parse(&data)
    }

    /// Mark an application active.
    pub fn set_active_app(&mut self, app_id: u8) -> Result<()> {
        self.execute(&CommandFrame::set_active_app(app_id))?;
        debug!("Application {app_id} marked active");
        Ok(())
    }

    /// Check the application checksum after all rows were processed.
    pub fn verify_application(&mut self) -> Result<()> {
        let data = self.execute(&CommandFrame::verify_checksum())?;
        check_application_flag(data[0])
    }

    /// Check the checksum of one application of an address-based image.
    pub fn verify_application_v1(&mut self, app_id: u8) -> Result<()> {
        let data = self.execute(&CommandFrame::verify_checksum_v1(app_id))?;
        check_application_flag(data[0])
    }

    /// Record start address and size of an application.
    pub fn set_app_metadata(&mut self, app_id: u8, start: u32, size: u32) -> Result<()> {
        debug!("Application {app_id}: start {start:#010x}, {size} bytes");
        self.execute(&CommandFrame::set_metadata(app_id, start, size))?;
        Ok(())
    }

    /// Set the encryption initial vector.
    pub fn set_encryption_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.execute(&CommandFrame::set_eiv(iv))?;
        Ok(())
    }

    /// Erase the row holding `address`.
    pub fn erase_data(&mut self, address: u32) -> Result<()> {
        self.execute(&CommandFrame::erase_data(address))?;
        Ok(())
    }

    /// Program `data` at `address`.
    pub fn program_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let crc = checksum32(data);
        let offset = self.send_data(data, self.data_reserve())?;
        self.execute(&CommandFrame::program_data(address, crc, &data[offset..]))?;
        Ok(())
    }

    /// Compare `data` with the flash content at `address`.
    pub fn verify_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let crc = checksum32(data);
        let offset = self.send_data(data, self.data_reserve())?;
        self.execute(&CommandFrame::verify_data(address, crc, &data[offset..]))?;
        Ok(())
    }

    fn data_reserve(&self) -> usize {
        self.transport
            .max_transfer_size()
            .saturating_sub(DATA_COMMAND_OVERHEAD)
            .min(DATA_COMMAND_MAX_DATA)
    }

    /// Leave the bootloader on a best-effort basis.
    pub(crate) fn end_session(&mut self) {
        if let Err(e) = self.exit_bootloader() {
            warn!("Failed to exit bootloader: {e}");
        }
    }
}

fn check_device(info: &BootloaderInfo, silicon_id: u32, silicon_rev: u8) -> Result<()> {
    if info.silicon_id != silicon_id || info.silicon_rev != silicon_rev {
        return Err(Error::DeviceMismatch {
            expected_id: silicon_id,
            expected_rev: silicon_rev,
            actual_id: info.silicon_id,
            actual_rev: info.silicon_rev,
        });
    }
    Ok(())
}

fn check_application_flag(flag: u8) -> Result<()> {
    if flag == 1 {
        Ok(())
    } else {
        Err(Error::InvalidApplication)
    }
}
