//! In-memory bootloader used by the session tests.

use crate::{
    bootloader::AbortHandle,
    error::{BootloaderStatus, Error, ErrorCode, Result},
    image::cyacd::FirmwareImage,
    protocol::{
        ChecksumType, CommandCode, SecurityKey, build_frame, checksum16, checksum32,
        command::RowRange,
        frame::{BASE_CMD_SIZE, DATA_OFFSET, END_OF_PACKET, START_OF_PACKET},
    },
    transport::{ReadPoll, Transport},
};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

/// Simulated bootloader speaking the packet protocol.
///
/// Requests are decoded and answered like a device would; the public fields
/// configure its identity and failure behaviour.
pub struct SimulatedDevice {
    pub silicon_id: u32,
    pub silicon_rev: u8,
    pub bootloader_version: u32,
    pub row_range: RowRange,
    pub security_key: Option<SecurityKey>,
    /// Never answer.
    pub silent: bool,
    /// Answer this command with an error status.
    pub fail_command: Option<(CommandCode, BootloaderStatus)>,
    /// Application status bytes; `None` behaves like a single-application
    /// bootloader.
    pub app_status: Option<[u8; 2]>,
    pub application_valid: bool,
    /// Answer the next request with these bytes instead.
    pub raw_response: Option<Vec<u8>>,
    /// Set the abort flag once this many commands were handled.
    pub abort_after: Option<(usize, AbortHandle)>,
    pub max_transfer: usize,

    pub active_app: Option<u8>,
    pub product_id: Option<u32>,
    pub metadata: Option<(u8, u32, u32)>,
    pub eiv: Option<Vec<u8>>,

    open: bool,
    pending: Vec<u8>,
    staged: Vec<u8>,
    rows: HashMap<(u8, u16), Vec<u8>>,
    data: HashMap<u32, Vec<u8>>,
    log: Vec<CommandCode>,
    checksum_errors: usize,
    max_request_len: usize,
}

/// Route library logs to the test harness; `RUST_LOG=trace` shows every frame.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl SimulatedDevice {
    pub fn new() -> Self {
        init_logger();
        Self {
            silicon_id: 0x0102_0304,
            silicon_rev: 0x05,
            bootloader_version: 0x01_001E,
            row_range: RowRange {
                start: 0x00,
                end: 0xFF,
            },
            security_key: None,
            silent: false,
            fail_command: None,
            app_status: None,
            application_valid: true,
            raw_response: None,
            abort_after: None,
            max_transfer: 64,
            active_app: None,
            product_id: None,
            metadata: None,
            eiv: None,
            open: false,
            pending: Vec::new(),
            staged: Vec::new(),
            rows: HashMap::new(),
            data: HashMap::new(),
            log: Vec::new(),
            checksum_errors: 0,
            max_request_len: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Handled commands in arrival order.
    pub fn commands(&self) -> &[CommandCode] {
        &self.log
    }

    pub fn count(&self, command: CommandCode) -> usize {
        self.log
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn flash_row(&self, array_id: u8, row: u16) -> Option<&Vec<u8>> {
        self.rows.get(&(array_id, row))
    }

    pub fn data_at(&self, address: u32) -> Option<&Vec<u8>> {
        self.data.get(&address)
    }

    /// Checksum the device reports for a row: two's complement of the data sum.
    pub fn row_checksum(&self, array_id: u8, row: u16) -> u8 {
        self.flash_row(array_id, row)
            .map_or(0, |data| {
                data.iter()
                    .fold(0u8, |acc, b| acc.wrapping_add(*b))
                    .wrapping_neg()
            })
    }

    pub fn checksum_errors(&self) -> usize {
        self.checksum_errors
    }

    pub fn max_request_len(&self) -> usize {
        self.max_request_len
    }

    fn respond(&mut self, status: BootloaderStatus, payload: &[u8], checksum: ChecksumType) {
        // Payloads here never exceed the frame limit.
        self.pending = build_frame(status.as_u8(), payload, checksum).unwrap();
    }

    fn handle(&mut self, request: &[u8]) {
        let checksum = match decode_checksum(request) {
            Some(checksum) => checksum,
            None => {
                self.checksum_errors += 1;
                self.respond(BootloaderStatus::Checksum, &[], ChecksumType::Sum);
                return;
            },
        };

        let len = usize::from(LittleEndian::read_u16(&request[2..4]));
        let payload = request[DATA_OFFSET..DATA_OFFSET + len].to_vec();
        let Ok(command) = CommandCode::try_from(request[1]) else {
            self.respond(BootloaderStatus::Cmd, &[], checksum);
            return;
        };
        self.log.push(command);

        if let Some(raw) = self.raw_response.take() {
            self.pending = raw;
        } else {
            match self.fail_command {
                Some((failing, status)) if failing == command => self.respond(status, &[], checksum),
                _ => self.execute(command, &payload, checksum),
            }
        }

        if let Some((after, handle)) = &self.abort_after {
            if self.log.len() == *after {
                handle.abort();
            }
        }
    }

    fn execute(&mut self, command: CommandCode, payload: &[u8], checksum: ChecksumType) {
        use BootloaderStatus::{Cmd, Key, Success, Verify};

        match command {
            CommandCode::EnterBootloader => {
                if let Some(key) = self.security_key {
                    if payload != key.as_bytes() {
                        self.respond(Key, &[], checksum);
                        return;
                    }
                } else if payload.len() == 6 {
                    self.product_id = Some(LittleEndian::read_u32(&payload[..4]));
                }
                let mut info = self.silicon_id.to_le_bytes().to_vec();
                info.push(self.silicon_rev);
                info.extend_from_slice(&self.bootloader_version.to_le_bytes()[..3]);
                self.staged.clear();
                self.respond(Success, &info, checksum);
            },
            CommandCode::GetFlashSize => {
                let mut range = self.row_range.start.to_le_bytes().to_vec();
                range.extend_from_slice(&self.row_range.end.to_le_bytes());
                self.respond(Success, &range, checksum);
            },
            CommandCode::GetAppStatus => match self.app_status {
                Some(status) => self.respond(Success, &status, checksum),
                None => self.respond(Cmd, &[], checksum),
            },
            CommandCode::SetActiveApp => {
                self.active_app = Some(payload[0]);
                self.respond(Success, &[], checksum);
            },
            CommandCode::EraseRow => {
                self.rows.remove(&row_key(payload));
                self.respond(Success, &[], checksum);
            },
            CommandCode::SendData => {
                self.staged.extend_from_slice(payload);
                self.respond(Success, &[], checksum);
            },
            CommandCode::ProgramRow => {
                let mut row = std::mem::take(&mut self.staged);
                row.extend_from_slice(&payload[3..]);
                self.rows.insert(row_key(payload), row);
                self.respond(Success, &[], checksum);
            },
            CommandCode::VerifyRow => {
                let (array_id, row) = row_key(payload);
                let sum = self.row_checksum(array_id, row);
                self.respond(Success, &[sum], checksum);
            },
            CommandCode::VerifyChecksum => {
                let valid = u8::from(self.application_valid);
                self.respond(Success, &[valid], checksum);
            },
            CommandCode::ExitBootloader => {
                self.staged.clear();
                self.pending.clear();
            },
            CommandCode::EraseData => {
                self.data.remove(&LittleEndian::read_u32(payload));
                self.respond(Success, &[], checksum);
            },
            CommandCode::ProgramData | CommandCode::VerifyData => {
                let address = LittleEndian::read_u32(&payload[0..4]);
                let crc = LittleEndian::read_u32(&payload[4..8]);
                let mut data = std::mem::take(&mut self.staged);
                data.extend_from_slice(&payload[8..]);

                if command == CommandCode::ProgramData {
                    let status = if checksum32(&data) == crc { Success } else { Verify };
                    self.data.insert(address, data);
                    self.respond(status, &[], checksum);
                } else {
                    let stored = self
                        .data
                        .get(&address)
                        .map(|d| checksum32(d));
                    let status = if stored == Some(crc) { Success } else { Verify };
                    self.respond(status, &[], checksum);
                }
            },
            CommandCode::SetMetadata => {
                self.metadata = Some((
                    payload[0],
                    LittleEndian::read_u32(&payload[1..5]),
                    LittleEndian::read_u32(&payload[5..9]),
                ));
                self.respond(Success, &[], checksum);
            },
            CommandCode::SetEiv => {
                self.eiv = Some(payload.to_vec());
                self.respond(Success, &[], checksum);
            },
            CommandCode::Sync => {
                self.staged.clear();
                self.respond(Success, &[], checksum);
            },
        }
    }
}

impl Transport for SimulatedDevice {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::comm(ErrorCode::Device, "not connected"));
        }
        self.max_request_len = self.max_request_len.max(data.len());
        self.pending.clear();
        self.handle(data);
        if self.silent {
            self.pending.clear();
        }
        Ok(())
    }

    fn read(&mut self, expected: usize) -> Result<ReadPoll> {
        if self.pending.len() >= expected {
            let response: Vec<u8> = self.pending.drain(..expected).collect();
            Ok(ReadPoll::Complete(response))
        } else {
            Ok(ReadPoll::Incomplete {
                code: ErrorCode::File,
                received: self.pending.clone(),
            })
        }
    }

    fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }
}

fn row_key(payload: &[u8]) -> (u8, u16) {
    (payload[0], LittleEndian::read_u16(&payload[1..3]))
}

/// Accept a request framed with either checksum and report which one.
fn decode_checksum(request: &[u8]) -> Option<ChecksumType> {
    if request.len() < BASE_CMD_SIZE || request[0] != START_OF_PACKET {
        return None;
    }
    let len = usize::from(LittleEndian::read_u16(&request[2..4]));
    if request.len() != len + BASE_CMD_SIZE || request[request.len() - 1] != END_OF_PACKET {
        return None;
    }

    let at = DATA_OFFSET + len;
    let received = LittleEndian::read_u16(&request[at..at + 2]);
    [ChecksumType::Sum, ChecksumType::Crc]
        .into_iter()
        .find(|kind| checksum16(&request[..at], *kind) == received)
}

/// Encode a `.cyacd` row line with a correct checksum.
pub fn row_line(array_id: u8, row: u16, data: &[u8]) -> String {
    let mut bytes = vec![array_id];
    bytes.extend_from_slice(&row.to_be_bytes());
    bytes.extend_from_slice(&u16::try_from(data.len()).unwrap().to_be_bytes());
    bytes.extend_from_slice(data);
    let sum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());
    format!(":{}", hex::encode_upper(bytes))
}

/// Encode a `.cyacd2` row line.
pub fn row_line_v1(address: u32, data: &[u8]) -> String {
    let mut bytes = address.to_le_bytes().to_vec();
    bytes.extend_from_slice(data);
    format!(":{}", hex::encode_upper(bytes))
}

fn image(name: &str, header: &str, lines: &[String]) -> FirmwareImage {
    let mut text = format!("{header}\r\n");
    for line in lines {
        text.push_str(line);
        text.push_str("\r\n");
    }
    FirmwareImage::from_text(name, &text)
}

pub fn image_v0(header: &str, lines: &[String]) -> FirmwareImage {
    image("app.cyacd", header, lines)
}

pub fn image_v1(header: &str, lines: &[String]) -> FirmwareImage {
    image("app.cyacd2", header, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::cyacd::parse_row;

    #[test]
    fn test_row_line_is_parseable() {
        let line = row_line(1, 0x0203, &[0xAA, 0xBB]);
        let row = parse_row(&line).unwrap();
        assert_eq!(row.array_id, 1);
        assert_eq!(row.row_num, 0x0203);
        assert_eq!(row.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_device_checksum_matches_row_expectation() {
        let data: Vec<u8> = (0..=255u8).collect();
        let row = parse_row(&row_line(0, 0x0123, &data)).unwrap();

        let mut device = SimulatedDevice::new();
        device.rows.insert((0, 0x0123), data);
        assert_eq!(device.row_checksum(0, 0x0123), row.expected_device_checksum());
    }

    #[test]
    fn test_rejects_corrupted_request() {
        let mut device = SimulatedDevice::new();
        device.open().unwrap();

        let mut request = build_frame(0x38, &[], ChecksumType::Sum).unwrap();
        request[4] ^= 0x01;
        device.write(&request).unwrap();
        assert_eq!(device.checksum_errors(), 1);
        assert!(device.commands().is_empty());
    }
}
