//! Bootloader packet framing.
//!
//! Commands and responses share one layout:
//!
//! ```text
//! +-------+-----+---------+-----------+----------+------+
//! | Start | Cmd | Length  |   Data    | Checksum | Stop |
//! +-------+-----+---------+-----------+----------+------+
//! |   1   |  1  | 2 (LE)  |  Length   |  2 (LE)  |  1   |
//! +-------+-----+---------+-----------+----------+------+
//! | 0x01  | cmd |   len   |  payload  |  cksum   | 0x17 |
//! +-------+-----+---------+-----------+----------+------+
//! ```
//!
//! In responses the command byte carries the bootloader status. The checksum
//! covers every byte before the checksum field.

use crate::error::{BootloaderStatus, Error, ErrorCode, Result};
use crate::protocol::checksum::{ChecksumType, checksum16};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// First byte of every packet.
pub const START_OF_PACKET: u8 = 0x01;

/// Last byte of every packet.
pub const END_OF_PACKET: u8 = 0x17;

/// Size of a packet with an empty payload.
pub const BASE_CMD_SIZE: usize = 7;

/// Largest packet the bootloader accepts.
pub const MAX_COMMAND_SIZE: usize = 512;

/// Largest payload that fits in one packet.
pub const MAX_PAYLOAD_SIZE: usize = MAX_COMMAND_SIZE - BASE_CMD_SIZE;

/// Offset of the payload inside a packet.
pub const DATA_OFFSET: usize = 4;

/// Encode one packet.
///
/// `code` is the command byte for requests (or the status byte when building
/// a response).
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn build_frame(code: u8, payload: &[u8], checksum: ChecksumType) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::frame(
            ErrorCode::Length,
            format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                payload.len()
            ),
        ));
    }

    let mut buf = Vec::with_capacity(payload.len() + BASE_CMD_SIZE);
    buf.push(START_OF_PACKET);
    buf.push(code);
    // Fits: payload is at most MAX_PAYLOAD_SIZE bytes
    buf.write_u16::<LittleEndian>(payload.len() as u16)
        .unwrap();
    buf.extend_from_slice(payload);

    let cksum = checksum16(&buf, checksum);
    buf.write_u16::<LittleEndian>(cksum)
        .unwrap();
    buf.push(END_OF_PACKET);

    Ok(buf)
}

/// Validate a response packet and return its payload.
///
/// Fails with [`ErrorCode::Length`] when the packet size does not match
/// `data_size`, with [`Error::Bootloader`] when the status byte is nonzero,
/// and with [`ErrorCode::Data`] when the framing markers are inconsistent.
/// The checksum field is not checked here.
pub fn parse_response(frame: &[u8], data_size: usize) -> Result<&[u8]> {
    let expected = data_size + BASE_CMD_SIZE;
    if frame.len() != expected {
        return Err(Error::frame(
            ErrorCode::Length,
            format!(
                "response is {} bytes, expected {expected}",
                frame.len()
            ),
        ));
    }

    let status = BootloaderStatus::from(frame[1]);
    if !status.is_success() {
        return Err(Error::Bootloader(status));
    }

    let length = usize::from(LittleEndian::read_u16(&frame[2..4]));
    if frame[0] != START_OF_PACKET || length != data_size || frame[expected - 1] != END_OF_PACKET {
        return Err(Error::frame(
            ErrorCode::Data,
            format!("malformed response {frame:02X?}"),
        ));
    }

    Ok(&frame[DATA_OFFSET..DATA_OFFSET + data_size])
}

/// Best-effort status extraction from bytes that did not form the expected
/// response.
///
/// Returns the embedded status only if the bytes form a complete packet with
/// valid start, stop and checksum fields.
pub fn try_parse_status(buf: &[u8], checksum: ChecksumType) -> Option<BootloaderStatus> {
    if buf.len() < BASE_CMD_SIZE || buf[0] != START_OF_PACKET {
        return None;
    }

    let data_size = usize::from(LittleEndian::read_u16(&buf[2..4]));
    let end = data_size + BASE_CMD_SIZE;
    if buf.len() < end || buf[end - 1] != END_OF_PACKET {
        return None;
    }

    let cksum_at = DATA_OFFSET + data_size;
    let expected = LittleEndian::read_u16(&buf[cksum_at..cksum_at + 2]);
    if checksum16(&buf[..cksum_at], checksum) != expected {
        return None;
    }

    Some(BootloaderStatus::from(buf[1]))
}
