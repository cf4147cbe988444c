//! Frame and data checksums.
//!
//! Two 16-bit frame checksums are supported, selected per session from the
//! image header: a two's-complement byte sum and a byte-swapped CRC-16
//! (reflected polynomial 0x8408, init 0xFFFF, complemented). Address-based
//! program/verify commands additionally carry a CRC-32C of the row data.

use crc::{CRC_16_IBM_SDLC, CRC_32_ISCSI, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Frame checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ChecksumType {
    /// Two's-complement sum of all bytes.
    #[default]
    Sum,
    /// Byte-swapped CRC-16.
    Crc,
}

impl ChecksumType {
    /// Select the algorithm from the image header flag (0 selects the sum).
    pub fn from_header_flag(flag: u8) -> Self {
        if flag == 0 { Self::Sum } else { Self::Crc }
    }
}

/// Compute the 16-bit frame checksum of `buf`.
#[allow(clippy::cast_possible_truncation)]
pub fn checksum16(buf: &[u8], kind: ChecksumType) -> u16 {
    match kind {
        ChecksumType::Crc => {
            // The complemented CRC of nothing is 0x0000 either way round.
            CRC16
                .checksum(buf)
                .swap_bytes()
        },
        ChecksumType::Sum => {
            let sum = buf
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
            sum.wrapping_neg() as u16
        },
    }
}

/// Compute the CRC-32C of `buf`.
pub fn checksum32(buf: &[u8]) -> u32 {
    CRC32C.checksum(buf)
}
