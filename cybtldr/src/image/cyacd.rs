//! `.cyacd` and `.cyacd2` firmware images.
//!
//! Both formats are line-oriented ASCII hex. The first data line is a header,
//! every following line is a row (`:` prefix), a comment (`#` prefix, skipped)
//! or, in `.cyacd2` files only, a metadata line (`@` prefix).
//!
//! ## `.cyacd` (version 0)
//!
//! ```text
//! header:  SSSSSSSS RR [CC]                 silicon id (BE), revision, checksum type
//! row:    :AA NNNN LLLL DD..DD KK           array, row (BE), length (BE), data, checksum
//! ```
//!
//! ## `.cyacd2` (version 1)
//!
//! ```text
//! header:  VV SSSSSSSS RR CC AA PPPPPPPP    version, silicon id (LE), revision,
//!                                           checksum type, app id, product id (LE)
//! row:    :AAAAAAAA DD..DD                  address (LE), data
//! meta:   @APPINFO:0x<start>,0x<size>
//!         @EIV:<hex>
//! ```

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::checksum::ChecksumType;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use std::fs;
use std::path::Path;

/// Prefix of row lines.
pub const ROW_PREFIX: char = ':';

/// Prefix of comment lines.
pub const COMMENT_PREFIX: char = '#';

/// Prefix of metadata lines.
pub const META_PREFIX: char = '@';

const APPINFO_PREFIX: &str = "@APPINFO:0x";
const APPINFO_SEPARATOR: &str = ",0x";
const EIV_PREFIX: &str = "@EIV:";

/// array(1) + row(2) + length(2) + checksum(1)
const ROW_MIN_SIZE: usize = 6;
const ROW_DATA_OFFSET: usize = 5;
const ROW_V1_ADDRESS_SIZE: usize = 4;
const HEADER_MIN_SIZE: usize = 5;
const HEADER_V1_SIZE: usize = 12;

/// One line of an image with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Zero-based line index in the file.
    pub index: usize,
    /// Line content without the line terminator.
    pub text: &'a str,
}

/// A firmware image loaded into memory.
#[derive(Clone)]
pub struct FirmwareImage {
    name: String,
    lines: Vec<String>,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading image from: {}", path.display());

        let text = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        Ok(Self::from_text(name, &text))
    }

    /// Build an image from text. `name` decides the format through its
    /// extension.
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        let lines: Vec<String> = text
            .lines()
            .map(|l| l.trim_end_matches(['\r', '\n']).to_string())
            .collect();
        let name = name.into();
        debug!("Image {name}: {} lines", lines.len());
        Self { name, lines }
    }

    /// File name of the image.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of lines, comments included.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Next line at or after `index` that is neither a comment nor blank.
    ///
    /// Returns `None` past the end of the file.
    pub fn read_line(&self, index: usize) -> Option<Line<'_>> {
        self.lines
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, l)| !l.is_empty() && !l.starts_with(COMMENT_PREFIX))
            .map(|(index, text)| Line {
                index,
                text: text.as_str(),
            })
    }

    /// Iterate over the data lines starting at `index`.
    pub fn lines_from(&self, index: usize) -> impl Iterator<Item = Line<'_>> + '_ {
        let mut next = index;
        std::iter::from_fn(move || {
            let line = self.read_line(next)?;
            next = line.index + 1;
            Some(line)
        })
    }

    /// The header line.
    pub fn header_line(&self) -> Result<Line<'_>> {
        self.read_line(0)
            .ok_or_else(|| Error::image(ErrorCode::File, format!("{} has no header", self.name)))
    }

    /// Format version of the image.
    pub fn version(&self) -> Result<u8> {
        detect_file_version(&self.name, self.header_line()?.text)
    }

    /// Start address and size of the application in an address-based image,
    /// scanning from line `index`.
    ///
    /// An `@APPINFO` line wins; otherwise the lowest row address and the sum
    /// of all row lengths are used.
    pub fn app_info(&self, index: usize) -> Result<AppInfo> {
        let mut info = AppInfo {
            start: u32::MAX,
            size: 0,
        };

        for line in self.lines_from(index) {
            if line.text.starts_with(ROW_PREFIX) {
                let row = parse_row_v1(line.text)?;
                info.start = info.start.min(row.address);
                info.size = info.size.saturating_add(row.len());
            } else if line.text.starts_with(APPINFO_PREFIX) {
                return parse_app_info(line.text);
            }
        }

        Ok(info)
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("name", &self.name)
            .field("lines", &self.lines.len())
            .finish()
    }
}

/// Determine the image format version.
///
/// `.cyacd` files are version 0. `.cyacd2` files carry the version in the
/// first header byte, which must not be 0. Any other extension is rejected.
pub fn detect_file_version(file_name: &str, header: &str) -> Result<u8> {
    if header.is_empty() {
        return Err(Error::image(ErrorCode::File, "empty header line"));
    }

    let Some((_, extension)) = file_name.rsplit_once('.') else {
        return Err(Error::image(
            ErrorCode::File,
            format!("{file_name} has no file extension"),
        ));
    };

    if extension.eq_ignore_ascii_case("cyacd2") {
        let Some(digits) = header.get(..2) else {
            return Err(Error::image(ErrorCode::File, "header too short for a version"));
        };
        let version = from_ascii(digits)?[0];
        if version == 0 {
            return Err(Error::image(ErrorCode::Data, "cyacd2 version must not be 0"));
        }
        Ok(version)
    } else if extension.eq_ignore_ascii_case("cyacd") {
        Ok(0)
    } else {
        Err(Error::image(
            ErrorCode::File,
            format!("unsupported file extension .{extension}"),
        ))
    }
}

/// Decode ASCII hex pairs.
pub fn from_ascii(text: &str) -> Result<Vec<u8>> {
    hex::decode(text).map_err(|e| match e {
        hex::FromHexError::OddLength => {
            Error::image(ErrorCode::Length, format!("odd number of hex digits ({})", text.len()))
        },
        other => Error::image(ErrorCode::Data, other.to_string()),
    })
}

/// Header of a `.cyacd` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Header {
    /// Silicon id of the target device.
    pub silicon_id: u32,
    /// Silicon revision of the target device.
    pub silicon_rev: u8,
    /// Frame checksum flag (0 selects the byte sum).
    pub checksum_type: u8,
}

impl Header {
    /// Frame checksum algorithm selected by the header.
    pub fn checksum(&self) -> ChecksumType {
        ChecksumType::from_header_flag(self.checksum_type)
    }
}

/// Parse a `.cyacd` header line.
pub fn parse_header(line: &str) -> Result<Header> {
    let bytes = from_ascii(line)?;
    if bytes.len() < HEADER_MIN_SIZE {
        return Err(Error::image(
            ErrorCode::Length,
            format!("header has {} bytes, need {HEADER_MIN_SIZE}", bytes.len()),
        ));
    }

    Ok(Header {
        silicon_id: BigEndian::read_u32(&bytes[0..4]),
        silicon_rev: bytes[4],
        checksum_type: bytes.get(5).copied().unwrap_or(0),
    })
}

/// One row of a `.cyacd` image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Flash array id.
    pub array_id: u8,
    /// Row number within the array.
    pub row_num: u16,
    /// Row data.
    pub data: Vec<u8>,
    /// Checksum byte of the line.
    pub checksum: u8,
}

impl Row {
    /// Checksum the device is expected to report for this row once it is
    /// programmed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn expected_device_checksum(&self) -> u8 {
        let size = self.data.len() as u32;
        let row = u32::from(self.row_num);
        let sum = u32::from(self.checksum)
            + u32::from(self.array_id)
            + row
            + (row >> 8)
            + size
            + (size >> 8);
        sum as u8
    }
}

/// Parse a `.cyacd` row line.
pub fn parse_row(line: &str) -> Result<Row> {
    let Some(hex) = line.strip_prefix(ROW_PREFIX) else {
        return Err(Error::image(
            ErrorCode::Cmd,
            format!("row must start with '{ROW_PREFIX}'"),
        ));
    };

    let bytes = from_ascii(hex)?;
    if bytes.len() < ROW_MIN_SIZE {
        return Err(Error::image(
            ErrorCode::Length,
            format!("row has {} bytes, need {ROW_MIN_SIZE}", bytes.len()),
        ));
    }

    let size = usize::from(BigEndian::read_u16(&bytes[3..5]));
    if size + ROW_MIN_SIZE != bytes.len() {
        return Err(Error::image(
            ErrorCode::Data,
            format!(
                "row declares {size} data bytes but carries {}",
                bytes.len() - ROW_MIN_SIZE
            ),
        ));
    }

    Ok(Row {
        array_id: bytes[0],
        row_num: BigEndian::read_u16(&bytes[1..3]),
        data: bytes[ROW_DATA_OFFSET..ROW_DATA_OFFSET + size].to_vec(),
        checksum: bytes[bytes.len() - 1],
    })
}

/// Header of a `.cyacd2` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HeaderV1 {
    /// File format version.
    pub file_version: u8,
    /// Silicon id of the target device.
    pub silicon_id: u32,
    /// Silicon revision of the target device.
    pub silicon_rev: u8,
    /// Frame checksum flag (0 selects the byte sum).
    pub checksum_type: u8,
    /// Application slot the image targets.
    pub app_id: u8,
    /// Product id checked by the bootloader.
    pub product_id: u32,
}

impl HeaderV1 {
    /// Frame checksum algorithm selected by the header.
    pub fn checksum(&self) -> ChecksumType {
        ChecksumType::from_header_flag(self.checksum_type)
    }
}

/// Parse a `.cyacd2` header line.
pub fn parse_header_v1(line: &str) -> Result<HeaderV1> {
    let bytes = from_ascii(line)?;
    if bytes.len() != HEADER_V1_SIZE {
        return Err(Error::image(
            ErrorCode::Length,
            format!("cyacd2 header has {} bytes, need {HEADER_V1_SIZE}", bytes.len()),
        ));
    }

    Ok(HeaderV1 {
        file_version: bytes[0],
        silicon_id: LittleEndian::read_u32(&bytes[1..5]),
        silicon_rev: bytes[5],
        checksum_type: bytes[6],
        app_id: bytes[7],
        product_id: LittleEndian::read_u32(&bytes[8..12]),
    })
}

/// One row of a `.cyacd2` image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    /// Flash address of the first byte.
    pub address: u32,
    /// Row data.
    pub data: Vec<u8>,
}

impl DataRow {
    /// Number of data bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Check if the row carries no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse a `.cyacd2` row line.
pub fn parse_row_v1(line: &str) -> Result<DataRow> {
    let Some(hex) = line.strip_prefix(ROW_PREFIX) else {
        return Err(Error::image(
            ErrorCode::Cmd,
            format!("row must start with '{ROW_PREFIX}'"),
        ));
    };

    let bytes = from_ascii(hex)?;
    if bytes.len() < ROW_V1_ADDRESS_SIZE {
        return Err(Error::image(
            ErrorCode::Length,
            format!("row has {} bytes, need an address", bytes.len()),
        ));
    }
    if bytes.len() == ROW_V1_ADDRESS_SIZE {
        return Err(Error::image(ErrorCode::Data, "row carries no data"));
    }

    Ok(DataRow {
        address: LittleEndian::read_u32(&bytes[..ROW_V1_ADDRESS_SIZE]),
        data: bytes[ROW_V1_ADDRESS_SIZE..].to_vec(),
    })
}

/// Application placement in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AppInfo {
    /// First address of the application.
    pub start: u32,
    /// Size of the application in bytes.
    pub size: u32,
}

/// Parse an `@APPINFO:0x<start>,0x<size>` line.
pub fn parse_app_info(line: &str) -> Result<AppInfo> {
    let malformed = || Error::image(ErrorCode::File, format!("malformed APPINFO line: {line}"));

    let rest = line
        .strip_prefix(APPINFO_PREFIX)
        .ok_or_else(malformed)?;
    let (start, size) = rest
        .split_once(APPINFO_SEPARATOR)
        .ok_or_else(malformed)?;

    Ok(AppInfo {
        start: u32::from_str_radix(start.trim(), 16).map_err(|_| malformed())?,
        size: u32::from_str_radix(size.trim(), 16).map_err(|_| malformed())?,
    })
}

/// Decode the initial vector of an `@EIV:` line, or `None` for any other line.
pub fn parse_eiv(line: &str) -> Option<Result<Vec<u8>>> {
    line.strip_prefix(EIV_PREFIX)
        .map(from_ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = "\
0102030405\r
# comment\r
:000010000401020304F2\r
\r
:0000110002AABB00\r
";

    #[test]
    fn test_from_ascii_inverts_hex_encoding() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        assert_eq!(from_ascii(&hex::encode(&bytes)).unwrap(), bytes);
        assert_eq!(from_ascii(&hex::encode_upper(&bytes)).unwrap(), bytes);
        assert!(from_ascii("").unwrap().is_empty());
    }

    #[test]
    fn test_from_ascii_errors() {
        for odd in ["0", "ABC", "01020"] {
            assert_eq!(from_ascii(odd).unwrap_err().code(), ErrorCode::Length as u16);
        }
        assert_eq!(from_ascii("0G").unwrap_err().code(), ErrorCode::Data as u16);
    }

    #[test]
    fn test_detect_file_version() {
        assert_eq!(detect_file_version("fw.cyacd", "0102030405").unwrap(), 0);
        // Header content is irrelevant for version 0.
        assert_eq!(detect_file_version("FW.CYACD", "00").unwrap(), 0);
        assert_eq!(detect_file_version("dir/fw.cyacd2", "01AB").unwrap(), 1);
        assert_eq!(detect_file_version("fw.Cyacd2", "02").unwrap(), 2);

        let err = detect_file_version("x.cyacd2", "00112233").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Data as u16);

        for (name, header) in [("fw.hex", "01"), ("fw", "01"), ("fw.cyacd", ""), ("fw.cyacd2", "1")] {
            let err = detect_file_version(name, header).unwrap_err();
            assert_eq!(err.code(), ErrorCode::File as u16, "{name}");
        }
    }

    #[test]
    fn test_parse_header() {
        let header = parse_header("0102030405").unwrap();
        assert_eq!(header.silicon_id, 0x0102_0304);
        assert_eq!(header.silicon_rev, 0x05);
        assert_eq!(header.checksum_type, 0);
        assert_eq!(header.checksum(), ChecksumType::Sum);

        let header = parse_header("1E1F10690001").unwrap();
        assert_eq!(header.silicon_id, 0x1E1F_1069);
        assert_eq!(header.checksum(), ChecksumType::Crc);

        assert_eq!(parse_header("01020304").unwrap_err().code(), ErrorCode::Length as u16);
    }

    #[test]
    fn test_parse_row() {
        let row = parse_row(":000010000401020304F2").unwrap();
        assert_eq!(row.array_id, 0);
        assert_eq!(row.row_num, 0x0010);
        assert_eq!(row.data, vec![1, 2, 3, 4]);
        assert_eq!(row.checksum, 0xF2);
    }

    #[test]
    fn test_parse_row_errors() {
        assert_eq!(parse_row("000010000401020304F2").unwrap_err().code(), ErrorCode::Cmd as u16);
        assert_eq!(parse_row(":0000100004").unwrap_err().code(), ErrorCode::Length as u16);
        assert_eq!(parse_row(":00001000050102030401").unwrap_err().code(), ErrorCode::Data as u16);
        assert_eq!(parse_row(":0000100").unwrap_err().code(), ErrorCode::Length as u16);
    }

    #[test]
    fn test_expected_device_checksum() {
        let row = Row {
            array_id: 0x01,
            row_num: 0x0102,
            data: vec![0; 0x0180],
            checksum: 0xF0,
        };
        // 0xF0 + 0x01 + 0x0102 + 0x01 + 0x0180 + 0x01 = 0x0375
        assert_eq!(row.expected_device_checksum(), 0x75);
    }

    #[test]
    fn test_read_line_skips_comments_and_blanks() {
        let image = FirmwareImage::from_text("fw.cyacd", IMAGE);
        assert_eq!(image.line_count(), 5);

        let header = image.read_line(0).unwrap();
        assert_eq!(header, Line { index: 0, text: "0102030405" });

        let first = image.read_line(1).unwrap();
        assert_eq!(first.index, 2);
        assert_eq!(first.text, ":000010000401020304F2");

        let second = image.read_line(first.index + 1).unwrap();
        assert_eq!(second.index, 4);
        assert!(image.read_line(second.index + 1).is_none());

        let indices: Vec<usize> = image
            .lines_from(1)
            .map(|l| l.index)
            .collect();
        assert_eq!(indices, vec![2, 4]);
    }

    #[test]
    fn test_image_version_and_empty_image() {
        let image = FirmwareImage::from_text("fw.cyacd", IMAGE);
        assert_eq!(image.version().unwrap(), 0);

        let empty = FirmwareImage::from_text("fw.cyacd", "# nothing\n");
        assert_eq!(empty.version().unwrap_err().code(), ErrorCode::File as u16);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.cyacd");
        std::fs::write(&path, IMAGE).unwrap();

        let image = FirmwareImage::open(&path).unwrap();
        assert_eq!(image.name(), "app.cyacd");
        assert_eq!(image.version().unwrap(), 0);

        let missing = FirmwareImage::open(dir.path().join("missing.cyacd")).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::File as u16);
    }

    #[test]
    fn test_parse_header_v1() {
        let header = parse_header_v1("0104030201050001DDCCBBAA").unwrap();
        assert_eq!(header.file_version, 1);
        assert_eq!(header.silicon_id, 0x0102_0304);
        assert_eq!(header.silicon_rev, 0x05);
        assert_eq!(header.checksum(), ChecksumType::Sum);
        assert_eq!(header.app_id, 1);
        assert_eq!(header.product_id, 0xAABB_CCDD);

        assert_eq!(parse_header_v1("0104030201").unwrap_err().code(), ErrorCode::Length as u16);
    }

    #[test]
    fn test_parse_row_v1() {
        let row = parse_row_v1(":00020010AABBCC").unwrap();
        assert_eq!(row.address, 0x1000_0200);
        assert_eq!(row.data, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(row.len(), 3);

        assert_eq!(parse_row_v1("00020010AA").unwrap_err().code(), ErrorCode::Cmd as u16);
        assert_eq!(parse_row_v1(":000200").unwrap_err().code(), ErrorCode::Length as u16);
        assert_eq!(parse_row_v1(":00020010").unwrap_err().code(), ErrorCode::Data as u16);
    }

    #[test]
    fn test_app_info_from_rows() {
        let image = FirmwareImage::from_text(
            "fw.cyacd2",
            "0104030201050001DDCCBBAA\n:00030000AABB\n:00020000CCDDEE\n",
        );
        let info = image.app_info(1).unwrap();
        assert_eq!(info, AppInfo { start: 0x0200, size: 5 });
    }

    #[test]
    fn test_app_info_line_wins() {
        let image = FirmwareImage::from_text(
            "fw.cyacd2",
            "0104030201050001DDCCBBAA\n@APPINFO:0x10000000,0x8000\n:00020000CCDDEE\n",
        );
        let info = image.app_info(1).unwrap();
        assert_eq!(info, AppInfo { start: 0x1000_0000, size: 0x8000 });

        let err = parse_app_info("@APPINFO:0x10000000;0x8000").unwrap_err();
        assert_eq!(err.code(), ErrorCode::File as u16);
        let err = parse_app_info("@APPINFO:0xZZ,0x8000").unwrap_err();
        assert_eq!(err.code(), ErrorCode::File as u16);
    }

    #[test]
    fn test_parse_eiv() {
        assert_eq!(parse_eiv("@EIV:00112233").unwrap().unwrap(), vec![0x00, 0x11, 0x22, 0x33]);
        assert!(parse_eiv("@APPINFO:0x0,0x0").is_none());
        assert!(parse_eiv("@EIV:123").unwrap().is_err());
    }
}
