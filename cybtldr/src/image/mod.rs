//! Firmware image formats.

pub mod cyacd;

pub use cyacd::{
    AppInfo, DataRow, FirmwareImage, Header, HeaderV1, Line, Row, detect_file_version, from_ascii,
    parse_app_info, parse_eiv, parse_header, parse_header_v1, parse_row, parse_row_v1,
};
