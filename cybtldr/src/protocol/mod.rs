//! Protocol implementations.

pub mod checksum;
pub mod command;
pub mod frame;

// Re-export common types
pub use checksum::{ChecksumType, checksum16, checksum32};
pub use command::{AppStatus, BootloaderInfo, CommandCode, CommandFrame, RowRange, SecurityKey};
pub use frame::{build_frame, parse_response, try_parse_status};
