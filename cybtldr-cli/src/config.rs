//! Configuration file support for cybtldr.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CYBTLDR_*)
//! 3. Local config file (./cybtldr.toml)
//! 4. Global config file (~/.config/cybtldr/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "cybtldr.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Serial link settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Largest packet written at once.
    pub max_transfer_size: Option<usize>,
    /// Per-poll read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Additional USB bridges to treat as known.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Response polling settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    /// Read polls per command.
    pub max_polls: Option<u32>,
    /// Sleep between incomplete polls in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Wall-clock limit per command in milliseconds.
    pub deadline_ms: Option<u64>,
}

/// Bootload defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootloadConfig {
    /// Security key as twelve hex digits.
    pub security_key: Option<String>,
    /// Application slot for `.cyacd` images on multi-application targets.
    pub app_id: Option<u8>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial link configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferSection,
    /// Bootload configuration.
    #[serde(default)]
    pub bootload: BootloadConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "cybtldr").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            port,
            transfer,
            bootload,
        } = other;

        self.port.serial = port.serial.or(self.port.serial.take());
        self.port.baud = port.baud.or(self.port.baud);
        self.port.max_transfer_size = port.max_transfer_size.or(self.port.max_transfer_size);
        self.port.timeout_ms = port.timeout_ms.or(self.port.timeout_ms);
        for device in port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        self.transfer.max_polls = transfer.max_polls.or(self.transfer.max_polls);
        self.transfer.poll_interval_ms = transfer
            .poll_interval_ms
            .or(self.transfer.poll_interval_ms);
        self.transfer.deadline_ms = transfer.deadline_ms.or(self.transfer.deadline_ms);

        self.bootload.security_key = bootload
            .security_key
            .or(self.bootload.security_key.take());
        self.bootload.app_id = bootload.app_id.or(self.bootload.app_id);
    }

    /// Save a USB bridge for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG_FILE).exists() {
            PathBuf::from(LOCAL_CONFIG_FILE)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG_FILE)
        };

        // Keep whatever else the target file already holds.
        let mut stored = Self::load_from_file(&path).unwrap_or_default();
        stored.port.usb_device.push(device.clone());
        self.port.usb_device.push(device);

        let content = toml::to_string_pretty(&stored)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
