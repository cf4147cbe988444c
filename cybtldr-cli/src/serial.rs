//! Interactive serial port selection.
//!
//! - Auto-selection of a single port behind a known USB bridge
//! - Interactive selection via dialoguer when several candidates exist
//! - Remembering bridges in configuration
//! - Non-interactive mode for scripts and CI

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    cybtldr::{DeviceKind, NativePortEnumerator, PortEnumerator, PortInfo},
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not only known bridges.
    pub list_all_ports: bool,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Confirm even a single recognized port.
    pub confirm_port: bool,
}

/// Selected port and whether it matched a known bridge.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port info.
    pub port: PortInfo,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

/// Select a serial port from CLI options, configuration or the system.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, config));
    }

    if let Some(port_name) = &config.port.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, config));
    }

    let ports = NativePortEnumerator::list_ports()?;
    if ports.is_empty() {
        return Err(usage_err("no serial ports found"));
    }

    select_from_ports(ports, options, config)
}

fn select_from_ports(
    ports: Vec<PortInfo>,
    options: &SerialOptions,
    config: &Config,
) -> Result<SelectedPort> {
    let known_ports: Vec<PortInfo> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let candidates = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        },
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err("no serial ports available"));
            };
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.kind.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

/// Exactly one candidate is selected; zero or several are usage errors.
fn select_non_interactive_port(candidates: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err("no serial ports available"));
            };
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                usage_err("port prompt failed")
            }
        },
    }
}

/// Look up a port by name, falling back to an unclassified entry.
fn find_port_by_name(name: &str, config: &Config) -> SelectedPort {
    let ports = NativePortEnumerator::list_ports().unwrap_or_default();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    if let Some(port) = found {
        return SelectedPort {
            is_known: is_known_device(port, config),
            port: port.clone(),
        };
    }

    SelectedPort {
        port: PortInfo {
            name: name.to_string(),
            kind: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        },
        is_known: false,
    }
}

/// Check if a port is behind a built-in or configured bridge.
fn is_known_device(port: &PortInfo, config: &Config) -> bool {
    if port.kind.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &PortInfo, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.kind.is_known() {
        format!(" [{}]", style(port.kind.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Known bridges are shown in bold").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    // Truncate labels so narrow terminals do not wrap the list.
    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p, config), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled_err()),
    }
}

fn confirm_single_port(port: PortInfo) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled_err())
    }
}

/// Offer to remember the bridge of a port that was not recognized.
pub fn ask_remember_port(port: &PortInfo, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB device for auto-detection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsbDevice;

    fn port(name: &str, kind: DeviceKind, vid: Option<u16>, pid: Option<u16>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            kind,
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    fn non_interactive() -> SerialOptions {
        SerialOptions {
            non_interactive: true,
            ..Default::default()
        }
    }

    fn usage_message(err: &anyhow::Error) -> Option<&str> {
        match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(msg)) => Some(msg.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_is_known_device_builtin() {
        let kitprog = port("/dev/ttyACM0", DeviceKind::KitProg, Some(0x04B4), Some(0xF155));
        assert!(is_known_device(&kitprog, &Config::default()));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let unknown = port("/dev/ttyUSB0", DeviceKind::Unknown, Some(0xABCD), Some(0x1234));
        let mut config = Config::default();
        assert!(!is_known_device(&unknown, &config));

        config.port.usb_device.push(UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&unknown, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        let plain = port("/dev/ttyS0", DeviceKind::Unknown, None, None);
        assert!(!is_known_device(&plain, &Config::default()));
    }

    #[test]
    fn test_non_interactive_single_port_selected() {
        let ports = vec![port("/dev/ttyUSB0", DeviceKind::Unknown, None, None)];
        let selected = select_from_ports(ports, &non_interactive(), &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_non_interactive_prefers_known_bridge() {
        let ports = vec![
            port("/dev/ttyS0", DeviceKind::Unknown, None, None),
            port("/dev/ttyACM0", DeviceKind::KitProg, Some(0x04B4), Some(0xF155)),
        ];
        let selected = select_from_ports(ports, &non_interactive(), &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyACM0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let ports = vec![
            port("/dev/ttyUSB0", DeviceKind::Unknown, None, None),
            port("/dev/ttyUSB1", DeviceKind::Unknown, None, None),
        ];
        let err = select_from_ports(ports, &non_interactive(), &Config::default()).unwrap_err();
        assert!(usage_message(&err).is_some_and(|m| m.contains("multiple")));
    }

    #[test]
    fn test_non_interactive_list_all_ports_counts_every_port() {
        let ports = vec![
            port("/dev/ttyS0", DeviceKind::Unknown, None, None),
            port("/dev/ttyACM0", DeviceKind::KitProg, Some(0x04B4), Some(0xF155)),
        ];
        let options = SerialOptions {
            list_all_ports: true,
            ..non_interactive()
        };
        let err = select_from_ports(ports, &options, &Config::default()).unwrap_err();
        assert!(usage_message(&err).is_some());
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![], &Config::default()).unwrap_err();
        assert!(usage_message(&err).is_some());
    }

    #[test]
    fn test_port_label_includes_bridge_and_ids() {
        console::set_colors_enabled(false);
        let known = port("/dev/ttyACM0", DeviceKind::KitProg, Some(0x04B4), Some(0xF155));
        assert_eq!(port_label(&known, &Config::default()), "/dev/ttyACM0 [KitProg]");

        let mut unknown = port("COM7", DeviceKind::Unknown, Some(0xABCD), Some(0x0001));
        unknown.product = Some("Board".to_string());
        assert_eq!(
            port_label(&unknown, &Config::default()),
            "COM7 (ABCD:0001) - Board"
        );
    }
}
