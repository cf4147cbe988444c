//! Image inspection and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    cybtldr::{
        AppInfo, ChecksumType, Error, FirmwareImage, NativePortEnumerator, PortEnumerator,
        image::cyacd::{ROW_PREFIX, parse_eiv, parse_header, parse_header_v1, parse_row, parse_row_v1},
    },
    std::{collections::BTreeMap, path::Path},
};

/// Rows of one flash array in a `.cyacd` image.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArraySummary {
    array_id: u8,
    first_row: u16,
    last_row: u16,
    rows: usize,
    bytes: usize,
}

/// What an image targets and carries.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageSummary {
    version: u8,
    lines: usize,
    silicon_id: u32,
    silicon_rev: u8,
    checksum: ChecksumType,
    app_id: Option<u8>,
    product_id: Option<u32>,
    app: Option<AppInfo>,
    arrays: Vec<ArraySummary>,
    rows: usize,
    bytes: usize,
    has_eiv: bool,
}

fn checksum_str(checksum: ChecksumType) -> &'static str {
    match checksum {
        ChecksumType::Sum => "sum",
        ChecksumType::Crc => "crc16",
    }
}

/// Parse every line of `image` without talking to a device.
fn summarize(image: &FirmwareImage) -> cybtldr::Result<ImageSummary> {
    let header = image.header_line()?;
    let version = image.version()?;

    let mut summary = ImageSummary {
        version,
        lines: image.line_count(),
        silicon_id: 0,
        silicon_rev: 0,
        checksum: ChecksumType::Sum,
        app_id: None,
        product_id: None,
        app: None,
        arrays: Vec::new(),
        rows: 0,
        bytes: 0,
        has_eiv: false,
    };

    match version {
        0 => {
            let h = parse_header(header.text)?;
            summary.silicon_id = h.silicon_id;
            summary.silicon_rev = h.silicon_rev;
            summary.checksum = h.checksum();

            let mut arrays: BTreeMap<u8, ArraySummary> = BTreeMap::new();
            for line in image.lines_from(header.index + 1) {
                let row = parse_row(line.text)?;
                let entry = arrays.entry(row.array_id).or_insert(ArraySummary {
                    array_id: row.array_id,
                    first_row: row.row_num,
                    last_row: row.row_num,
                    rows: 0,
                    bytes: 0,
                });
                entry.first_row = entry.first_row.min(row.row_num);
                entry.last_row = entry.last_row.max(row.row_num);
                entry.rows += 1;
                entry.bytes += row.data.len();
                summary.rows += 1;
                summary.bytes += row.data.len();
            }
            summary.arrays = arrays.into_values().collect();
        },
        1 => {
            let h = parse_header_v1(header.text)?;
            summary.silicon_id = h.silicon_id;
            summary.silicon_rev = h.silicon_rev;
            summary.checksum = h.checksum();
            summary.app_id = Some(h.app_id);
            summary.product_id = Some(h.product_id);
            summary.app = Some(image.app_info(header.index + 1)?);

            for line in image.lines_from(header.index + 1) {
                if line.text.starts_with(ROW_PREFIX) {
                    let row = parse_row_v1(line.text)?;
                    summary.rows += 1;
                    summary.bytes += row.data.len();
                } else if let Some(iv) = parse_eiv(line.text) {
                    iv?;
                    summary.has_eiv = true;
                }
            }
        },
        other => return Err(Error::Unsupported(format!("image format version {other}"))),
    }

    Ok(summary)
}

fn load_summary(firmware: &Path) -> Result<ImageSummary> {
    let image = FirmwareImage::open(firmware)
        .with_context(|| format!("Failed to load image {}", firmware.display()))?;
    summarize(&image).with_context(|| format!("Invalid image {}", firmware.display()))
}

fn summary_json(summary: &ImageSummary) -> serde_json::Value {
    let arrays: Vec<serde_json::Value> = summary
        .arrays
        .iter()
        .map(|a| {
            serde_json::json!({
                "array_id": a.array_id,
                "first_row": a.first_row,
                "last_row": a.last_row,
                "rows": a.rows,
                "bytes": a.bytes,
            })
        })
        .collect();

    serde_json::json!({
        "format_version": summary.version,
        "lines": summary.lines,
        "silicon_id": format!("0x{:08X}", summary.silicon_id),
        "silicon_rev": summary.silicon_rev,
        "checksum": checksum_str(summary.checksum),
        "app_id": summary.app_id,
        "product_id": summary.product_id.map(|id| format!("0x{id:08X}")),
        "app_start": summary.app.map(|a| format!("0x{:08X}", a.start)),
        "app_size": summary.app.map(|a| a.size),
        "arrays": arrays,
        "rows": summary.rows,
        "bytes": summary.bytes,
        "encrypted": summary.has_eiv,
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    if json {
        let summary = load_summary(firmware)?;
        let output = serde_json::json!({
            "ok": true,
            "data": summary_json(&summary),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{} Loading image {}",
        style("📦").cyan(),
        firmware.display()
    );
    let summary = load_summary(firmware)?;

    eprintln!("\n{}", style("Image Information").bold().underlined());
    let format = if summary.version == 0 { ".cyacd" } else { ".cyacd2" };
    eprintln!("  Format: {format} (version {})", summary.version);
    eprintln!("  Silicon ID: 0x{:08X}", summary.silicon_id);
    eprintln!("  Silicon revision: 0x{:02X}", summary.silicon_rev);
    eprintln!("  Checksum: {}", checksum_str(summary.checksum));
    if let (Some(app_id), Some(product_id)) = (summary.app_id, summary.product_id) {
        eprintln!("  Application: {app_id}");
        eprintln!("  Product ID: 0x{product_id:08X}");
    }
    if let Some(app) = summary.app {
        eprintln!("  Start address: 0x{:08X}", app.start);
        eprintln!("  Application size: {} bytes", app.size);
    }
    if summary.has_eiv {
        eprintln!("  Encrypted: yes");
    }
    eprintln!("  Rows: {}", summary.rows);
    eprintln!("  Data: {} bytes", summary.bytes);

    if !summary.arrays.is_empty() {
        eprintln!("\n{}", style("Flash Arrays").bold().underlined());
        for array in &summary.arrays {
            eprintln!(
                "  [{:02X}] rows {}..={} ({} rows, {} bytes)",
                array.array_id, array.first_row, array.last_row, array.rows, array.bytes
            );
        }
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = NativePortEnumerator::list_ports().context("Failed to list serial ports")?;

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.kind.name(),
                    "known": p.kind.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available Serial Ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.kind.is_known() {
            format!(" [{}]", style(port.kind.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    Ok(())
}
