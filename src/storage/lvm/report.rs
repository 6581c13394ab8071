//! LVM Report Parsing
//!
//! `pvs`/`vgs`/`lvs` are invoked with `--nameprefixes`, which prints one
//! object per line as `LVM2_KEY='value'` pairs. Keys are normalised to
//! lower case without the `LVM2_` prefix.

use crate::domain::types::{LogicalVolume, PhysicalVolume, VolumeGroup};
use crate::error::{Error, Result};
use std::collections::HashMap;

// =============================================================================
// Report Field Lists
// =============================================================================

pub const VG_FIELDS: &str = "vg_name,pv_count,lv_count,snap_count,vg_attr,vg_tags,vg_size,vg_free";
pub const PV_FIELDS: &str = "pv_name,vg_name,pv_attr,pv_size,pv_free,pv_used";
pub const LV_FIELDS: &str =
    "lv_name,vg_name,lv_size,lv_kernel_major,lv_kernel_minor,origin,pool_lv,lv_tags,lv_attr,data_percent";

/// Common reporting flags
pub fn report_args(fields: &str) -> Vec<String> {
    [
        "--nameprefixes",
        "--noheadings",
        "--units",
        "b",
        "--nosuffix",
        "-o",
        fields,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// =============================================================================
// Key=Value Lines
// =============================================================================

/// One report row
pub type Row = HashMap<String, String>;

/// Parse one `LVM2_A='x' LVM2_B='y'` line
pub fn parse_line(line: &str) -> Result<Row> {
    let mut row = Row::new();
    let mut chars = line.trim().chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            return Err(Error::Parse(format!("empty key in report line: {}", line)));
        }

        if chars.next() != Some('\'') {
            return Err(Error::Parse(format!("unquoted value for {} in: {}", key, line)));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                '\'' => {
                    closed = true;
                    break;
                }
                _ => value.push(c),
            }
        }
        if !closed {
            return Err(Error::Parse(format!("unterminated value for {} in: {}", key, line)));
        }

        let key = key.trim_start_matches("LVM2_").to_ascii_lowercase();
        row.insert(key, value);
    }

    Ok(row)
}

/// Parse a whole report, skipping blank lines
pub fn parse_report(output: &str) -> Result<Vec<Row>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

// =============================================================================
// Typed Accessors
// =============================================================================

fn text(row: &Row, key: &str) -> String {
    row.get(key).map(|v| v.trim().to_string()).unwrap_or_default()
}

fn opt_text(row: &Row, key: &str) -> Option<String> {
    let value = text(row, key);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn bytes(row: &Row, key: &str) -> Result<u64> {
    let value = text(row, key);
    let value = value.trim_end_matches(['B', 'b']);
    if value.is_empty() {
        return Ok(0);
    }
    // Sizes are integral with --units b, but tolerate a fractional tail
    if let Some((whole, _)) = value.split_once('.') {
        return whole
            .parse()
            .map_err(|_| Error::Parse(format!("invalid size for {}: {}", key, value)));
    }
    value
        .parse()
        .map_err(|_| Error::Parse(format!("invalid size for {}: {}", key, value)))
}

fn count(row: &Row, key: &str) -> Result<u32> {
    let value = text(row, key);
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| Error::Parse(format!("invalid count for {}: {}", key, value)))
}

fn device_number(row: &Row, key: &str) -> Option<u32> {
    // Inactive LVs report -1
    text(row, key).parse::<i64>().ok().and_then(|n| u32::try_from(n).ok())
}

fn tags(row: &Row, key: &str) -> Vec<String> {
    text(row, key)
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Entity Parsers
// =============================================================================

/// Parse `vgs` output; PV membership is attached by the caller
pub fn parse_vgs(output: &str) -> Result<Vec<VolumeGroup>> {
    parse_report(output)?
        .iter()
        .map(|row| {
            Ok(VolumeGroup {
                name: text(row, "vg_name"),
                pv_count: count(row, "pv_count")?,
                lv_count: count(row, "lv_count")?,
                snap_count: count(row, "snap_count")?,
                attr: text(row, "vg_attr"),
                tags: tags(row, "vg_tags"),
                size_bytes: bytes(row, "vg_size")?,
                free_bytes: bytes(row, "vg_free")?,
                pvs: Vec::new(),
            })
        })
        .collect()
}

/// Parse `pvs` output
pub fn parse_pvs(output: &str) -> Result<Vec<PhysicalVolume>> {
    parse_report(output)?
        .iter()
        .map(|row| {
            Ok(PhysicalVolume {
                name: text(row, "pv_name"),
                vg_name: opt_text(row, "vg_name"),
                attr: text(row, "pv_attr"),
                size_bytes: bytes(row, "pv_size")?,
                free_bytes: bytes(row, "pv_free")?,
                used_bytes: bytes(row, "pv_used")?,
            })
        })
        .collect()
}

/// Parse `lvs` output
pub fn parse_lvs(output: &str) -> Result<Vec<LogicalVolume>> {
    parse_report(output)?
        .iter()
        .map(|row| {
            let attr = text(row, "lv_attr");
            let data_percent = text(row, "data_percent").parse::<f64>().unwrap_or(0.0);
            Ok(LogicalVolume {
                name: text(row, "lv_name"),
                vg_name: text(row, "vg_name"),
                size_bytes: bytes(row, "lv_size")?,
                kernel_major: device_number(row, "lv_kernel_major"),
                kernel_minor: device_number(row, "lv_kernel_minor"),
                origin: opt_text(row, "origin"),
                pool_lv: opt_text(row, "pool_lv"),
                tags: tags(row, "lv_tags"),
                active: attr.chars().nth(4) == Some('a'),
                attr,
                data_percent,
            })
        })
        .collect()
}
