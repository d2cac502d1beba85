//! Per-range point configuration and the points file row format.
//!
//! Each non-comment line of a points file describes one address range:
//!
//! ```text
//! TYPE COUNT START DECIMALS MIN MAX DEFAULT PROCESSING @DESCRIPTION INTERVAL [extra...]
//! ```
//!
//! `TYPE` is one of `DO_REG`, `DI_REG`, `IN_REG`, `HR_INT`; anything else is a
//! wide holding register. `INTERVAL` of `#` means every tick. Analog rows
//! (`IN_REG`, `HR_INT`) with at least 16 tokens append
//! `SCALE DEVIATION EGU_MIN EGU_MAX HIGH_LIMIT LOW_LIMIT`; digital rows with
//! at least 11 tokens append `ABNORMAL_VALUE`.
//!
//! Malformed numbers never fail a row: they fall back to `0` (or `1.0` for a
//! zero scale factor).

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::point::PointType;

/// Minimum number of tokens in a row.
pub const MIN_ROW_TOKENS: usize = 10;

/// Tokens needed for an analog row to carry its scaling and limits.
const ANALOG_ROW_TOKENS: usize = 16;

/// Tokens needed for a digital row to carry its abnormal value.
const DIGITAL_ROW_TOKENS: usize = 11;

/// Errors for a single points-file row.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row has {found} tokens, at least 10 required")]
    TooFewTokens { found: usize },
}

/// Errors loading a points file.
#[derive(Debug, Error)]
pub enum PointsFileError {
    #[error("Failed to read points file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration of one contiguous range of points.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem {
    pub registry_type: PointType,
    pub number_of_registers: u16,
    pub start_address: u16,
    pub decimal_separator_place: u16,
    pub min_value: u16,
    pub max_value: u16,
    pub default_value: u16,
    pub processing_type: String,
    pub description: String,
    /// Polling period in ticks.
    pub acquisition_interval: u32,
    /// Scale factor `A` in `EGU = A * raw + B`.
    pub scale_factor: f64,
    /// Deviation `B` in `EGU = A * raw + B`.
    pub deviation: f64,
    pub egu_min: f64,
    pub egu_max: f64,
    pub high_limit: f64,
    pub low_limit: f64,
    /// Raw value that puts a digital point in alarm.
    pub abnormal_value: u16,
}

impl ConfigItem {
    /// Parse a whitespace-separated row.
    pub fn parse_row(row: &str) -> Result<Self, RowError> {
        let tokens: Vec<&str> = row.split_whitespace().collect();
        Self::from_tokens(&tokens)
    }

    /// Build an item from the ordered row tokens.
    pub fn from_tokens(tokens: &[&str]) -> Result<Self, RowError> {
        if tokens.len() < MIN_ROW_TOKENS {
            return Err(RowError::TooFewTokens {
                found: tokens.len(),
            });
        }

        let registry_type = registry_type_from_token(tokens[0]);

        let acquisition_interval = if tokens[9] == "#" {
            1
        } else {
            parse_int(tokens[9]).max(0) as u32
        };

        let mut item = Self {
            registry_type,
            number_of_registers: parse_int(tokens[1]) as u16,
            start_address: parse_int(tokens[2]) as u16,
            decimal_separator_place: parse_int(tokens[3]) as u16,
            min_value: parse_int(tokens[4]) as u16,
            max_value: parse_int(tokens[5]) as u16,
            default_value: parse_int(tokens[6]) as u16,
            processing_type: tokens[7].to_string(),
            description: tokens[8].trim_start_matches('@').to_string(),
            acquisition_interval,
            scale_factor: 1.0,
            deviation: 0.0,
            egu_min: 0.0,
            egu_max: 65535.0,
            high_limit: 60000.0,
            low_limit: 1000.0,
            abnormal_value: 0,
        };

        match registry_type {
            PointType::AnalogInput | PointType::AnalogOutput => {
                if tokens.len() >= ANALOG_ROW_TOKENS {
                    let scale = parse_float(tokens[10]);
                    item.scale_factor = if scale != 0.0 { scale } else { 1.0 };
                    item.deviation = parse_float(tokens[11]);
                    item.egu_min = parse_float(tokens[12]);
                    item.egu_max = parse_float(tokens[13]);
                    item.high_limit = parse_float(tokens[14]);
                    item.low_limit = parse_float(tokens[15]);
                }
            }
            PointType::DigitalInput | PointType::DigitalOutput => {
                // Nominal state is OFF, so ON is abnormal unless configured.
                item.abnormal_value = if tokens.len() >= DIGITAL_ROW_TOKENS {
                    parse_int(tokens[10]) as u16
                } else {
                    1
                };
                item.egu_max = 1.0;
                item.high_limit = 0.0;
                item.low_limit = 0.0;
            }
            PointType::HrLong => {}
        }

        Ok(item)
    }

    /// Whether `address` falls inside this item's range.
    pub fn covers(&self, address: u16) -> bool {
        let start = u32::from(self.start_address);
        let address = u32::from(address);
        address >= start && address < start + u32::from(self.number_of_registers)
    }

    /// Every address in the range, clipped to the 16-bit address space.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.number_of_registers).map_while(|offset| self.start_address.checked_add(offset))
    }
}

fn registry_type_from_token(token: &str) -> PointType {
    match token {
        "DO_REG" => PointType::DigitalOutput,
        "DI_REG" => PointType::DigitalInput,
        "IN_REG" => PointType::AnalogInput,
        "HR_INT" => PointType::AnalogOutput,
        _ => PointType::HrLong,
    }
}

fn parse_int(token: &str) -> i32 {
    token.parse().unwrap_or_else(|_| {
        debug!(token, "Malformed integer in points row, using 0");
        0
    })
}

fn parse_float(token: &str) -> f64 {
    token.parse().unwrap_or_else(|_| {
        debug!(token, "Malformed number in points row, using 0");
        0.0
    })
}

/// Parse the content of a points file.
///
/// Blank lines and lines starting with `;` or `//` are ignored. Rows that
/// cannot be parsed are skipped with a warning.
pub fn parse_points(content: &str) -> Vec<Arc<ConfigItem>> {
    let mut items = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with("//") {
            continue;
        }

        match ConfigItem::parse_row(line) {
            Ok(item) => items.push(Arc::new(item)),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping points row"),
        }
    }

    items
}

/// Load and parse a points file.
pub fn load_points_file(path: impl AsRef<Path>) -> Result<Vec<Arc<ConfigItem>>, PointsFileError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| PointsFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_points(&content))
}
