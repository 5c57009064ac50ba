//! Value codecs for LED colors and RF weather sensor packets
//!
//! The hub reports LED colors as six hex digits, while the rest of the home
//! automation stack speaks `R,G,B` triples. Weather sensors on the 433MHz
//! receiver arrive as a packed 32-bit word in the `DA` field.
//!
//! All functions here are pure.

use std::num::IntErrorKind;

use crate::error::{BridgeError, Result};

/// Outcome of a convert-or-passthrough color function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorConversion {
    /// Input was recognised and converted
    Converted(String),
    /// Input was not in the source format and is returned unchanged
    Passthrough(String),
}

impl ColorConversion {
    /// The resulting string, converted or not
    pub fn into_string(self) -> String {
        match self {
            ColorConversion::Converted(s) | ColorConversion::Passthrough(s) => s,
        }
    }

    /// Borrow the resulting string
    pub fn as_str(&self) -> &str {
        match self {
            ColorConversion::Converted(s) | ColorConversion::Passthrough(s) => s,
        }
    }

    /// The converted value, if a conversion took place
    pub fn converted(self) -> Option<String> {
        match self {
            ColorConversion::Converted(s) => Some(s),
            ColorConversion::Passthrough(_) => None,
        }
    }

    /// Check if a conversion took place
    pub fn is_converted(&self) -> bool {
        matches!(self, ColorConversion::Converted(_))
    }
}

/// Convert `"R,G,B"` into six uppercase hex digits.
///
/// Input without a comma is assumed to already be hex and passes through.
pub fn rgb_triple_to_hex(value: &str) -> Result<ColorConversion> {
    if !value.contains(',') {
        return Ok(ColorConversion::Passthrough(value.to_string()));
    }

    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err(BridgeError::format(format!(
            "RGB triple needs 3 components, got {}: {:?}",
            parts.len(),
            value
        )));
    }

    let mut rgb = [0u8; 3];
    for (slot, part) in rgb.iter_mut().zip(parts) {
        *slot = part
            .trim()
            .parse::<u8>()
            .map_err(|_| BridgeError::format(format!("invalid RGB component {:?} in {:?}", part, value)))?;
    }

    Ok(ColorConversion::Converted(format!(
        "{:02X}{:02X}{:02X}",
        rgb[0], rgb[1], rgb[2]
    )))
}

/// Convert six hex digits into `"R,G,B"`.
///
/// Anything that is not exactly six hex digits passes through.
pub fn hex_to_rgb_triple(value: &str) -> ColorConversion {
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return ColorConversion::Passthrough(value.to_string());
    }

    let channel = |i: usize| u8::from_str_radix(&value[i..i + 2], 16).unwrap_or_default();
    ColorConversion::Converted(format!("{},{},{}", channel(0), channel(2), channel(4)))
}

/// Normalise a color command payload to hex.
///
/// Accepts either form; the result is whatever the hub should receive.
pub fn normalize_color(value: &str) -> Result<String> {
    Ok(rgb_triple_to_hex(value.trim())?.into_string())
}

/// Decoded weather sensor packet
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// House code (bits 31-28)
    pub house: u32,
    /// Station, 1-based (bits 27-26)
    pub station: u32,
    /// Relative humidity in percent (bits 23-16)
    pub humidity: u32,
    /// Temperature in Celsius, one decimal
    pub temperature: f64,
    /// Low nibble
    pub id: u32,
    /// Eight bits at offset 18. Overlaps station and humidity; kept as the
    /// sensor reports it.
    pub unknown: u32,
    /// Values are within the plausible range of a weather sensor
    pub valid: bool,
    /// Why the reading is (in)valid
    pub reason: String,
}

const TEMPERATURE_OFFSET: f64 = 50.0;
const PLAUSIBLE_TEMPERATURE: (f64, f64) = (-50.0, 60.0);
const PLAUSIBLE_HUMIDITY: (u32, u32) = (0, 100);

/// Decode a packed weather sensor word given as decimal or `0x` hex.
///
/// Implausible values still decode; `valid` is false and `reason` says why.
pub fn decode_sensor_packet(raw: &str) -> Result<SensorReading> {
    let data = parse_packet_word(raw)?;

    let house = (data >> 28) & 0x0F;
    let station = ((data >> 26) & 0x03) + 1;
    let humidity = (data >> 16) & 0xFF;
    let temperature_raw = (data >> 8) & 0xFF;

    let fraction = (data >> 4) & 0x0F;
    let fraction = f64::from((fraction >> 3) & 1) * 0.5
        + f64::from((fraction >> 2) & 1) * 0.25
        + f64::from((fraction >> 1) & 1) * 0.125
        + f64::from(fraction & 1) * 0.0625;

    let temperature = round_one_decimal(f64::from(temperature_raw) - TEMPERATURE_OFFSET + fraction);

    let plausible = temperature >= PLAUSIBLE_TEMPERATURE.0
        && temperature <= PLAUSIBLE_TEMPERATURE.1
        && humidity >= PLAUSIBLE_HUMIDITY.0
        && humidity <= PLAUSIBLE_HUMIDITY.1;

    let reason = if plausible {
        "Parsed successfully"
    } else {
        "Parsed, but values fall outside typical temperature/humidity range"
    };

    Ok(SensorReading {
        house,
        station,
        humidity,
        temperature,
        id: data & 0x0F,
        unknown: (data >> 18) & 0xFF,
        valid: plausible,
        reason: reason.to_string(),
    })
}

fn parse_packet_word(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => trimmed.parse::<i128>(),
    };

    let value = match parsed {
        Ok(v) => v,
        Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow | IntErrorKind::NegOverflow) => {
            return Err(out_of_range(raw));
        }
        Err(_) => {
            return Err(BridgeError::format(format!(
                "sensor packet {:?} is not a valid integer",
                raw
            )));
        }
    };

    u32::try_from(value).map_err(|_| out_of_range(raw))
}

fn out_of_range(raw: &str) -> BridgeError {
    BridgeError::format(format!(
        "sensor packet {:?} is out of range for a 32-bit word",
        raw
    ))
}

// Ties go to even, so 20.25 reads as 20.2.
fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}
