//! Hub wire frames
//!
//! The NinjaCape speaks one JSON object per line. Inbound objects are
//! classified by their top-level key; outbound commands always carry a
//! single `DEVICE` entry.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

/// One entry of an `ERROR` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubError {
    /// `CODE`, rendered as text whatever its JSON type
    pub code: String,
    /// `ERR`
    pub message: String,
}

/// First element of a `DEVICE` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUpdate {
    /// `G`
    pub group: String,
    /// `V`
    pub protocol: u32,
    /// `D`
    pub device_id: u32,
    /// `DA`, rendered as text whatever its JSON type
    pub value: String,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFrame {
    /// `ACK`
    Ack,
    /// `ERROR` with its entries
    Error(Vec<HubError>),
    /// `DEVICE`
    Device(DeviceUpdate),
    /// Valid JSON object with none of the known keys
    Unknown,
}

impl HubFrame {
    /// Parse and classify one line from the hub.
    ///
    /// `ERROR` wins over `ACK`, which wins over `DEVICE`. Returns
    /// [`BridgeError::Format`] for anything that is not a JSON object or a
    /// `DEVICE` frame missing its fields.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        let object = value
            .as_object()
            .ok_or_else(|| BridgeError::format(format!("expected a JSON object: {}", line.trim())))?;

        if let Some(errors) = object.get("ERROR") {
            return Ok(HubFrame::Error(parse_errors(errors)));
        }
        if object.contains_key("ACK") {
            return Ok(HubFrame::Ack);
        }
        if let Some(devices) = object.get("DEVICE") {
            return parse_device(devices).map(HubFrame::Device);
        }
        Ok(HubFrame::Unknown)
    }

    /// Frame kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            HubFrame::Ack => "ack",
            HubFrame::Error(_) => "error",
            HubFrame::Device(_) => "device",
            HubFrame::Unknown => "unknown",
        }
    }
}

fn parse_errors(errors: &Value) -> Vec<HubError> {
    let entries = match errors {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    };

    entries
        .into_iter()
        .map(|entry| HubError {
            code: entry
                .get("CODE")
                .map(value_to_text)
                .unwrap_or_else(|| "Unknown code".to_string()),
            message: entry
                .get("ERR")
                .map(value_to_text)
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
        .collect()
}

fn parse_device(devices: &Value) -> Result<DeviceUpdate> {
    let first = devices
        .as_array()
        .and_then(|items| items.first())
        .and_then(Value::as_object)
        .ok_or_else(|| BridgeError::format("DEVICE frame without an entry"))?;

    Ok(DeviceUpdate {
        group: first.get("G").map(value_to_text).unwrap_or_default(),
        protocol: required_u32(first, "V")?,
        device_id: required_u32(first, "D")?,
        value: first
            .get("DA")
            .map(value_to_text)
            .ok_or_else(|| BridgeError::format("DEVICE entry without DA"))?,
    })
}

fn required_u32(entry: &Map<String, Value>, key: &str) -> Result<u32> {
    let value = entry
        .get(key)
        .ok_or_else(|| BridgeError::format(format!("DEVICE entry without {}", key)))?;

    let number = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    number
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| BridgeError::format(format!("DEVICE field {} is not an id: {}", key, value)))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Command sent to the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCommand {
    /// Set a device value
    DeviceSet {
        /// Target device
        device_id: u32,
        /// Group, always "0" for the cape's own devices
        group: String,
        /// Protocol/mode field
        mode: u32,
        /// Value, hex for LEDs
        value: String,
    },
}

#[derive(Serialize)]
struct WireDevice<'a> {
    #[serde(rename = "G")]
    group: &'a str,
    #[serde(rename = "V")]
    mode: u32,
    #[serde(rename = "D")]
    device_id: u32,
    #[serde(rename = "DA")]
    value: &'a str,
}

#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(rename = "DEVICE")]
    device: [WireDevice<'a>; 1],
}

impl HubCommand {
    /// Set `device_id` to `value` in group "0", mode 0
    pub fn device_set(device_id: u32, value: impl Into<String>) -> Self {
        HubCommand::DeviceSet {
            device_id,
            group: "0".to_string(),
            mode: 0,
            value: value.into(),
        }
    }

    /// Target device
    pub fn device_id(&self) -> u32 {
        match self {
            HubCommand::DeviceSet { device_id, .. } => *device_id,
        }
    }

    /// Serialize to the newline-terminated wire frame
    pub fn to_wire(&self) -> Result<String> {
        let HubCommand::DeviceSet {
            device_id,
            group,
            mode,
            value,
        } = self;

        let frame = WireFrame {
            device: [WireDevice {
                group,
                mode: *mode,
                device_id: *device_id,
                value,
            }],
        };

        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        Ok(line)
    }
}
