//! Maps gateway-reported model strings to device types and display labels.

use serde::{Deserialize, Serialize};

/// Device types recognized by this client, keyed by the model string the
/// gateway reports in `read_ack` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Gateway,
    TemperatureHumiditySensor,
    MotionSensor,
    Switch,
    MagnetSensor,
    Plug,
}

/// Resolve a model string to a device type, `None` for unrecognized models.
///
/// Unknown models are not an error here; callers decide whether to skip the
/// device or report it.
pub fn model_to_type(model: &str) -> Option<DeviceType> {
    match model {
        "gateway" => Some(DeviceType::Gateway),
        "sensor_ht" => Some(DeviceType::TemperatureHumiditySensor),
        "motion" => Some(DeviceType::MotionSensor),
        "switch" => Some(DeviceType::Switch),
        "magnet" => Some(DeviceType::MagnetSensor),
        "plug" => Some(DeviceType::Plug),
        _ => None,
    }
}

/// Resolve a model string to a human-readable label.
pub fn model_to_label(model: &str) -> Option<&'static str> {
    match model {
        "gateway" => Some("Gateway"),
        "sensor_ht" => Some("Temperature & Humidity Sensor"),
        "motion" => Some("Motion Sensor"),
        "switch" => Some("Button"),
        "magnet" => Some("Open/close Sensor"),
        "plug" => Some("Plug"),
        _ => None,
    }
}
