//! Command string builders for the gateway UDP protocol.
//!
//! Commands are flat JSON objects sent as UDP payloads. Write commands carry
//! a `data` field whose value is a second JSON object serialized and then
//! quote-escaped into the outer layer. The gateway firmware parses exactly
//! this nested-string convention, so the builders here produce it verbatim
//! instead of going through a JSON serializer.

use serde_json::Value;

use crate::protocol::crypto;

/// Convert a field value to its wire representation.
///
/// String values are wrapped in quotes verbatim, without escaping: values
/// destined for the nested `data` layer arrive pre-escaped from
/// [`build_write_data`] and must not be escaped a second time. Object, array,
/// number and bool values are inlined as raw JSON.
fn to_json_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        other => other.to_string(),
    }
}

/// Escape embedded quotes for the nested-JSON layer.
fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// Build a flat command object with mandatory `cmd`, optional `sid`, and the
/// given fields appended in call order.
pub fn build_command(cmd: &str, sid: Option<&str>, fields: &[(&str, Value)]) -> String {
    let mut message = String::from("{");
    message.push_str(&format!("\"cmd\": \"{}\"", cmd));

    if let Some(sid) = sid {
        message.push_str(&format!(", \"sid\": \"{}\"", sid));
    }

    for (key, value) in fields {
        message.push_str(&format!(", \"{}\": {}", key, to_json_value(value)));
    }

    message.push('}');
    message
}

/// Build the encrypted `data` payload for a write command.
///
/// Each field is written with `\"`-escaped keys and string values, then a
/// trailing `key` field carrying the encrypted session token is appended.
/// When the token or pre-shared key is missing the command is still produced
/// with an empty `key` value: the gateway will reject it, but local device
/// control stays operational and the condition is reported as a warning.
pub fn build_write_data(fields: &[(&str, Value)], token: Option<&str>, key: Option<&str>) -> String {
    let mut data = String::from("{");

    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            data.push_str(", ");
        }
        data.push_str(&format!(
            "\\\"{}\\\": {}",
            name,
            escape_quotes(&to_json_value(value))
        ));
    }

    let cipher = match (token, key) {
        (Some(token), Some(key)) => match crypto::encrypt(token, key) {
            Ok(cipher) => cipher,
            Err(e) => {
                tracing::warn!("Cannot encrypt write command key: {}", e);
                String::new()
            }
        },
        (None, _) => {
            tracing::warn!("No session token received yet, gateway will reject this write");
            String::new()
        }
        (_, None) => {
            tracing::warn!("No pre-shared key configured, gateway will reject this write");
            String::new()
        }
    };

    data.push_str(&format!(", \\\"key\\\": \\\"{}\\\"", cipher));
    data.push('}');
    data
}

/// Command builders for the gateway protocol.
pub struct Commands;

impl Commands {
    /// Enumerate all device identifiers known to the gateway.
    pub fn discover() -> String {
        build_command("get_id_list", None, &[])
    }

    /// Request the full state of a single device.
    pub fn read(sid: &str) -> String {
        build_command("read", Some(sid), &[])
    }

    /// Write to a device, with `data` produced by [`build_write_data`].
    pub fn write(sid: &str, data: String) -> String {
        build_command("write", Some(sid), &[("data", Value::String(data))])
    }
}
