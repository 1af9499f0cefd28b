//! Control-plane messages exchanged with operators.
//!
//! A command is a JSON object with any subset of the recognized keys; other
//! keys are ignored. The reply echoes the applied fields with their effective
//! (possibly coerced) values, wrapped as `{"return": ...}` on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControlCommand {
    pub resume: Option<bool>,
    pub pause: Option<bool>,
    pub status: Option<bool>,
    pub exit: Option<bool>,
    pub interface: Option<String>,
    pub sample_rate: Option<u32>,
    pub estimation_interval: Option<f64>,
    pub meter_interval: Option<f64>,
    /// Mbit/s.
    pub link_speed: Option<u64>,
    /// Percent.
    pub alarm_trigger: Option<f64>,
    /// Percent of the linerate.
    pub cutoff: Option<f64>,
    /// The command as received, echoed back when nothing in it is recognized.
    #[serde(skip)]
    pub raw: Value,
}

impl ControlCommand {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn from_value(raw: Value) -> Result<Self, serde_json::Error> {
        let mut cmd: ControlCommand = serde_json::from_value(raw.clone())?;
        cmd.raw = raw;
        Ok(cmd)
    }

    #[cfg(test)]
    pub fn status() -> Self {
        Self {
            status: Some(true),
            raw: serde_json::json!({ "status": true }),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn exit() -> Self {
        Self {
            exit: Some(true),
            raw: serde_json::json!({ "exit": true }),
            ..Default::default()
        }
    }
}

/// Fields applied by one command, keyed by what changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Applied {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimation_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_interval: Option<f64>,
    /// Bytes/s, derived from `link_speed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linerate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_trigger: Option<f64>,
    /// Stored fraction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<f64>,
}

impl Applied {
    pub fn is_empty(&self) -> bool {
        *self == Applied::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
    Applied(Applied),
    Unknown {
        #[serde(rename = "unknown option(s)")]
        original: Value,
    },
    Error(String),
}

impl ControlReply {
    pub fn from_applied(applied: Applied, command: &ControlCommand) -> Self {
        if applied.is_empty() {
            ControlReply::Unknown {
                original: command.raw.clone(),
            }
        } else {
            ControlReply::Applied(applied)
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        // Serializing plain data into a Vec cannot fail.
        serde_json::to_vec(&serde_json::json!({ "return": self })).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let cmd = ControlCommand::parse(br#"{"sample_rate": 500, "colour": "red"}"#).unwrap();
        assert_eq!(cmd.sample_rate, Some(500));
        assert_eq!(cmd.raw, json!({"sample_rate": 500, "colour": "red"}));
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(ControlCommand::parse(br#"{"sample_rate": "fast"}"#).is_err());
        assert!(ControlCommand::parse(br#"{"sample_rate": -1}"#).is_err());
        assert!(ControlCommand::parse(br#"[1, 2]"#).is_err());
        assert!(ControlCommand::parse(b"{not json").is_err());
    }

    #[test]
    fn test_parse_accepts_integer_intervals() {
        let cmd = ControlCommand::parse(br#"{"estimation_interval": 5, "cutoff": 90}"#).unwrap();
        assert_eq!(cmd.estimation_interval, Some(5.0));
        assert_eq!(cmd.cutoff, Some(90.0));
    }

    #[test]
    fn test_unknown_reply_shape() {
        let cmd = ControlCommand::parse(br#"{"frobnicate": true}"#).unwrap();
        let reply = ControlReply::from_applied(Applied::default(), &cmd);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"unknown option(s)": {"frobnicate": true}})
        );
    }

    #[test]
    fn test_applied_reply_only_has_set_fields() {
        let applied = Applied {
            sample_rate: Some(500),
            ..Default::default()
        };
        let reply = ControlReply::Applied(applied);
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"sample_rate": 500}));
    }

    #[test]
    fn test_wire_format() {
        let reply = ControlReply::Error("boom".into());
        let wire: Value = serde_json::from_slice(&reply.to_wire()).unwrap();
        assert_eq!(wire, json!({"return": "boom"}));
    }
}
