//! Wire types exchanged with field devices (via the broker) and the cloud.
//!
//! Notes
//! - Device payloads are free-form JSON objects; only the fields the bridge acts on are typed.
//! - Timestamps stamped by the bridge are UTC strings with microsecond precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::utils::format_timestamp;

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_SECTION_DEVICE_ID: &str = "section_device_id";
pub const FIELD_VALVE_MODE: &str = "valve_mode";
pub const FIELD_FARM_ID: &str = "farm_id";
pub const FIELD_FARM_KEY: &str = "farm_key";

// =====================
// Identity
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FarmId(pub i64);

/// Farm identity sent along with every cloud call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmIdentity {
    pub id: FarmId,
    pub key: String,
}

/// Actuator identity as carried in commands and acknowledgements.
///
/// Devices and the cloud use either strings or integers; both render as plain text
/// in topics and URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionDeviceId(pub String);

impl SectionDeviceId {
    /// Extract a usable id from a JSON value. Null, non-scalar values and strings that
    /// are not a valid id (see [`SectionDeviceId::is_valid`]) yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if Self::is_valid(s) => Some(SectionDeviceId(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(SectionDeviceId(n.to_string())),
            _ => None,
        }
    }

    /// The id ends up as a URL path segment and an MQTT topic level, so only
    /// ASCII alphanumerics and `-_.:` are allowed, and never a bare `.` or `..`.
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
    }
}

impl fmt::Display for SectionDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Sensor readings
// =====================

/// A sensor payload stamped with the time the bridge received it.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    fields: Map<String, Value>,
}

impl SensorReading {
    /// Stamp a device payload. Any device-supplied `timestamp` is replaced by the receipt time.
    pub fn received(mut fields: Map<String, Value>, received_at: DateTime<Utc>) -> Self {
        fields.insert(FIELD_TIMESTAMP.to_string(), Value::String(format_timestamp(received_at)));
        SensorReading { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// One buffer line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}

/// `POST /iot/moisture/<farm_id>` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryBatch {
    pub farm_key: String,
    pub data: Vec<Value>,
}

// =====================
// Valve commands
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveMode {
    Auto,
    Manual,
    ManualOn,
    ManualOff,
    Other(String),
}

impl ValveMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "auto" => ValveMode::Auto,
            "manual" => ValveMode::Manual,
            "manual-on" => ValveMode::ManualOn,
            "manual-off" => ValveMode::ManualOff,
            other => ValveMode::Other(other.to_string()),
        }
    }

    /// `auto` is a standing policy and is re-asserted every cycle.
    pub fn is_auto(&self) -> bool {
        matches!(self, ValveMode::Auto)
    }
}

impl fmt::Display for ValveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveMode::Auto => f.write_str("auto"),
            ValveMode::Manual => f.write_str("manual"),
            ValveMode::ManualOn => f.write_str("manual-on"),
            ValveMode::ManualOff => f.write_str("manual-off"),
            ValveMode::Other(s) => f.write_str(s),
        }
    }
}

/// Reasons a fetched command cannot be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    NotAnObject,
    MissingSectionDeviceId,
    MissingValveMode,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NotAnObject => write!(f, "command entry is not a JSON object"),
            CommandError::MissingSectionDeviceId => write!(f, "{} missing or invalid in command", FIELD_SECTION_DEVICE_ID),
            CommandError::MissingValveMode => write!(f, "{} missing from command", FIELD_VALVE_MODE),
        }
    }
}

impl std::error::Error for CommandError {}

/// A desired actuator state as computed by the cloud.
///
/// `payload` keeps the command exactly as fetched so auxiliary fields
/// (thresholds, timers, status) reach the device untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ValveCommand {
    pub section_device_id: SectionDeviceId,
    pub valve_mode: ValveMode,
    pub timestamp: Option<Value>,
    pub payload: Value,
}

impl ValveCommand {
    pub fn from_value(entry: &Value) -> Result<Self, CommandError> {
        let obj = entry.as_object().ok_or(CommandError::NotAnObject)?;
        let section_device_id = obj
            .get(FIELD_SECTION_DEVICE_ID)
            .and_then(SectionDeviceId::from_value)
            .ok_or(CommandError::MissingSectionDeviceId)?;
        let valve_mode = obj
            .get(FIELD_VALVE_MODE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ValveMode::parse)
            .ok_or(CommandError::MissingValveMode)?;
        let timestamp = obj.get(FIELD_TIMESTAMP).filter(|v| !v.is_null()).cloned();

        Ok(ValveCommand {
            section_device_id,
            valve_mode,
            timestamp,
            payload: entry.clone(),
        })
    }
}

/// `GET /iot/valve/<farm_id>` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValveCommandsRequest {
    pub farm_key: String,
}

/// `GET /iot/valve/<farm_id>` response. Entries stay raw so one bad entry cannot spoil the rest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ValveCommandsResponse {
    #[serde(default)]
    pub data: Vec<Value>,
}

// =====================
// Command acknowledgements
// =====================

/// `POST /iot/valve/<section_device_id>` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValveAck {
    pub farm_key: String,
    pub farm_id: FarmId,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn section_device_id_accepts_strings_and_integers() {
        assert_eq!(SectionDeviceId::from_value(&json!("S1")), Some(SectionDeviceId("S1".into())));
        assert_eq!(SectionDeviceId::from_value(&json!(6)), Some(SectionDeviceId("6".into())));
        assert_eq!(SectionDeviceId::from_value(&json!("")), None);
        assert_eq!(SectionDeviceId::from_value(&Value::Null), None);
        assert_eq!(SectionDeviceId::from_value(&json!(1.5)), None);
        assert_eq!(SectionDeviceId::from_value(&json!({"id": 1})), None);
    }

    #[test]
    fn section_device_id_rejects_path_and_topic_characters() {
        for bad in ["a/b", "../admin", "..", ".", "S 1", " S1", "S1?x=1", "S1#", "dev+", "S%2F1", "é"] {
            assert_eq!(SectionDeviceId::from_value(&json!(bad)), None, "{:?} accepted", bad);
        }
        for good in ["S1", "field-2_valve.3", "zone:4", "-1"] {
            assert!(SectionDeviceId::from_value(&json!(good)).is_some(), "{:?} rejected", good);
        }
        assert_eq!(SectionDeviceId::from_value(&json!(-4)), Some(SectionDeviceId("-4".into())));
    }

    #[test]
    fn command_with_unsafe_device_id_is_rejected() {
        assert!(matches!(
            ValveCommand::from_value(&json!({"section_device_id": "6/../../admin", "valve_mode": "auto"})),
            Err(CommandError::MissingSectionDeviceId)
        ));
    }

    #[test]
    fn reading_receipt_time_replaces_device_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();
        let mut fields = Map::new();
        fields.insert("moisture".into(), json!(42));
        fields.insert("timestamp".into(), json!("device-clock"));

        let reading = SensorReading::received(fields, at);
        assert_eq!(reading.fields()["timestamp"], json!("2024-05-01T06:30:00.000000Z"));
        assert_eq!(
            reading.to_line().unwrap(),
            r#"{"moisture":42,"timestamp":"2024-05-01T06:30:00.000000Z"}"#
        );
    }

    #[test]
    fn valve_command_requires_identity_and_mode() {
        let cmd = ValveCommand::from_value(&json!({
            "section_device_id": "S1",
            "valve_mode": "manual-on",
            "timestamp": "T1",
            "manual_off_timer": 10
        }))
        .unwrap();
        assert_eq!(cmd.section_device_id.0, "S1");
        assert_eq!(cmd.valve_mode, ValveMode::ManualOn);
        assert_eq!(cmd.timestamp, Some(json!("T1")));
        assert_eq!(cmd.payload["manual_off_timer"], json!(10));

        assert_eq!(
            ValveCommand::from_value(&json!({"valve_mode": "auto"})),
            Err(CommandError::MissingSectionDeviceId)
        );
        assert_eq!(
            ValveCommand::from_value(&json!({"section_device_id": 3, "valve_mode": ""})),
            Err(CommandError::MissingValveMode)
        );
        assert_eq!(ValveCommand::from_value(&json!([1, 2])), Err(CommandError::NotAnObject));
    }

    #[test]
    fn unknown_modes_are_kept_verbatim() {
        let mode = ValveMode::parse("scheduled");
        assert_eq!(mode, ValveMode::Other("scheduled".into()));
        assert_eq!(mode.to_string(), "scheduled");
        assert!(!mode.is_auto());
        assert!(ValveMode::parse("auto").is_auto());
    }

    #[test]
    fn ack_body_flattens_device_fields() {
        let mut fields = Map::new();
        fields.insert("mode".into(), json!("auto"));
        fields.insert("status".into(), json!("off"));
        let ack = ValveAck {
            farm_key: "K".into(),
            farm_id: FarmId(1),
            timestamp: "2024-05-01T06:30:00.000000Z".into(),
            fields,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({
                "farm_key": "K",
                "farm_id": 1,
                "timestamp": "2024-05-01T06:30:00.000000Z",
                "mode": "auto",
                "status": "off"
            })
        );
    }

    #[test]
    fn commands_response_tolerates_missing_data() {
        let resp: ValveCommandsResponse = serde_json::from_str(r#"{"message":"none"}"#).unwrap();
        assert!(resp.data.is_empty());
    }
}
