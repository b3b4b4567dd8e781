//! Link message types
//!
//! Wire format: [4 bytes: length (big-endian)][JSON payload]
//!
//! Every frame is an [`Envelope`]. Peers that predate the envelope send bare
//! payloads; [`Envelope::from_json`] classifies those by shape.

use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::PROTOCOL_VERSION;

/// Payload discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Control,
    Features,
    Prediction,
    /// Heartbeat (keep-alive)
    Ping,
    /// Heartbeat response
    Pong,
}

/// Versioned frame wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            payload,
        }
    }

    /// Control message with a command text
    pub fn control(command: ControlCommand) -> Self {
        Self::new(MessageKind::Control, json!({ "message": command.as_str() }))
    }

    /// Control-channel error notice (e.g. classifier not ready)
    pub fn control_error(message: impl Into<String>) -> Self {
        Self::new(MessageKind::Control, json!({ "error": message.into() }))
    }

    pub fn features(frame: &FeatureFrame) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageKind::Features, serde_json::to_value(frame)?))
    }

    pub fn prediction(frame: &PredictionFrame) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageKind::Prediction, serde_json::to_value(frame)?))
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Null)
    }

    /// Decode the payload into a typed frame
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Serialize to wire format (length-prefixed JSON)
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut wire = Vec::with_capacity(4 + json.len());
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend(json);
        Ok(wire)
    }

    /// Deserialize from JSON bytes (without length prefix)
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(data)?;
        Self::from_value(value)
    }

    /// Classify a decoded JSON value, accepting legacy un-enveloped frames
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::String(_) => Ok(Self::new(MessageKind::Control, value)),
            Value::Object(map) => {
                if map.contains_key("version") && map.contains_key("kind") {
                    return serde_json::from_value(Value::Object(map));
                }
                let kind = legacy_kind(&map);
                Ok(Self::new(kind, Value::Object(map)))
            }
            other => Err(serde_json::Error::custom(format!(
                "unsupported frame shape: {}",
                type_name(&other)
            ))),
        }
    }
}

fn legacy_kind(map: &Map<String, Value>) -> MessageKind {
    if map.contains_key("Source_ip") {
        MessageKind::Prediction
    } else if map.get("message").is_some_and(Value::is_string)
        || (map.len() == 1 && map.contains_key("error"))
    {
        MessageKind::Control
    } else {
        MessageKind::Features
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Commands understood by the capture stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    StartCapture,
    StopCapture,
}

impl ControlCommand {
    /// Parse a command text (case-insensitive, surrounding whitespace ignored)
    pub fn parse_text(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "start packet capture" => Some(ControlCommand::StartCapture),
            "stop packet capture" => Some(ControlCommand::StopCapture),
            _ => None,
        }
    }

    /// Parse a control payload: a bare string or `{"message": string}`
    pub fn from_payload(payload: &Value) -> Option<Self> {
        match payload {
            Value::String(text) => Self::parse_text(text),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .and_then(Self::parse_text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::StartCapture => "Start packet capture",
            ControlCommand::StopCapture => "Stop packet capture",
        }
    }
}

/// Data channel payload: one projected vector per profile plus the source
///
/// Profiles decode one at a time. An entry that is not a list of numbers
/// lands in `rejected` instead of failing the whole frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct FeatureFrame {
    #[serde(rename = "Src_ip")]
    pub src_ip: String,
    #[serde(flatten)]
    pub profiles: BTreeMap<String, Vec<f64>>,
    /// Profile name to decode error, never serialized
    #[serde(skip)]
    pub rejected: BTreeMap<String, String>,
}

impl FeatureFrame {
    pub fn new(src_ip: impl Into<String>) -> Self {
        Self {
            src_ip: src_ip.into(),
            profiles: BTreeMap::new(),
            rejected: BTreeMap::new(),
        }
    }
}

impl From<Map<String, Value>> for FeatureFrame {
    fn from(map: Map<String, Value>) -> Self {
        let mut frame = FeatureFrame::new(unknown_source());
        for (name, value) in map {
            if name == "Src_ip" {
                if let Value::String(ip) = value {
                    frame.src_ip = ip;
                }
                continue;
            }
            if value.is_null() {
                continue;
            }
            match serde_json::from_value::<Vec<f64>>(value) {
                Ok(values) => {
                    frame.profiles.insert(name, values);
                }
                Err(e) => {
                    frame.rejected.insert(name, e.to_string());
                }
            }
        }
        frame
    }
}

fn unknown_source() -> String {
    "unknown".to_string()
}

/// Classification result for one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileOutcome {
    Prediction {
        #[serde(rename = "Prediction")]
        prediction: String,
        /// Percentage in [0, 100]
        #[serde(rename = "Probability", default)]
        probability: f64,
    },
    Error {
        error: String,
    },
}

impl ProfileOutcome {
    pub fn label(&self) -> Option<&str> {
        match self {
            ProfileOutcome::Prediction { prediction, .. } => Some(prediction),
            ProfileOutcome::Error { .. } => None,
        }
    }
}

/// Prediction channel payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionFrame {
    #[serde(rename = "Source_ip", default = "unknown_source")]
    pub source_ip: String,
    /// Set when no profile produced a result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub profiles: BTreeMap<String, Option<ProfileOutcome>>,
}

impl PredictionFrame {
    pub fn new(source_ip: impl Into<String>) -> Self {
        Self {
            source_ip: source_ip.into(),
            error: None,
            profiles: BTreeMap::new(),
        }
    }

    pub fn failed(source_ip: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(source_ip)
        }
    }
}
