//! Live session wire protocol
//!
//! Every frame is a JSON array `[command, payload?, flag?]`. Trailing blank
//! elements (null or empty string) are omitted on encode; a blank payload
//! followed by a flag is sent as `null` to keep the flag in third position.

use crate::types::{Call, CallId, CallUnit, Frequency};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Live protocol command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Single call delivery or fetch
    Call,
    /// Configuration snapshot
    Config,
    /// Access code expired
    Expired,
    /// Call search / list
    ListCalls,
    /// Listener count update
    ListenersCount,
    /// Live feed matrix update
    LivefeedMap,
    /// Too many sessions for this access code
    MaxSessions,
    /// PIN submit, or prompt for one
    Pin,
    /// Version handshake
    Version,
    /// Anything else
    Unknown(String),
}

impl Command {
    /// Three-letter wire form
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Call => "CAL",
            Self::Config => "CFG",
            Self::Expired => "XPR",
            Self::ListCalls => "LCL",
            Self::ListenersCount => "LSC",
            Self::LivefeedMap => "LFM",
            Self::MaxSessions => "MAX",
            Self::Pin => "PIN",
            Self::Version => "VER",
            Self::Unknown(other) => other,
        }
    }

    /// Parse the wire form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "CAL" => Self::Call,
            "CFG" => Self::Config,
            "XPR" => Self::Expired,
            "LCL" => Self::ListCalls,
            "LSC" => Self::ListenersCount,
            "LFM" => Self::LivefeedMap,
            "MAX" => Self::MaxSessions,
            "PIN" => Self::Pin,
            "VER" => Self::Version,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live protocol frame
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Command
    pub command: Command,
    /// Optional payload
    pub payload: Option<Value>,
    /// Optional flag, echoed back on call fetches
    pub flag: Option<Value>,
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn non_blank(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !is_blank(v))
}

impl Message {
    /// A bare command
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            payload: None,
            flag: None,
        }
    }

    /// Attach a payload; blank values are dropped
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = non_blank(Some(payload.into()));
        self
    }

    /// Attach a flag; blank values are dropped
    #[must_use]
    pub fn with_flag(mut self, flag: Option<Value>) -> Self {
        self.flag = non_blank(flag);
        self
    }

    /// Decode a text frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the frame is not a 1 to 3 element
    /// array headed by a string command.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Encode to a text frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let payload = self.payload.as_ref().filter(|v| !is_blank(v));
        let flag = self.flag.as_ref().filter(|v| !is_blank(v));
        let len = if flag.is_some() {
            3
        } else if payload.is_some() {
            2
        } else {
            1
        };

        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(self.command.as_str())?;
        if len > 1 {
            seq.serialize_element(payload.unwrap_or(&Value::Null))?;
        }
        if let Some(flag) = flag {
            seq.serialize_element(flag)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let Value::Array(elements) = Value::deserialize(deserializer)? else {
            return Err(D::Error::custom("message is not an array"));
        };
        if elements.is_empty() || elements.len() > 3 {
            return Err(D::Error::custom(format!(
                "message has {} elements",
                elements.len()
            )));
        }

        let mut elements = elements.into_iter();
        let command = match elements.next() {
            Some(Value::String(command)) => Command::parse(&command),
            _ => return Err(D::Error::custom("command is not a string")),
        };

        Ok(Self {
            command,
            payload: non_blank(elements.next()),
            flag: non_blank(elements.next()),
        })
    }
}

/// Call as delivered to live clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    /// Call id
    pub id: Option<CallId>,
    /// Base64 encoded audio
    pub audio: String,
    /// Audio filename
    pub audio_name: String,
    /// Audio MIME type
    pub audio_type: String,
    /// Capture timestamp
    pub date_time: DateTime<Utc>,
    /// Primary frequency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    /// Frequency observations
    #[serde(default)]
    pub frequencies: Vec<Frequency>,
    /// Patched talkgroups
    #[serde(default)]
    pub patches: Vec<u32>,
    /// Site reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// First transmitting unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<u32>,
    /// Unit observations
    #[serde(default)]
    pub sources: Vec<CallUnit>,
    /// System reference
    pub system: Option<u32>,
    /// Talkgroup reference
    pub talkgroup: Option<u32>,
}

impl From<&Call> for CallPayload {
    fn from(call: &Call) -> Self {
        Self {
            id: call.id,
            audio: STANDARD.encode(&call.audio),
            audio_name: call.audio_name.clone(),
            audio_type: call.audio_mime.clone(),
            date_time: call.timestamp,
            frequency: call.frequency,
            frequencies: call.frequencies.clone(),
            patches: call.patches.clone(),
            site: call.site_ref.clone(),
            source: call.units.first().map(|unit| unit.unit_ref),
            sources: call.units.clone(),
            system: call.system_ref(),
            talkgroup: call.talkgroup_ref(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;
    use crate::types::CallMeta;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_three_element_round_trip() {
        let message = Message::new(Command::Call)
            .with_payload(json!({"id": 42}))
            .with_flag(Some(json!("d")));
        let text = message.encode().unwrap();

        assert_eq!(text, r#"["CAL",{"id":42},"d"]"#);
        assert_eq!(Message::decode(&text).unwrap(), message);
    }

    #[test]
    fn test_blank_payload_and_flag_are_omitted() {
        let message = Message {
            command: Command::Pin,
            payload: Some(json!("")),
            flag: Some(Value::Null),
        };
        let text = message.encode().unwrap();
        assert_eq!(text, r#"["PIN"]"#);

        let decoded = Message::decode(&text).unwrap();
        assert_eq!(decoded.command, Command::Pin);
        assert_eq!(decoded.payload, None);
        assert_eq!(decoded.flag, None);
    }

    #[test]
    fn test_blank_payload_keeps_flag_position() {
        let message = Message::new(Command::ListCalls).with_flag(Some(json!(1)));
        assert_eq!(message.encode().unwrap(), r#"["LCL",null,1]"#);
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        for text in [r#"{"cmd":"PIN"}"#, "[]", "[1]", r#"["PIN",1,2,3]"#, "not json"] {
            assert!(
                matches!(Message::decode(text), Err(Error::Protocol(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_unknown_command_survives() {
        let decoded = Message::decode(r#"["XYZ"]"#).unwrap();
        assert_eq!(decoded.command, Command::Unknown("XYZ".to_string()));
        assert_eq!(decoded.encode().unwrap(), r#"["XYZ"]"#);
    }

    #[test]
    fn test_call_payload_from_call() {
        let call = Call {
            id: Some(9),
            audio: vec![1, 2, 3],
            audio_name: "a.m4a".to_string(),
            audio_mime: "audio/mp4".to_string(),
            units: vec![CallUnit {
                unit_ref: 4242,
                offset: 0.0,
                label: None,
            }],
            meta: CallMeta {
                system_ref: Some(1),
                talkgroup_ref: Some(10),
                ..CallMeta::default()
            },
            ..Call::default()
        };
        let payload = CallPayload::from(&call);

        assert_eq!(payload.audio, "AQID");
        assert_eq!(payload.source, Some(4242));
        assert_eq!(payload.system, Some(1));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["audioName"], "a.m4a");
        assert_eq!(value["talkgroup"], 10);
    }

    proptest! {
        #[test]
        fn prop_envelope_round_trip(
            command in "[A-Z]{3}",
            payload in proptest::option::of(1i64..1_000_000),
            flag in proptest::option::of("[a-z]{1,8}"),
        ) {
            let message = Message {
                command: Command::parse(&command),
                payload: payload.map(Value::from),
                flag: flag.map(Value::from),
            };
            let decoded = Message::decode(&message.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }
}
