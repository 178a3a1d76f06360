use serde::{Deserialize, Serialize};

use crate::constants::{EventType, PROTOCOL_VERSION};

/// Typed, identified unit of socket communication.
///
/// `event_id` identifies a single envelope; `trace_id` threads a logical
/// request/receipt pair. The `payload` field uses
/// `serde_json::value::RawValue` so decoding is deferred until the type is
/// known.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub v: u32,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub system_id: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
}

impl Envelope {
    /// Creates a new envelope with the given identifiers and payload.
    pub fn new<T: Serialize>(
        event_id: impl Into<String>,
        trace_id: impl Into<String>,
        event_type: EventType,
        system_id: impl Into<String>,
        seq: u64,
        ts: impl Into<String>,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            v: PROTOCOL_VERSION,
            event_id: event_id.into(),
            trace_id: trace_id.into(),
            event_type,
            system_id: system_id.into(),
            seq,
            ts: ts.into(),
            payload: raw,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}
