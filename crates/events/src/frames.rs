//! Messages exchanged with live client connections.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::contracts::routing_keys;

/// Frame pushed to a client: `{ "type": <routing key>, "data": <payload> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: JsonValue,
}

impl OutboundFrame {
    pub fn new(kind: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: JsonValue,
}

/// Message received from a driver connection.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverMessage {
    /// Position update. Accepted, not acted upon yet.
    Location(JsonValue),
    TripAccept(JsonValue),
    TripDecline(JsonValue),
    /// Anything else; logged and ignored.
    Unknown(String),
}

impl DriverMessage {
    /// Decode a text frame. Fails only when the frame is not a
    /// `{ "type", "data" }` object.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawInbound = serde_json::from_str(text)?;
        Ok(match raw.kind.as_str() {
            routing_keys::DRIVER_CMD_LOCATION => Self::Location(raw.data),
            routing_keys::DRIVER_CMD_TRIP_ACCEPT => Self::TripAccept(raw.data),
            routing_keys::DRIVER_CMD_TRIP_DECLINE => Self::TripDecline(raw.data),
            _ => Self::Unknown(raw.kind),
        })
    }

    /// Routing key and payload to re-publish on the bus, for messages that
    /// are forwarded (trip accept / decline).
    pub fn into_forward(self) -> Option<(&'static str, JsonValue)> {
        match self {
            Self::TripAccept(data) => Some((routing_keys::DRIVER_CMD_TRIP_ACCEPT, data)),
            Self::TripDecline(data) => Some((routing_keys::DRIVER_CMD_TRIP_DECLINE, data)),
            Self::Location(_) | Self::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accept_and_decline_are_forwarded() {
        let accept = DriverMessage::parse(
            r#"{"type":"driver.cmd.trip_accept","data":{"tripID":"t1"}}"#,
        )
        .unwrap();
        assert_eq!(accept, DriverMessage::TripAccept(json!({ "tripID": "t1" })));
        assert_eq!(
            accept.into_forward(),
            Some((routing_keys::DRIVER_CMD_TRIP_ACCEPT, json!({ "tripID": "t1" })))
        );

        let decline = DriverMessage::parse(r#"{"type":"driver.cmd.trip_decline"}"#).unwrap();
        assert_eq!(
            decline.into_forward(),
            Some((routing_keys::DRIVER_CMD_TRIP_DECLINE, JsonValue::Null))
        );
    }

    #[test]
    fn location_is_recognised_but_not_forwarded() {
        let msg = DriverMessage::parse(r#"{"type":"driver.cmd.location","data":{}}"#).unwrap();
        assert!(matches!(msg, DriverMessage::Location(_)));
        assert_eq!(msg.into_forward(), None);
    }

    #[test]
    fn unknown_type_is_kept_as_unknown() {
        let msg = DriverMessage::parse(r#"{"type":"driver.cmd.dance"}"#).unwrap();
        assert_eq!(msg, DriverMessage::Unknown("driver.cmd.dance".into()));
    }

    #[test]
    fn non_object_frame_is_an_error() {
        assert!(DriverMessage::parse("hello").is_err());
        assert!(DriverMessage::parse(r#"{"data":1}"#).is_err());
    }

    #[test]
    fn outbound_frame_uses_type_field() {
        let frame = OutboundFrame::new("driver.cmd.register", json!({ "id": "d1" }));
        let v: JsonValue = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "driver.cmd.register");
        assert_eq!(v["data"]["id"], "d1");
    }
}
