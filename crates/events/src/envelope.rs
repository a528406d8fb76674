use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Unit of bus communication.
///
/// Wire format is `{ "ownerID": string, "data": <json> }`. `ownerID` names the
/// addressee (user or driver identity) of a directed delivery and is empty for
/// broadcast-style events. Envelopes are immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "ownerID", default)]
    owner_id: String,

    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    data: JsonValue,
}

impl Envelope {
    /// Envelope addressed to a single identity.
    pub fn directed(owner_id: impl Into<String>, data: JsonValue) -> Self {
        Self {
            owner_id: owner_id.into(),
            data,
        }
    }

    /// Envelope with no addressee.
    pub fn broadcast(data: JsonValue) -> Self {
        Self {
            owner_id: String::new(),
            data,
        }
    }

    /// The addressee, if this is a directed envelope.
    pub fn owner_id(&self) -> Option<&str> {
        if self.owner_id.is_empty() {
            None
        } else {
            Some(&self.owner_id)
        }
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An envelope as handed to a consumer, together with the routing key it was
/// published under.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    routing_key: String,
    envelope: Envelope,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            routing_key: routing_key.into(),
            envelope,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_owner_id_and_data() {
        let env = Envelope::directed("driver-1", json!({ "trip": { "id": "t1" } }));
        let wire: JsonValue = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(wire["ownerID"], "driver-1");
        assert_eq!(wire["data"]["trip"]["id"], "t1");
    }

    #[test]
    fn missing_owner_decodes_as_broadcast() {
        let env = Envelope::from_bytes(br#"{"data":{"x":1}}"#).unwrap();
        assert_eq!(env.owner_id(), None);
        assert_eq!(env.data()["x"], 1);
    }

    #[test]
    fn null_data_is_omitted() {
        let env = Envelope::directed("rider-1", JsonValue::Null);
        let text = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert_eq!(text, r#"{"ownerID":"rider-1"}"#);
    }
}
