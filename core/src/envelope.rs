//! Wire envelope type and JSON line codec.
//!
//! One envelope is exchanged per delivery unit: a newline-terminated line
//! on the Unix socket, or a single message on the WebSocket. The in-memory
//! field for the originator is `sender`; on the wire it is renamed `from`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MSG_AGENT_REGISTER: &str = "agent.register";
pub const MSG_AGENT_READY: &str = "agent.ready";
pub const MSG_AGENT_DISCONNECT: &str = "agent.disconnect";
pub const MSG_AGENT_LIST: &str = "agent.list";
pub const MSG_AGENT_CATALOG: &str = "agent.catalog";
pub const MSG_COMMAND: &str = "command";
pub const MSG_RESPONSE: &str = "response";
pub const MSG_RESPONSE_CHUNK: &str = "response.chunk";
pub const MSG_RESPONSE_END: &str = "response.end";
pub const MSG_SERVICE_REQUEST: &str = "service.request";
pub const MSG_SERVICE_RESPONSE: &str = "service.response";
pub const MSG_SERVICE_ERROR: &str = "service.error";
pub const MSG_AGENT_MESSAGE: &str = "agent.message";
pub const MSG_AGENT_BROADCAST: &str = "agent.broadcast";
pub const MSG_ERROR: &str = "error";

/// Required keys on the wire form of an envelope.
const REQUIRED_WIRE_KEYS: [&str; 5] = ["type", "id", "from", "to", "payload"];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("top-level value is not an object")]
    NotAnObject,
    #[error("missing required keys: {0}")]
    MissingKeys(String),
}

/// A single message exchanged between the core and a connected party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub r#type: String,
    pub id: String,
    pub sender: String,
    pub to: String,
    pub payload: BTreeMap<String, Value>,
    pub reply_to: Option<String>,
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Build a new envelope with a freshly generated id.
    pub fn create(
        r#type: impl Into<String>,
        sender: impl Into<String>,
        to: impl Into<String>,
        payload: BTreeMap<String, Value>,
    ) -> Self {
        Envelope {
            r#type: r#type.into(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            sender: sender.into(),
            to: to.into(),
            payload,
            reply_to: None,
            timestamp: None,
        }
    }

    /// Build a reply to `original`, addressed back to its sender with
    /// `reply_to` set to `original.id`.
    pub fn reply(
        original: &Envelope,
        sender: impl Into<String>,
        r#type: impl Into<String>,
        payload: BTreeMap<String, Value>,
    ) -> Self {
        Envelope {
            r#type: r#type.into(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            sender: sender.into(),
            to: original.sender.clone(),
            payload,
            reply_to: Some(original.id.clone()),
            timestamp: None,
        }
    }

    /// Serialize as one compact JSON line, without the trailing newline.
    pub fn encode(&self) -> String {
        #[derive(Serialize)]
        struct Wire<'a> {
            r#type: &'a str,
            id: &'a str,
            from: &'a str,
            to: &'a str,
            payload: &'a BTreeMap<String, Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            reply_to: &'a Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            timestamp: &'a Option<String>,
        }
        let wire = Wire {
            r#type: &self.r#type,
            id: &self.id,
            from: &self.sender,
            to: &self.to,
            payload: &self.payload,
            reply_to: &self.reply_to,
            timestamp: &self.timestamp,
        };
        serde_json::to_string(&wire).expect("envelope fields are always serializable")
    }

    /// Decode one line of wire JSON into an envelope.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim())?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let missing: Vec<&str> = REQUIRED_WIRE_KEYS
            .iter()
            .filter(|k| !obj.contains_key(**k))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ProtocolError::MissingKeys(missing.join(", ")));
        }

        let r#type = obj["type"].as_str().unwrap_or_default().to_string();
        let id = obj["id"].as_str().unwrap_or_default().to_string();
        let sender = obj["from"].as_str().unwrap_or_default().to_string();
        let to = obj["to"].as_str().unwrap_or_default().to_string();
        let payload = obj["payload"]
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        let reply_to = obj.get("reply_to").and_then(|v| v.as_str()).map(String::from);
        let timestamp = obj.get("timestamp").and_then(|v| v.as_str()).map(String::from);

        Ok(Envelope {
            r#type,
            id,
            sender,
            to,
            payload,
            reply_to,
            timestamp,
        })
    }
}

/// Deserialize helper used when an envelope's payload is itself a typed
/// struct (service requests, register manifests, ...).
pub fn payload_as<T: for<'de> Deserialize<'de>>(
    payload: &BTreeMap<String, Value>,
) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(payload.clone().into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn round_trip_preserves_fields() {
        let env = Envelope::create(
            MSG_AGENT_REGISTER,
            "client-1",
            "broker",
            payload(&[("name", Value::String("mist".into()))]),
        );
        let line = env.encode();
        let decoded = Envelope::decode(&line).unwrap();
        assert_eq!(decoded.r#type, env.r#type);
        assert_eq!(decoded.sender, env.sender);
        assert_eq!(decoded.to, env.to);
        assert_eq!(decoded.payload, env.payload);
        assert_eq!(decoded.reply_to, None);
    }

    #[test]
    fn reply_to_absent_is_omitted_on_wire() {
        let env = Envelope::create(MSG_AGENT_LIST, "ui", "broker", BTreeMap::new());
        let line = env.encode();
        assert!(!line.contains("reply_to"));
    }

    #[test]
    fn reply_sets_reply_to_and_addresses_origin() {
        let original = Envelope::create(MSG_COMMAND, "ui", "echo-0", payload(&[]));
        let reply = Envelope::reply(&original, "echo-0", MSG_RESPONSE, payload(&[]));
        assert_eq!(reply.reply_to, Some(original.id.clone()));
        assert_eq!(reply.to, "ui");
    }

    #[test]
    fn decode_rejects_missing_keys() {
        let err = Envelope::decode(r#"{"type":"command"}"#).unwrap_err();
        match err {
            ProtocolError::MissingKeys(msg) => {
                assert!(msg.contains("id"));
                assert!(msg.contains("from"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_non_object_top_level() {
        let err = Envelope::decode("[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject));
    }

    #[test]
    fn decode_tolerates_unknown_keys() {
        let line = r#"{"type":"agent.list","id":"x","from":"a","to":"b","payload":{},"extra":1}"#;
        let env = Envelope::decode(line).unwrap();
        assert_eq!(env.r#type, "agent.list");
    }
}
