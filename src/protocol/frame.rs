use crate::utils::error::{PhxLoadError, Result};
use serde_json::{Map, Value};
use std::fmt;

/// Channel-join event name
pub const EVENT_JOIN: &str = "phx_join";
/// Reply event name (echoes the request's ref)
pub const EVENT_REPLY: &str = "phx_reply";
/// Keepalive event name
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// Filtered-subscription event name
pub const EVENT_SUBSCRIBE: &str = "subscribe";

/// Fixed join transaction ref used by every client
pub const JOIN_REF: &str = "1";
/// Message ref of the join request
pub const JOIN_MSG_REF: &str = "1";
/// Message ref of the subscribe request
pub const SUBSCRIBE_MSG_REF: &str = "2";
/// Message ref of heartbeat frames (never echoed back meaningfully)
pub const HEARTBEAT_MSG_REF: &str = "hb";
/// Topic heartbeats are addressed to
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// One wire message: `[join_ref | null, ref, topic, event, payload]`.
///
/// Immutable once constructed. `payload` is always a map; an absent payload
/// encodes as `{}`, never `null`, so receivers may index into it blindly.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: String,
    pub topic: String,
    pub event: String,
    pub payload: Map<String, Value>,
}

impl Frame {
    pub fn new(
        join_ref: Option<&str>,
        msg_ref: &str,
        topic: &str,
        event: &str,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            join_ref: join_ref.map(str::to_string),
            msg_ref: msg_ref.to_string(),
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    /// Join request for `topic`, carrying the client's userid.
    pub fn join(topic: &str, userid: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("userid".to_string(), Value::String(userid.to_string()));
        Self::new(Some(JOIN_REF), JOIN_MSG_REF, topic, EVENT_JOIN, payload)
    }

    /// Keepalive frame, outside any join transaction.
    pub fn heartbeat() -> Self {
        Self::new(
            None,
            HEARTBEAT_MSG_REF,
            HEARTBEAT_TOPIC,
            EVENT_HEARTBEAT,
            Map::new(),
        )
    }

    /// Serialize to the JSON array wire rendering.
    ///
    /// An absent `join_ref` becomes an explicit `null`.
    pub fn encode(&self) -> String {
        let arr = Value::Array(vec![
            match &self.join_ref {
                Some(r) => Value::String(r.clone()),
                None => Value::Null,
            },
            Value::String(self.msg_ref.clone()),
            Value::String(self.topic.clone()),
            Value::String(self.event.clone()),
            Value::Object(self.payload.clone()),
        ]);
        arr.to_string()
    }

    /// Parse a wire message.
    ///
    /// Fails with `Decode` when the text is not a 5-element array of the
    /// expected shape. Callers must treat decode failure as "drop this
    /// message", never as fatal.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PhxLoadError::Decode(format!("invalid JSON: {}", e)))?;

        let arr = match value {
            Value::Array(arr) => arr,
            other => {
                return Err(PhxLoadError::Decode(format!(
                    "expected array frame, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let [join_ref_v, ref_v, topic_v, event_v, payload_v]: [Value; 5] =
            arr.try_into().map_err(|arr: Vec<Value>| {
                PhxLoadError::Decode(format!(
                    "expected 5-element frame, got {} elements",
                    arr.len()
                ))
            })?;

        let join_ref = match join_ref_v {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => {
                return Err(PhxLoadError::Decode(format!(
                    "join_ref must be string or null, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let msg_ref = decode_string(ref_v, "ref")?;
        let topic = decode_string(topic_v, "topic")?;
        let event = decode_string(event_v, "event")?;

        let payload = match payload_v {
            Value::Object(map) => map,
            // Servers occasionally send null for an empty payload
            Value::Null => Map::new(),
            other => {
                return Err(PhxLoadError::Decode(format!(
                    "payload must be a map, got {}",
                    json_type_name(&other)
                )))
            }
        };

        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

fn decode_string(value: Value, field: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(PhxLoadError::Decode(format!(
            "{} must be a string, got {}",
            field,
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.join_ref.as_deref().unwrap_or("null"),
            self.msg_ref,
            self.topic,
            self.event
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_join_frame() {
        let frame = Frame::join("user:100001", "100001");
        let encoded = frame.encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!(["1", "1", "user:100001", "phx_join", { "userid": "100001" }])
        );
    }

    #[test]
    fn test_encode_heartbeat_has_null_join_ref() {
        let encoded = Frame::heartbeat().encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!([null, "hb", "phoenix", "heartbeat", {}]));
    }

    #[test]
    fn test_round_trip() {
        let mut payload = Map::new();
        payload.insert("status".to_string(), Value::String("ok".to_string()));
        let original = Frame::new(Some("1"), "2", "user:100001", "phx_reply", payload);

        let decoded = Frame::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_null_join_ref_and_empty_payload() {
        let original = Frame::new(None, "hb", "phoenix", "heartbeat", Map::new());
        let decoded = Frame::decode(&original.encode()).unwrap();
        assert_eq!(decoded.join_ref, None);
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_null_payload_becomes_empty_map() {
        let decoded = Frame::decode(r#"[null, "hb", "phoenix", "heartbeat", null]"#).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_array() {
        assert!(Frame::decode(r#"{"event": "phx_reply"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        assert!(Frame::decode(r#"["1", "1", "topic", "phx_join"]"#).is_err());
        assert!(Frame::decode(r#"["1", "1", "topic", "phx_join", {}, {}]"#).is_err());
    }

    #[test]
    fn test_decode_rejects_non_string_ref() {
        assert!(Frame::decode(r#"[null, 7, "topic", "phx_reply", {}]"#).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(Frame::decode("not json at all").is_err());
    }
}
