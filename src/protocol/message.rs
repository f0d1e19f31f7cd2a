use super::frame::{Frame, EVENT_REPLY};
use crate::utils::error::{PhxLoadError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reply payload: `{"status": "ok" | "error", "response": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// An inbound frame, classified by message kind.
///
/// Anything that is neither a reply nor the subscribed domain event is
/// `Other` and carries no information the state machine acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A `phx_reply` echoing the ref of an earlier request.
    Reply { msg_ref: String, ok: bool },
    /// A broadcast of the subscribed domain event. `sent_at` is the
    /// publisher-side epoch-ms timestamp, when the payload carries one.
    Broadcast { sent_at: Option<i64> },
    Other,
}

impl Inbound {
    /// Classify a decoded frame against the domain event this client
    /// subscribed to. A reply whose payload lacks a string `status` is a
    /// protocol violation and rejected here rather than threaded through
    /// untyped.
    pub fn classify(frame: &Frame, domain_event: &str) -> Result<Inbound> {
        if frame.event == EVENT_REPLY {
            let payload: ReplyPayload =
                serde_json::from_value(Value::Object(frame.payload.clone())).map_err(|e| {
                    PhxLoadError::Protocol(format!("reply payload missing status: {}", e))
                })?;
            return Ok(Inbound::Reply {
                msg_ref: frame.msg_ref.clone(),
                ok: payload.is_ok(),
            });
        }

        if frame.event == domain_event {
            let sent_at = frame.payload.get("sent_at").and_then(Value::as_i64);
            return Ok(Inbound::Broadcast { sent_at });
        }

        Ok(Inbound::Other)
    }
}

/// Comparison operator of a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equality {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Equality {
    /// Wire name carried in the subscribe payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Equality::Eq => "eq",
            Equality::Neq => "neq",
            Equality::Gt => "gt",
            Equality::Gte => "gte",
            Equality::Lt => "lt",
            Equality::Lte => "lte",
        }
    }

    /// SQL rendering used inside the generated query string.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Equality::Eq => "=",
            Equality::Neq => "!=",
            Equality::Gt => ">",
            Equality::Gte => ">=",
            Equality::Lt => "<",
            Equality::Lte => "<=",
        }
    }
}

/// Payload of the filtered-subscription request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribePayload {
    pub userid: String,
    pub table_field: String,
    pub field_value: String,
    pub equality: String,
    pub query: String,
    pub event: String,
    pub pk: String,
    pub alias: Option<String>,
}

impl SubscribePayload {
    /// Build the payload, generating a query string consistent with the
    /// filter parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        userid: &str,
        table: &str,
        table_field: &str,
        field_value: &str,
        equality: Equality,
        order_by: &str,
        limit: u32,
        domain_event: &str,
        pk: &str,
    ) -> Self {
        let query = format!(
            "select * from {} where ({} {} {}) order by {} limit {}",
            table,
            table_field,
            equality.as_sql(),
            field_value,
            order_by,
            limit
        );

        Self {
            userid: userid.to_string(),
            table_field: table_field.to_string(),
            field_value: field_value.to_string(),
            equality: equality.as_str().to_string(),
            query,
            event: domain_event.to_string(),
            pk: pk.to_string(),
            alias: None,
        }
    }

    /// Render into the frame payload map.
    pub fn into_map(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // Serialize of a plain struct cannot fail or yield a non-object
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::SUBSCRIBE_MSG_REF;
    use serde_json::json;

    fn reply_frame(msg_ref: &str, status: &str) -> Frame {
        let mut payload = Map::new();
        payload.insert("status".to_string(), Value::String(status.to_string()));
        Frame::new(Some("1"), msg_ref, "user:100001", "phx_reply", payload)
    }

    #[test]
    fn test_classify_ok_reply() {
        let inbound = Inbound::classify(&reply_frame("1", "ok"), "posts").unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply {
                msg_ref: "1".to_string(),
                ok: true
            }
        );
    }

    #[test]
    fn test_classify_error_reply() {
        let inbound = Inbound::classify(&reply_frame(SUBSCRIBE_MSG_REF, "error"), "posts").unwrap();
        assert_eq!(
            inbound,
            Inbound::Reply {
                msg_ref: "2".to_string(),
                ok: false
            }
        );
    }

    #[test]
    fn test_classify_reply_without_status_is_protocol_error() {
        let frame = Frame::new(Some("1"), "2", "user:100001", "phx_reply", Map::new());
        let err = Inbound::classify(&frame, "posts").unwrap_err();
        assert!(matches!(err, PhxLoadError::Protocol(_)));
    }

    #[test]
    fn test_classify_broadcast_with_sent_at() {
        let mut payload = Map::new();
        payload.insert("sent_at".to_string(), json!(1_700_000_000_000i64));
        let frame = Frame::new(None, "0", "user:100001", "posts", payload);

        let inbound = Inbound::classify(&frame, "posts").unwrap();
        assert_eq!(
            inbound,
            Inbound::Broadcast {
                sent_at: Some(1_700_000_000_000)
            }
        );
    }

    #[test]
    fn test_classify_unrelated_event_is_other() {
        let frame = Frame::new(None, "0", "user:100001", "presence_diff", Map::new());
        assert_eq!(Inbound::classify(&frame, "posts").unwrap(), Inbound::Other);
    }

    #[test]
    fn test_subscribe_payload_query_matches_filter() {
        let payload = SubscribePayload::new(
            "100001",
            "posts",
            "userid",
            "57",
            Equality::Eq,
            "updated_at desc",
            5,
            "posts",
            "id",
        );
        assert_eq!(
            payload.query,
            "select * from posts where (userid = 57) order by updated_at desc limit 5"
        );
        assert_eq!(payload.equality, "eq");

        let map = payload.into_map();
        assert_eq!(map.get("userid"), Some(&json!("100001")));
        assert_eq!(map.get("pk"), Some(&json!("id")));
        assert_eq!(map.get("alias"), Some(&Value::Null));
    }
}
