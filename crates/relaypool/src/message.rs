//! Relay protocol frames.
//!
//! - Client to Relay: EVENT, REQ, CLOSE, AUTH
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH

use serde_json::Value;
use thiserror::Error;

use crate::event::Event;
use crate::filter::Filter;

/// Errors that can occur when parsing relay frames.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },

    /// Authentication (NIP-42): ["AUTH", <event JSON>]
    Auth(Event),
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },
}

fn string_at(arr: &[Value], index: usize, name: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(name.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", name)))
}

impl RelayMessage {
    /// Parse a JSON frame from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        let msg_type = arr
            .first()
            .ok_or_else(|| MessageError::InvalidFormat("empty array".to_string()))?
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("success".to_string()))?
                    .as_bool()
                    .ok_or_else(|| {
                        MessageError::InvalidFormat("success not a boolean".to_string())
                    })?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let message = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_event() {
        let event = Event {
            id: "abc123".to_string(),
            pubkey: "pubkey123".to_string(),
            created_at: 1234567890,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
            sig: "sig123".to_string(),
        };

        let json = ClientMessage::Event(event).to_json().unwrap();
        assert!(json.starts_with(r#"["EVENT",{"#));
        assert!(json.contains("abc123"));
    }

    #[test]
    fn test_client_message_req_skips_pool_fields() {
        let filter = Filter::new()
            .kinds(vec![1])
            .limit(10)
            .relay("wss://pinned.example.com");

        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![filter],
        };

        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["REQ","sub1",{"kinds":[1],"limit":10}]"#);
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };

        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_relay_message_event() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
                assert_eq!(event.content, "Hello");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_ok_without_reason() {
        let msg = RelayMessage::from_json(r#"["OK","event123",true]"#).unwrap();

        match msg {
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                assert_eq!(event_id, "event123");
                assert!(success);
                assert_eq!(message, "");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_ok_failure() {
        let json = r#"["OK","event123",false,"duplicate: already have this event"]"#;

        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Ok {
                success, message, ..
            } => {
                assert!(!success);
                assert!(message.contains("duplicate"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_eose() {
        match RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap() {
            RelayMessage::Eose { subscription_id } => assert_eq!(subscription_id, "sub1"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_closed() {
        let json = r#"["CLOSED","sub1","error: too many subscriptions"]"#;

        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert!(message.contains("too many subscriptions"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_notice_and_auth() {
        match RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap() {
            RelayMessage::Notice { message } => assert_eq!(message, "rate limited"),
            _ => panic!("wrong message type"),
        }
        match RelayMessage::from_json(r#"["AUTH","challenge123"]"#).unwrap() {
            RelayMessage::Auth { challenge } => assert_eq!(challenge, "challenge123"),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(RelayMessage::from_json("not json").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json(r#"["EOSE"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","sub1",{"id":1}]"#).is_err());
        assert!(matches!(
            RelayMessage::from_json(r#"["WHAT","x"]"#),
            Err(MessageError::UnknownType(_))
        ));
    }
}
