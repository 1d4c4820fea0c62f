//! Hook payloads for traffic and connection events.
//!
//! Traffic payloads carry both peers of the exchange and the bytes in flight:
//!
//! ```json
//! {
//!   "client": {"local": "...", "remote": "..."},
//!   "server": {"local": "...", "remote": "..."},
//!   "request": "<base64>",
//!   "error": ""
//! }
//! ```
//!
//! Egress payloads use `response` instead of `request`.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use relayd_hooks::Payload;
use serde_json::{json, Value};
use tracing::warn;

use super::client::Client;
use super::inbound::Inbound;

/// Local and remote address of one side of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrs {
    pub local: String,
    pub remote: String,
}

impl PeerAddrs {
    fn to_value(&self) -> Value {
        json!({"local": self.local, "remote": self.remote})
    }
}

/// Which payload field carries the traffic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficField {
    Request,
    Response,
}

impl TrafficField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficField::Request => "request",
            TrafficField::Response => "response",
        }
    }
}

impl fmt::Display for TrafficField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One direction of an exchange, as handed to a traffic hook.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub client: PeerAddrs,
    pub server: PeerAddrs,
    pub field: TrafficField,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl TrafficEvent {
    pub fn new(
        inbound: &dyn Inbound,
        client: &Client,
        field: TrafficField,
        data: Vec<u8>,
        error: Option<String>,
    ) -> Self {
        Self {
            client: PeerAddrs {
                local: inbound.local_addr(),
                remote: inbound.remote_addr(),
            },
            server: PeerAddrs {
                local: client.local_addr().to_string(),
                remote: client.remote_addr().to_string(),
            },
            field,
            data,
            error,
        }
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("client".to_string(), self.client.to_value());
        payload.insert("server".to_string(), self.server.to_value());
        payload.insert(
            self.field.as_str().to_string(),
            Value::String(STANDARD.encode(&self.data)),
        );
        payload.insert(
            "error".to_string(),
            Value::String(self.error.clone().unwrap_or_default()),
        );
        payload
    }
}

/// What a traffic hook handed back.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HookOutcome {
    /// Decoded replacement bytes, if the hook returned the field.
    pub data: Option<Vec<u8>>,
    /// Non-empty `error` reported by the hook.
    pub error: Option<String>,
}

/// Pull the traffic field and error string out of a hook result.
pub fn extract_field(result: Option<&Payload>, field: TrafficField) -> HookOutcome {
    let Some(result) = result else {
        return HookOutcome::default();
    };

    let data = match result.get(field.as_str()) {
        Some(Value::String(encoded)) => match STANDARD.decode(encoded) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(field = %field, error = %e, "Hook returned invalid base64, keeping original data");
                None
            }
        },
        Some(_) => {
            warn!(field = %field, "Hook returned a non-string field, keeping original data");
            None
        }
        None => None,
    };

    let error = result
        .get("error")
        .and_then(Value::as_str)
        .filter(|e| !e.is_empty())
        .map(str::to_owned);

    HookOutcome { data, error }
}

/// Payload for connection lifecycle hooks (`onOpened`, `onClosed`).
pub fn connection_payload(inbound: &dyn Inbound) -> Payload {
    let mut payload = Payload::new();
    payload.insert(
        "client".to_string(),
        PeerAddrs {
            local: inbound.local_addr(),
            remote: inbound.remote_addr(),
        }
        .to_value(),
    );
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(field: TrafficField, data: &[u8], error: Option<&str>) -> TrafficEvent {
        TrafficEvent {
            client: PeerAddrs {
                local: "127.0.0.1:15432".to_string(),
                remote: "127.0.0.1:50000".to_string(),
            },
            server: PeerAddrs {
                local: "127.0.0.1:50001".to_string(),
                remote: "127.0.0.1:5432".to_string(),
            },
            field,
            data: data.to_vec(),
            error: error.map(str::to_owned),
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = event(TrafficField::Request, b"ping", None).to_payload();

        assert_eq!(payload["request"], json!("cGluZw=="));
        assert_eq!(payload["error"], json!(""));
        assert_eq!(payload["client"]["remote"], json!("127.0.0.1:50000"));
        assert_eq!(payload["server"]["remote"], json!("127.0.0.1:5432"));
        assert!(!payload.contains_key("response"));
    }

    #[test]
    fn test_payload_carries_error() {
        let payload = event(TrafficField::Response, b"", Some("EOF")).to_payload();
        assert_eq!(payload["response"], json!(""));
        assert_eq!(payload["error"], json!("EOF"));
    }

    #[test]
    fn test_extract_field() {
        let mut result = event(TrafficField::Response, b"pong", None).to_payload();
        assert_eq!(
            extract_field(Some(&result), TrafficField::Response),
            HookOutcome {
                data: Some(b"pong".to_vec()),
                error: None
            }
        );

        result.insert("error".to_string(), json!("rewritten"));
        result.insert("response".to_string(), json!("not base64!"));
        assert_eq!(
            extract_field(Some(&result), TrafficField::Response),
            HookOutcome {
                data: None,
                error: Some("rewritten".to_string())
            }
        );

        assert_eq!(extract_field(Some(&result), TrafficField::Request).data, None);
        assert_eq!(extract_field(None, TrafficField::Request), HookOutcome::default());
    }
}
