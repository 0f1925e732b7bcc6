//! Text framing for Socket.IO v5 over Engine.IO v4.
//!
//! Only the default namespace and the packet types a chat client needs are
//! understood. Binary attachments are not.

use std::time::Duration;

use events::{ClientEvent, EventType};
use serde_json::{json, Value};
use session_auth::error::{transport_error, Error, TransportErrorKind};

/// Engine.IO pong, the answer to a server ping.
pub const PONG: &str = "3";
/// Socket.IO disconnect from the default namespace.
pub const DISCONNECT: &str = "41";

// Engine.IO v4 server defaults
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Ping schedule announced by the server in its open packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
        }
    }
}

impl Heartbeat {
    /// Read `pingInterval` and `pingTimeout` (milliseconds) from an open
    /// packet, keeping the defaults for missing values.
    pub fn from_open(handshake: &Value) -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(handshake.get(key).and_then(Value::as_u64).unwrap_or(default))
        };
        Self {
            ping_interval: millis("pingInterval", DEFAULT_PING_INTERVAL_MS),
            ping_timeout: millis("pingTimeout", DEFAULT_PING_TIMEOUT_MS),
        }
    }

    /// How long the connection may stay silent before it is considered dead.
    pub fn silence_limit(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake carrying `sid`, `pingInterval` and `pingTimeout`.
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledgment, `{"sid": ...}`.
    Connect(Value),
    Disconnect,
    Event {
        name: String,
        payload: Value,
    },
    /// The server refused the namespace connect.
    ConnectError(Value),
    /// Acks and anything else this client does not act on.
    Other(String),
}

/// Decode one WebSocket text frame.
pub fn decode(frame: &str) -> Result<Packet, Error> {
    let mut chars = frame.chars();
    let engine_type = chars
        .next()
        .ok_or_else(|| protocol_error("Empty frame"))?;
    let rest = chars.as_str();

    match engine_type {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(rest),
        '6' => Ok(Packet::Noop),
        other => Err(protocol_error(&format!(
            "Unknown Engine.IO packet type '{other}'"
        ))),
    }
}

fn decode_socket(packet: &str) -> Result<Packet, Error> {
    let mut chars = packet.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| protocol_error("Empty Socket.IO packet"))?;
    let body = skip_ack_id(skip_namespace(chars.as_str()));

    match socket_type {
        '0' => Ok(Packet::Connect(parse_json_or_null(body)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(body),
        '4' => Ok(Packet::ConnectError(parse_json_or_null(body)?)),
        _ => Ok(Packet::Other(packet.to_string())),
    }
}

fn decode_event(body: &str) -> Result<Packet, Error> {
    let mut items = match parse_json(body)? {
        Value::Array(items) => items.into_iter(),
        _ => return Err(protocol_error("Event packet is not an array")),
    };
    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(protocol_error("Event packet has no name")),
    };
    let payload = items.next().unwrap_or(Value::Null);

    Ok(Packet::Event { name, payload })
}

// "/chat,..." addresses a namespace; the default namespace has no prefix
fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(comma) => &body[comma + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn skip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(text: &str) -> Result<Value, Error> {
    serde_json::from_str(text).map_err(|e| protocol_error(&format!("Invalid packet JSON: {e}")))
}

fn parse_json_or_null(text: &str) -> Result<Value, Error> {
    if text.is_empty() {
        Ok(Value::Null)
    } else {
        parse_json(text)
    }
}

fn protocol_error(message: &str) -> Error {
    transport_error(TransportErrorKind::Protocol, message)
}

/// Namespace connect carrying the access token as `auth.token`.
pub fn encode_connect(token: &str) -> String {
    format!("40{}", json!({ "token": token }))
}

pub fn encode_event(event: &ClientEvent) -> String {
    format!("42{}", json!([event.event_type(), event.payload()]))
}

/// Human-readable reason from a connect error payload.
pub fn connect_error_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "Connection refused by server".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_auth::ErrorKind;

    #[test]
    fn test_decode_engine_packets() {
        assert_eq!(decode("2").unwrap(), Packet::Ping);
        assert_eq!(decode("3").unwrap(), Packet::Pong);
        assert_eq!(decode("1").unwrap(), Packet::Close);

        match decode(r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":20000}"#).unwrap() {
            Packet::Open(handshake) => assert_eq!(handshake["pingInterval"], 25000),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_from_open_packet() {
        let heartbeat = Heartbeat::from_open(&json!({
            "sid": "abc",
            "pingInterval": 300,
            "pingTimeout": 200
        }));
        assert_eq!(heartbeat.ping_interval, Duration::from_millis(300));
        assert_eq!(heartbeat.silence_limit(), Duration::from_millis(500));

        let defaults = Heartbeat::from_open(&json!({ "sid": "abc" }));
        assert_eq!(defaults, Heartbeat::default());
        assert_eq!(defaults.silence_limit(), Duration::from_secs(45));
    }

    #[test]
    fn test_decode_connect_ack_and_error() {
        assert_eq!(
            decode(r#"40{"sid":"s1"}"#).unwrap(),
            Packet::Connect(json!({ "sid": "s1" }))
        );

        let refused = decode(r#"44{"message":"Authentication error"}"#).unwrap();
        match refused {
            Packet::ConnectError(payload) => {
                assert_eq!(connect_error_message(&payload), "Authentication error")
            }
            other => panic!("unexpected packet {other:?}"),
        }
        assert_eq!(decode("41").unwrap(), Packet::Disconnect);
    }

    #[test]
    fn test_decode_event_with_namespace_and_ack_id() {
        let expected = Packet::Event {
            name: "user:online".to_string(),
            payload: json!("u2"),
        };

        assert_eq!(decode(r#"42["user:online","u2"]"#).unwrap(), expected);
        assert_eq!(decode(r#"42/,7["user:online","u2"]"#).unwrap(), expected);
        assert_eq!(decode(r#"4213["user:online","u2"]"#).unwrap(), expected);
    }

    #[test]
    fn test_decode_event_without_payload() {
        assert_eq!(
            decode(r#"42["users:online"]"#).unwrap(),
            Packet::Event {
                name: "users:online".to_string(),
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        for frame in ["", "9", r#"42{"not":"an array"}"#, "42[1,2]", "42[oops"] {
            let err = decode(frame).unwrap_err();
            assert_eq!(
                err.kind(),
                ErrorKind::Transport(TransportErrorKind::Protocol),
                "frame {frame:?}"
            );
        }
    }

    #[test]
    fn test_encode_client_packets() {
        assert_eq!(encode_connect("a1"), r#"40{"token":"a1"}"#);

        let frame = encode_event(&ClientEvent::JoinConversation("c1".to_string()));
        assert!(frame.starts_with("42"));
        let decoded: Value = serde_json::from_str(&frame[2..]).unwrap();
        assert_eq!(decoded[0], "joinConversation");
    }
}
