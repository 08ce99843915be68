//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! Every WebSocket text frame carries one Engine.IO packet:
//! ```text
//! [ 1 char: engine type ][ payload ]
//! ```
//! Engine.IO `message` packets (type `4`) carry one Socket.IO packet:
//! ```text
//! [ 1 char: socket type ][ attachments "-" ][ "/" nsp "," ][ ack id ][ JSON ]
//! ```
//! Only the namespace and ack id parts that differ from the defaults are written.

use serde_json::{json, Value};
use thiserror::Error;

use crate::{defaults, OpenHandshake};

/// Maximum packet size accepted by the decoder
pub const MAX_PACKET_SIZE: usize = defaults::MAX_PAYLOAD_BYTES as usize;

/// The default Socket.IO namespace
pub const ROOT_NAMESPACE: &str = "/";

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Empty packet")]
    Empty,

    #[error("Packet too large: {0} bytes (max: {MAX_PACKET_SIZE})")]
    PacketTooLarge(usize),

    #[error("Unknown Engine.IO packet type: {0:?}")]
    UnknownEngineType(char),

    #[error("Unknown Socket.IO packet type: {0:?}")]
    UnknownSocketType(char),

    #[error("Binary packets are not supported")]
    BinaryUnsupported,

    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO transport-level packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    /// Encode into a WebSocket text frame
    pub fn encode(&self) -> Result<String, CodecError> {
        let frame = match self {
            EnginePacket::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(probe) => format!("2{}", probe.as_deref().unwrap_or_default()),
            EnginePacket::Pong(probe) => format!("3{}", probe.as_deref().unwrap_or_default()),
            EnginePacket::Message(payload) => format!("4{}", payload),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        };
        Ok(frame)
    }

    /// Decode a WebSocket text frame
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        if frame.len() > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge(frame.len()));
        }

        let mut chars = frame.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let body = chars.as_str();
        let probe = (!body.is_empty()).then(|| body.to_string());

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(probe)),
            '3' => Ok(EnginePacket::Pong(probe)),
            '4' => Ok(EnginePacket::Message(body.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(CodecError::UnknownEngineType(other)),
        }
    }
}

/// Socket.IO packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketType {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl SocketPacketType {
    fn as_char(self) -> char {
        match self {
            SocketPacketType::Connect => '0',
            SocketPacketType::Disconnect => '1',
            SocketPacketType::Event => '2',
            SocketPacketType::Ack => '3',
            SocketPacketType::ConnectError => '4',
            SocketPacketType::BinaryEvent => '5',
            SocketPacketType::BinaryAck => '6',
        }
    }

    fn from_char(c: char) -> Result<Self, CodecError> {
        match c {
            '0' => Ok(SocketPacketType::Connect),
            '1' => Ok(SocketPacketType::Disconnect),
            '2' => Ok(SocketPacketType::Event),
            '3' => Ok(SocketPacketType::Ack),
            '4' => Ok(SocketPacketType::ConnectError),
            '5' => Ok(SocketPacketType::BinaryEvent),
            '6' => Ok(SocketPacketType::BinaryAck),
            other => Err(CodecError::UnknownSocketType(other)),
        }
    }
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: SocketPacketType,
    pub namespace: String,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    /// Namespace CONNECT request (client) or acknowledgement (server)
    pub fn connect(namespace: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: SocketPacketType::Connect,
            namespace: namespace.into(),
            ack_id: None,
            data,
        }
    }

    /// Namespace DISCONNECT
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self {
            kind: SocketPacketType::Disconnect,
            namespace: namespace.into(),
            ack_id: None,
            data: None,
        }
    }

    /// CONNECT_ERROR with a message
    pub fn connect_error(namespace: impl Into<String>, message: &str) -> Self {
        Self {
            kind: SocketPacketType::ConnectError,
            namespace: namespace.into(),
            ack_id: None,
            data: Some(json!({ "message": message })),
        }
    }

    /// EVENT `[name, data]`
    pub fn event(namespace: impl Into<String>, name: &str, data: Value) -> Self {
        Self {
            kind: SocketPacketType::Event,
            namespace: namespace.into(),
            ack_id: None,
            data: Some(json!([name, data])),
        }
    }

    /// Event name and first argument, for EVENT packets
    pub fn event_parts(&self) -> Option<(&str, Option<&Value>)> {
        if self.kind != SocketPacketType::Event {
            return None;
        }
        let args = self.data.as_ref()?.as_array()?;
        let name = args.first()?.as_str()?;
        Some((name, args.get(1)))
    }

    /// Encode into the body of an Engine.IO message
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.as_char());

        if self.namespace != ROOT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }

        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }

        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }

        out
    }

    /// Encode and wrap in an Engine.IO message frame
    pub fn to_frame(&self) -> String {
        format!("4{}", self.encode())
    }

    /// Decode the body of an Engine.IO message
    pub fn decode(body: &str) -> Result<Self, CodecError> {
        let mut chars = body.chars();
        let kind = SocketPacketType::from_char(chars.next().ok_or(CodecError::Empty)?)?;

        if matches!(
            kind,
            SocketPacketType::BinaryEvent | SocketPacketType::BinaryAck
        ) {
            return Err(CodecError::BinaryUnsupported);
        }

        let mut rest = chars.as_str();

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(i) => {
                    let nsp = &rest[..i];
                    rest = &rest[i + 1..];
                    nsp.to_string()
                }
                None => {
                    let nsp = rest.to_string();
                    rest = "";
                    nsp
                }
            }
        } else {
            ROOT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let raw = &rest[..digits];
            Some(
                raw.parse::<u64>()
                    .map_err(|_| CodecError::InvalidAckId(raw.to_string()))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            namespace,
            ack_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_packet_decode() {
        let frame = r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match EnginePacket::decode(frame).expect("decode failed") {
            EnginePacket::Open(hs) => {
                assert_eq!(hs.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(hs.ping_interval, 25000);
            }
            other => panic!("expected open packet, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_frames() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(None));
        assert_eq!(
            EnginePacket::decode("2probe").unwrap(),
            EnginePacket::Ping(Some("probe".into()))
        );
        assert_eq!(EnginePacket::Pong(None).encode().unwrap(), "3");
    }

    #[test]
    fn test_unknown_engine_type() {
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(CodecError::UnknownEngineType('9'))
        ));
        assert!(matches!(EnginePacket::decode(""), Err(CodecError::Empty)));
    }

    #[test]
    fn test_namespace_connect_encoding() {
        let packet = SocketPacket::connect("/acme.local", None);
        assert_eq!(packet.to_frame(), "40/acme.local,");

        let root = SocketPacket::connect(ROOT_NAMESPACE, None);
        assert_eq!(root.to_frame(), "40");
    }

    #[test]
    fn test_event_encoding() {
        let packet = SocketPacket::event("/acme.local", "heartbeat", json!({ "timestamp": 42 }));
        assert_eq!(
            packet.encode(),
            r#"2/acme.local,["heartbeat",{"timestamp":42}]"#
        );
    }

    #[test]
    fn test_event_decode_with_namespace() {
        let packet =
            SocketPacket::decode(r#"2/newcrm.localhost,["refetch_resource",{"cache_key":"deal-statuses"}]"#)
                .expect("decode failed");

        assert_eq!(packet.kind, SocketPacketType::Event);
        assert_eq!(packet.namespace, "/newcrm.localhost");
        assert_eq!(packet.ack_id, None);

        let (name, data) = packet.event_parts().expect("event parts");
        assert_eq!(name, "refetch_resource");
        assert_eq!(data, Some(&json!({ "cache_key": "deal-statuses" })));
    }

    #[test]
    fn test_event_decode_with_ack_id() {
        let packet = SocketPacket::decode(r#"213["list_update",{"doctype":"CRM Lead"}]"#)
            .expect("decode failed");
        assert_eq!(packet.namespace, ROOT_NAMESPACE);
        assert_eq!(packet.ack_id, Some(13));
        assert_eq!(packet.event_parts().unwrap().0, "list_update");
    }

    #[test]
    fn test_connect_ack_and_error() {
        let ack = SocketPacket::decode(r#"0/acme.local,{"sid":"wZX3oN0bSVIhsaknAAAI"}"#).unwrap();
        assert_eq!(ack.kind, SocketPacketType::Connect);
        assert_eq!(ack.data.unwrap()["sid"], "wZX3oN0bSVIhsaknAAAI");

        let err = SocketPacket::decode(r#"4/acme.local,{"message":"Invalid origin"}"#).unwrap();
        assert_eq!(err.kind, SocketPacketType::ConnectError);
        assert_eq!(err.event_parts(), None);
    }

    #[test]
    fn test_disconnect_without_trailing_comma() {
        let packet = SocketPacket::decode("1/acme.local").unwrap();
        assert_eq!(packet.kind, SocketPacketType::Disconnect);
        assert_eq!(packet.namespace, "/acme.local");
        assert!(packet.data.is_none());
    }

    #[test]
    fn test_binary_packets_rejected() {
        assert!(matches!(
            SocketPacket::decode(r#"51-["upload",{"_placeholder":true,"num":0}]"#),
            Err(CodecError::BinaryUnsupported)
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            SocketPacket::decode(r#"2["refetch_resource","#),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let frame = format!("4{}", "x".repeat(MAX_PACKET_SIZE + 1));
        assert!(matches!(
            EnginePacket::decode(&frame),
            Err(CodecError::PacketTooLarge(_))
        ));
    }
}
