use serde::{Deserialize, Serialize};

/// Control protocol version reported in the `connected` greeting.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Inbound WebSocket messages (from a client, or from this hub to a peer)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsInbound {
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
    Ping,
}

/// Outbound WebSocket JSON messages (to client)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsOutbound {
    Connected { version: String },
    Subscribed { session_id: String },
    /// Milliseconds since the Unix epoch.
    Pong { timestamp: u64 },
    Error { message: String },
}

impl WsOutbound {
    pub fn connected() -> Self {
        WsOutbound::Connected {
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WsOutbound::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("BUG: WsOutbound must serialize")
    }
}

impl WsInbound {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("BUG: WsInbound must serialize")
    }
}

// ── Binary buffer frame ────────────────────────────────────────────────────

/// First byte of every pushed buffer frame.
pub const BUFFER_FRAME_MAGIC: u8 = 0xBF;

/// Build a buffer frame.
/// Format: [0xBF][session_id_len:u32 LE][session_id utf-8][snapshot...]
pub fn build_buffer_frame(session_id: &str, snapshot: &[u8]) -> Vec<u8> {
    let id = session_id.as_bytes();
    let mut frame = Vec::with_capacity(5 + id.len() + snapshot.len());
    frame.push(BUFFER_FRAME_MAGIC);
    frame.extend_from_slice(&(id.len() as u32).to_le_bytes());
    frame.extend_from_slice(id);
    frame.extend_from_slice(snapshot);
    frame
}

/// Parse a buffer frame into (session_id, snapshot bytes).
/// Returns None if the magic is wrong, the id runs past the end, or the id is not UTF-8.
pub fn parse_buffer_frame(data: &[u8]) -> Option<(&str, &[u8])> {
    if data.len() < 5 || data[0] != BUFFER_FRAME_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let end = 5usize.checked_add(len)?;
    let id = data.get(5..end)?;
    let id = std::str::from_utf8(id).ok()?;
    Some((id, &data[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_inbound_wire_format() {
        let msg: WsInbound =
            serde_json::from_str(r#"{"type":"subscribe","sessionId":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            WsInbound::Subscribe {
                session_id: "abc".into()
            }
        );
        let msg: WsInbound =
            serde_json::from_str(r#"{"type":"unsubscribe","sessionId":"abc"}"#).unwrap();
        assert!(matches!(msg, WsInbound::Unsubscribe { .. }));
        let msg: WsInbound = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, WsInbound::Ping);

        assert_eq!(
            WsInbound::Subscribe {
                session_id: "s".into()
            }
            .to_json(),
            r#"{"type":"subscribe","sessionId":"s"}"#
        );
    }

    #[test]
    fn ws_inbound_rejects_unknown_types() {
        assert!(serde_json::from_str::<WsInbound>(r#"{"type":"resize"}"#).is_err());
        assert!(serde_json::from_str::<WsInbound>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<WsInbound>("not json").is_err());
    }

    #[test]
    fn ws_outbound_wire_format() {
        assert_eq!(
            WsOutbound::connected().to_json(),
            r#"{"type":"connected","version":"1.0"}"#
        );
        assert_eq!(
            WsOutbound::Subscribed {
                session_id: "s1".into()
            }
            .to_json(),
            r#"{"type":"subscribed","sessionId":"s1"}"#
        );
        assert_eq!(
            WsOutbound::Pong { timestamp: 42 }.to_json(),
            r#"{"type":"pong","timestamp":42}"#
        );
        assert_eq!(
            WsOutbound::error("nope").to_json(),
            r#"{"type":"error","message":"nope"}"#
        );
    }

    #[test]
    fn buffer_frame_layout() {
        let snapshot = vec![0xAA; 36];
        let frame = build_buffer_frame("s1", &snapshot);
        assert_eq!(frame.len(), 1 + 4 + 2 + snapshot.len());
        assert_eq!(&frame[..7], &[0xBF, 0x02, 0x00, 0x00, 0x00, b's', b'1']);
        assert_eq!(&frame[7..], &snapshot[..]);
    }

    #[test]
    fn buffer_frame_parse() {
        let frame = build_buffer_frame("séssion", b"payload");
        let (id, payload) = parse_buffer_frame(&frame).unwrap();
        assert_eq!(id, "séssion");
        assert_eq!(payload, b"payload");

        let frame = build_buffer_frame("", b"");
        assert_eq!(parse_buffer_frame(&frame), Some(("", &b""[..])));
    }

    #[test]
    fn buffer_frame_rejects_garbage() {
        assert!(parse_buffer_frame(&[]).is_none());
        assert!(parse_buffer_frame(&[0xBF, 1, 0, 0]).is_none());
        assert!(parse_buffer_frame(&[0xBE, 0, 0, 0, 0]).is_none());
        // Length runs past the end.
        assert!(parse_buffer_frame(&[0xBF, 9, 0, 0, 0, b'a']).is_none());
        assert!(parse_buffer_frame(&[0xBF, 0xFF, 0xFF, 0xFF, 0xFF]).is_none());
        // Invalid UTF-8 id.
        assert!(parse_buffer_frame(&[0xBF, 1, 0, 0, 0, 0xFF]).is_none());
    }
}
