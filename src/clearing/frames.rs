//! Wire shapes for the clearing-network websocket protocol (§6, §4.C).
//!
//! Outbound requests are signed with the ephemeral key and framed as
//! `{"req": [id, method, payload, ts, signature]}`. Inbound frames come in two
//! shapes: `{"res": [id, method, payload]}` for responses and unsolicited
//! state updates, and `{"error": {...}}` for protocol-level errors. A response
//! can *also* carry an error shape nested at `res[2]` — both are normalized
//! into [`InboundFrame::Error`] by [`InboundFrame::parse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RequestId = u64;

/// A signed outbound call. `ts` is milliseconds since epoch; `signature` is
/// the ephemeral key's signature over the canonical JSON of `[id, method, payload, ts]`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub req: (RequestId, String, Value, u64, String),
}

impl OutboundFrame {
    pub fn new(id: RequestId, method: impl Into<String>, payload: Value, ts: u64, signature: String) -> Self {
        Self {
            req: (id, method.into(), payload, ts, signature),
        }
    }

    /// The payload actually signed: `[id, method, payload, ts]` as compact JSON.
    pub fn signing_payload(id: RequestId, method: &str, payload: &Value, ts: u64) -> Vec<u8> {
        serde_json::to_vec(&(id, method, payload, ts)).expect("json arrays never fail to serialize")
    }
}

/// A parsed inbound frame, normalized across the two wire shapes the clearing
/// network uses (§4.C: "the client must treat both error shapes uniformly").
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// `{res: [id, method, payload]}` with a non-error method.
    Response {
        id: RequestId,
        method: String,
        payload: Value,
    },
    /// Either `{error: {message}}` or `{res: [id, "error", {error|message}]}`.
    Error {
        id: Option<RequestId>,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    res: Option<(RequestId, String, Value)>,
    #[serde(default)]
    error: Option<Value>,
}

impl InboundFrame {
    /// Parses a raw text frame into a normalized [`InboundFrame`].
    ///
    /// Unknown methods inside a `res` frame are still returned as
    /// [`InboundFrame::Response`] — per §9, the caller logs and discards
    /// methods it doesn't recognize rather than terminating the session.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        if let Some((id, method, payload)) = raw.res {
            if method == "error" {
                let message = extract_message(&payload);
                return Ok(InboundFrame::Error {
                    id: Some(id),
                    message,
                });
            }
            return Ok(InboundFrame::Response { id, method, payload });
        }
        if let Some(error) = raw.error {
            let message = extract_message(&error);
            return Ok(InboundFrame::Error { id: None, message });
        }
        Err(serde::de::Error::custom("frame matched neither res nor error shape"))
    }

    /// `true` when this is the distinguished "quorum not reached" outcome
    /// (§4.C): the caller's own signature was accepted, and it is waiting
    /// for a counterparty signature rather than having genuinely failed.
    pub fn is_quorum_pending(&self) -> bool {
        matches!(self, InboundFrame::Error { message, .. } if message.to_lowercase().contains("quorum not reached"))
    }
}

fn extract_message(value: &Value) -> String {
    value
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| value.get("message").and_then(Value::as_str))
        .unwrap_or("unknown clearing-network error")
        .to_string()
}

/// Notification frame kinds observed unsolicited (§6): an `asu` ("app session
/// update") is equivalent to a successful state-update notification; `bu` is a
/// balance update; `channels` is the post-auth open-channels snapshot push
/// (§4.D); `assets` is a catalogue dump ignored unless requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    AppSessionUpdate,
    BalanceUpdate,
    Channels,
    AssetsCatalogue,
    Other,
}

impl NotificationKind {
    pub fn classify(method: &str) -> Self {
        match method {
            "asu" => NotificationKind::AppSessionUpdate,
            "bu" => NotificationKind::BalanceUpdate,
            "channels" => NotificationKind::Channels,
            "assets" => NotificationKind::AssetsCatalogue,
            _ => NotificationKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_frame() {
        let text = r#"{"res": [1, "create_channel", {"channel_id": "0xC1"}]}"#;
        let frame = InboundFrame::parse(text).unwrap();
        match frame {
            InboundFrame::Response { id, method, .. } => {
                assert_eq!(id, 1);
                assert_eq!(method, "create_channel");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn parses_bare_error_frame() {
        let text = r#"{"error": {"message": "bad signature"}}"#;
        let frame = InboundFrame::parse(text).unwrap();
        match frame {
            InboundFrame::Error { id, message } => {
                assert_eq!(id, None);
                assert_eq!(message, "bad signature");
            }
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn parses_res_shaped_error_and_flags_quorum_pending() {
        let text = r#"{"res": [7, "error", {"error": "quorum not reached"}]}"#;
        let frame = InboundFrame::parse(text).unwrap();
        assert!(frame.is_quorum_pending());
    }

    #[test]
    fn notification_kind_classifies_known_methods() {
        assert_eq!(NotificationKind::classify("asu"), NotificationKind::AppSessionUpdate);
        assert_eq!(NotificationKind::classify("bu"), NotificationKind::BalanceUpdate);
        assert_eq!(NotificationKind::classify("assets"), NotificationKind::AssetsCatalogue);
        assert_eq!(NotificationKind::classify("channels"), NotificationKind::Channels);
        assert_eq!(NotificationKind::classify("unknown_method"), NotificationKind::Other);
    }
}
