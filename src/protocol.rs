//! Wire formats for presence datagrams and signaling lines
//!
//! ## Presence datagram
//!
//! One UTF-8 JSON object per datagram, at most 256 bytes:
//!
//! ```text
//! ┌───────────────┬──────────┬──────────────────────────────────────────┐
//! │ Field         │ Type     │ Meaning                                  │
//! ├───────────────┼──────────┼──────────────────────────────────────────┤
//! │ inetAddress   │ string   │ Sender's IPv4 address, dotted decimal    │
//! │ isBusy        │ bool     │ Sender is already in a call              │
//! │ type          │ string   │ NotifyState | OfferCall | AcceptCall     │
//! │ target        │ string?  │ Intended recipient of a call message     │
//! └───────────────┴──────────┴──────────────────────────────────────────┘
//! ```
//!
//! ## Signaling line
//!
//! One JSON object per `\n`-terminated line:
//!
//! ```text
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"candidate","label":0,"id":"0","candidate":"candidate:..."}
//! ```

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::constants::MAX_PRESENCE_DATAGRAM;
use crate::error::ProtocolError;

/// Presence message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceKind {
    /// "I'm here"
    #[serde(rename = "NotifyState")]
    Notify,
    /// "I want to call you"
    OfferCall,
    /// "I accept your call"
    AcceptCall,
}

/// A single presence datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// Address of the device that sent the message
    #[serde(rename = "inetAddress")]
    pub address: Ipv4Addr,

    #[serde(rename = "isBusy")]
    pub busy: bool,

    #[serde(rename = "type")]
    pub kind: PresenceKind,

    /// Recipient of an `OfferCall`/`AcceptCall`. Absent means "anyone".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Ipv4Addr>,
}

impl PresenceMessage {
    pub fn notify(address: Ipv4Addr, busy: bool) -> Self {
        Self {
            address,
            busy,
            kind: PresenceKind::Notify,
            target: None,
        }
    }

    pub fn offer_call(address: Ipv4Addr, target: Ipv4Addr) -> Self {
        Self {
            address,
            busy: false,
            kind: PresenceKind::OfferCall,
            target: Some(target),
        }
    }

    pub fn accept_call(address: Ipv4Addr, target: Option<Ipv4Addr>) -> Self {
        Self {
            address,
            busy: false,
            kind: PresenceKind::AcceptCall,
            target,
        }
    }

    /// Whether a device at `local` should act on this message
    pub fn is_for(&self, local: Ipv4Addr) -> bool {
        self.target.map_or(true, |target| target == local)
    }

    /// Serialize to datagram text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_PRESENCE_DATAGRAM {
            return Err(ProtocolError::TooLarge(text.len(), MAX_PRESENCE_DATAGRAM));
        }
        Ok(text)
    }

    /// Parse datagram text. Unknown fields are ignored.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_PRESENCE_DATAGRAM {
            return Err(ProtocolError::TooLarge(text.len(), MAX_PRESENCE_DATAGRAM));
        }
        Ok(serde_json::from_str(text.trim_end_matches(char::from(0)))?)
    }
}

/// Signaling payload exchanged with the media engine.
///
/// The signaling transport carries these as opaque lines; this type exists for
/// the engine side that has to produce and interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        /// m-line index
        label: u32,
        /// m-line identifier
        id: String,
        candidate: String,
    },
}

impl SignalingPayload {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_round_trip_each_kind() {
        let local = Ipv4Addr::new(192, 168, 0, 103);
        let other = Ipv4Addr::new(192, 168, 0, 7);

        for message in [
            PresenceMessage::notify(local, true),
            PresenceMessage::offer_call(local, other),
            PresenceMessage::accept_call(local, None),
        ] {
            let text = message.encode().unwrap();
            assert_eq!(PresenceMessage::decode(&text).unwrap(), message);
        }
    }

    #[test]
    fn test_presence_wire_field_names() {
        let text = PresenceMessage::notify(Ipv4Addr::new(10, 0, 0, 5), false)
            .encode()
            .unwrap();

        assert_eq!(text, r#"{"inetAddress":"10.0.0.5","isBusy":false,"type":"NotifyState"}"#);
    }

    #[test]
    fn test_decode_message_without_target() {
        let message = PresenceMessage::decode(
            r#"{"inetAddress":"192.168.1.4","isBusy":false,"type":"OfferCall"}"#,
        )
        .unwrap();

        assert_eq!(message.kind, PresenceKind::OfferCall);
        assert_eq!(message.target, None);
        assert!(message.is_for(Ipv4Addr::new(192, 168, 1, 9)));
    }

    #[test]
    fn test_directed_message_filtering() {
        let message = PresenceMessage::offer_call(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );

        assert!(message.is_for(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!message.is_for(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_decode_ignores_unknown_fields_and_padding() {
        let message = PresenceMessage::decode(
            "{\"inetAddress\":\"10.0.0.5\",\"isBusy\":true,\"type\":\"AcceptCall\",\"extra\":1}\0\0",
        )
        .unwrap();

        assert_eq!(message.kind, PresenceKind::AcceptCall);
        assert!(message.busy);
    }

    #[test]
    fn test_decode_rejects_foreign_payloads() {
        assert!(matches!(
            PresenceMessage::decode("LAND\x01\x13\x05"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(PresenceMessage::decode(r#"{"inetAddress":"10.0.0.5","isBusy":true,"type":"Hangup"}"#).is_err());
        assert!(PresenceMessage::decode(r#"{"inetAddress":"not-an-ip","isBusy":true,"type":"NotifyState"}"#).is_err());

        let oversized = format!(r#"{{"inetAddress":"10.0.0.5","pad":"{}"}}"#, "x".repeat(300));
        assert!(matches!(
            PresenceMessage::decode(&oversized),
            Err(ProtocolError::TooLarge(_, MAX_PRESENCE_DATAGRAM))
        ));
    }

    #[test]
    fn test_signaling_payload_lines() {
        let candidate = SignalingPayload::from_line(
            r#"{"type":"candidate","label":0,"id":"0","candidate":"candidate:1 1 udp 2122260223 192.168.0.103 40123 typ host"}"#,
        )
        .unwrap();
        assert!(matches!(candidate, SignalingPayload::Candidate { label: 0, .. }));

        let offer = SignalingPayload::Offer { sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".to_string() };
        let line = offer.to_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"type":"offer""#));
        assert_eq!(SignalingPayload::from_line(&line).unwrap(), offer);
    }
}
