//! Signaling protocol
//!
//! Messages exchanged on the stream-scoped channel. The JSON shape
//! (`type` tag, `from`/`to`, `relayPeerId`, `viewerCount`, `data`) is the
//! interop contract with existing signaling transports and browser peers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{IceCandidate, SessionDescription};
use crate::types::{ParticipantId, StreamId};

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// A viewer announces presence to the broadcaster
    ViewerJoin { from: ParticipantId },
    /// Direct offer from the broadcaster
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        data: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        data: SessionDescription,
    },
    IceCandidate {
        from: ParticipantId,
        to: ParticipantId,
        data: IceCandidate,
    },
    /// With `relay_peer_id`: the broadcaster instructs `to` to connect via
    /// that relay. Without it: `from` asks relay `to` for a stream.
    RelayRequest {
        from: ParticipantId,
        to: ParticipantId,
        #[serde(
            rename = "relayPeerId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        relay_peer_id: Option<ParticipantId>,
    },
    RelayOffer {
        from: ParticipantId,
        to: ParticipantId,
        data: SessionDescription,
    },
    RelayAnswer {
        from: ParticipantId,
        to: ParticipantId,
        data: SessionDescription,
    },
    /// Sub-tree size reported upstream by a relay (itself included)
    ViewerCount {
        from: ParticipantId,
        #[serde(rename = "viewerCount")]
        viewer_count: u64,
    },
    /// The broadcaster designated `to` as a relay
    RelayPromote {
        from: ParticipantId,
        to: ParticipantId,
    },
    ViewerLeave { from: ParticipantId },
    StreamEnd { from: ParticipantId },
}

impl SignalingMessage {
    #[must_use]
    pub const fn from(&self) -> &ParticipantId {
        match self {
            Self::ViewerJoin { from }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::RelayRequest { from, .. }
            | Self::RelayOffer { from, .. }
            | Self::RelayAnswer { from, .. }
            | Self::ViewerCount { from, .. }
            | Self::RelayPromote { from, .. }
            | Self::ViewerLeave { from }
            | Self::StreamEnd { from } => from,
        }
    }

    /// Addressee, `None` for channel-wide messages
    #[must_use]
    pub const fn to(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::RelayRequest { to, .. }
            | Self::RelayOffer { to, .. }
            | Self::RelayAnswer { to, .. }
            | Self::RelayPromote { to, .. } => Some(to),
            Self::ViewerJoin { .. }
            | Self::ViewerCount { .. }
            | Self::ViewerLeave { .. }
            | Self::StreamEnd { .. } => None,
        }
    }

    /// Whether `me` should process this message: never our own echo, and
    /// addressed messages only when they name us.
    #[must_use]
    pub fn is_addressed_to(&self, me: &ParticipantId) -> bool {
        if self.from() == me {
            return false;
        }
        self.to().map_or(true, |to| to == me)
    }

    /// Wire name of the message type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ViewerJoin { .. } => "viewer-join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RelayRequest { .. } => "relay-request",
            Self::RelayOffer { .. } => "relay-offer",
            Self::RelayAnswer { .. } => "relay-answer",
            Self::ViewerCount { .. } => "viewer-count",
            Self::RelayPromote { .. } => "relay-promote",
            Self::ViewerLeave { .. } => "viewer-leave",
            Self::StreamEnd { .. } => "stream-end",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A joined, stream-scoped channel
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Best-effort, fire-and-forget send
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    async fn leave(&self) -> Result<()>;
}

/// Result of joining a channel: the send side plus the inbox of messages
/// delivered to this participant
pub struct Subscription {
    pub channel: Arc<dyn SignalingChannel>,
    pub inbox: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Pub/sub transport carrying the signaling messages
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join the channel for `stream_id` as `participant`.
    /// Fails with `ChannelJoinFailed`.
    async fn join_channel(
        &self,
        stream_id: &StreamId,
        participant: &ParticipantId,
    ) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[test]
    fn test_wire_shapes() {
        let msg = SignalingMessage::RelayRequest {
            from: id("host"),
            to: id("c"),
            relay_peer_id: Some(id("a")),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "relay-request");
        assert_eq!(json["relayPeerId"], "a");

        let msg = SignalingMessage::ViewerCount {
            from: id("a"),
            viewer_count: 3,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "viewer-count");
        assert_eq!(json["viewerCount"], 3);
        assert!(json.get("to").is_none());
    }

    #[test]
    fn test_decode_browser_payloads() {
        let raw = r#"{"type":"viewer-join","from":"v1"}"#;
        assert_eq!(
            SignalingMessage::decode(raw).unwrap(),
            SignalingMessage::ViewerJoin { from: id("v1") }
        );

        // A viewer's request to a relay carries no relayPeerId
        let raw = r#"{"type":"relay-request","from":"c","to":"a"}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        assert!(matches!(
            msg,
            SignalingMessage::RelayRequest {
                relay_peer_id: None,
                ..
            }
        ));

        let raw = r#"{"type":"answer","from":"v1","to":"host","data":{"type":"answer","sdp":"v=0"}}"#;
        let msg = SignalingMessage::decode(raw).unwrap();
        assert_eq!(msg.kind(), "answer");
        assert_eq!(msg.to(), Some(&id("host")));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(SignalingMessage::decode(r#"{"type":"chat","from":"x"}"#).is_err());
    }

    #[test]
    fn test_addressing() {
        let me = id("me");
        let broadcast = SignalingMessage::ViewerJoin { from: id("other") };
        assert!(broadcast.is_addressed_to(&me));

        let echo = SignalingMessage::ViewerJoin { from: me.clone() };
        assert!(!echo.is_addressed_to(&me));

        let elsewhere = SignalingMessage::RelayPromote {
            from: id("host"),
            to: id("someone"),
        };
        assert!(!elsewhere.is_addressed_to(&me));
    }
}
