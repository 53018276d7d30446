//! Media collaborator boundary
//!
//! The relay core never touches capture, codecs or NAT traversal. It drives
//! a peer-connection library through two traits:
//!
//! - **`MediaEngine`**: acquires the local source and creates connections
//! - **`PeerConnection`**: one negotiated point-to-point connection
//!
//! Connection callbacks (state changes, gathered ICE candidates) are not
//! handled here; implementations push them as [`LinkEvent`]s into the
//! owning session's event queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::link::LinkEventSender;
use crate::types::{LinkId, ParticipantId};

/// Session description (SDP) in the shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// What the broadcaster asks the media library for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to a media source: either the broadcaster's captured tracks or
/// the tracks a viewer received and can re-attach when relaying.
///
/// The payload is owned by the engine that produced the handle; other
/// engines see it as opaque.
#[derive(Clone)]
pub struct MediaHandle {
    id: String,
    kinds: Vec<TrackKind>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaHandle {
    pub fn new(id: impl Into<String>, kinds: Vec<TrackKind>) -> Self {
        Self {
            id: id.into(),
            kinds,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kinds(&self) -> &[TrackKind] {
        &self.kinds
    }

    /// Engine-specific payload, if it is of type `T`
    #[must_use]
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// One underlying point-to-point media connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer, then create and install the answer
    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer to a previously created offer
    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send the tracks of `media` over this connection
    async fn attach_track(&self, media: &MediaHandle) -> Result<()>;

    /// Tracks received over this connection, once any have arrived
    fn remote_track(&self) -> Option<MediaHandle>;

    async fn close(&self) -> Result<()>;
}

/// Factory side of the media collaborator
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Acquire the local capture source. Fails with `MediaUnavailable`.
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaHandle>;

    async fn release_media(&self, media: &MediaHandle);

    /// Create a connection to `remote`. Every callback the connection
    /// produces is sent to `events` tagged with `link_id`.
    async fn new_connection(
        &self,
        remote: &ParticipantId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_uses_browser_field_names() {
        let desc = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_ice_candidate_round_trips_browser_json() {
        let raw = r#"{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(serde_json::to_string(&candidate).unwrap(), raw);
    }

    #[test]
    fn test_media_handle_payload_downcast() {
        let handle = MediaHandle::new("cam", vec![TrackKind::Video]).with_payload(42u32);
        assert_eq!(handle.payload::<u32>(), Some(&42));
        assert!(handle.payload::<String>().is_none());
        assert_eq!(handle.kinds(), &[TrackKind::Video]);
    }
}
