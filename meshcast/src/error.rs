use thiserror::Error;

use crate::link::{LinkInput, LinkState};
use crate::types::ParticipantId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Signaling channel join failed: {0}")]
    ChannelJoinFailed(String),

    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Link to {0} failed")]
    LinkFailed(ParticipantId),

    #[error("Link to {0} closed")]
    LinkClosed(ParticipantId),

    #[error("Invalid link transition: {input:?} in state {from:?}")]
    InvalidTransition { from: LinkState, input: LinkInput },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling send failed: {0}")]
    SignalingSend(String),

    #[error("Stream metadata error: {0}")]
    Metadata(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[cfg(feature = "webrtc")]
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

impl Error {
    /// Errors that abort starting a broadcaster or viewer session
    #[must_use]
    pub const fn is_fatal_to_start(&self) -> bool {
        matches!(
            self,
            Self::MediaUnavailable(_)
                | Self::ChannelJoinFailed(_)
                | Self::SignalingUnavailable(_)
                | Self::Metadata(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
