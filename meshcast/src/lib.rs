//! Meshcast relay core
//!
//! Peer-to-peer live broadcast over a self-organizing relay tree. A
//! broadcaster serves a bounded number of viewers directly; past that cap,
//! connected viewers are promoted to relays and forward the stream to
//! later viewers, so the audience grows without growing the
//! broadcaster's fan-out.
//!
//! ## Architecture
//!
//! - **`BroadcasterSession`**: capture, direct links, relay promotion, viewer count
//! - **`ViewerSession`**: one inbound link, optional relay forwarding, count reports
//! - **`PeerLink`**: per-connection state machine (`new → connecting → connected → failed|closed`)
//! - **`TopologyPolicy`**: pure placement decision for each joining viewer
//! - **`ViewerCountAggregator`**: direct viewers plus relay sub-tree reports
//!
//! Media, signaling and stream metadata are collaborators behind traits
//! (`MediaEngine`, `SignalingTransport`, `StreamRecordStore`). The `memory`
//! module implements all three in-process; `rtc` implements the media side
//! with `webrtc-rs`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshcast::{BroadcastParams, BroadcasterSession, Collaborators, ParticipantId};
//!
//! let session = BroadcasterSession::start(
//!     BroadcastParams::new(ParticipantId::random(), "Live"),
//!     Collaborators { media, signaling, streams },
//! )
//! .await?;
//! // ...
//! session.stop().await;
//! ```

pub mod aggregator;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod media;
pub mod memory;
pub mod metadata;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaling;
pub mod topology;
pub mod types;
pub mod viewer;

pub use aggregator::ViewerCountAggregator;
pub use broadcaster::{BroadcastParams, BroadcasterSession, BroadcasterStats, Collaborators};
pub use config::{LogFormat, LoggingConfig, MeshConfig};
pub use error::{Error, Result};
pub use link::{LinkDirection, LinkRole, LinkSnapshot, LinkState, PeerLink, TransportState};
pub use logging::init_logging;
pub use media::{
    IceCandidate, MediaConstraints, MediaEngine, MediaHandle, PeerConnection, SessionDescription,
    TrackKind,
};
pub use memory::{LoopbackMedia, LoopbackNetwork, MemorySignalingHub, MemoryStreamStore};
pub use metadata::{NewStreamRecord, StreamRecordStore};
#[cfg(feature = "webrtc")]
pub use rtc::{LocalCapture, RtcMediaEngine};
pub use signaling::{SignalingChannel, SignalingMessage, SignalingTransport, Subscription};
pub use topology::{Placement, TopologyPolicy};
pub use types::{LinkId, ParticipantId, StreamId};
pub use viewer::{ViewerParams, ViewerSession, ViewerStats, ViewerStatus};
