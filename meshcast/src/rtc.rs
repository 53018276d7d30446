//! WebRTC media engine
//!
//! Implements [`MediaEngine`] on top of `webrtc-rs`:
//! - local capture is a set of sample tracks the application writes into
//! - every track received on a connection is mirrored into a local RTP
//!   track by a forwarding task, so a relay can attach it to any number of
//!   outbound connections
//! - connection state and gathered ICE candidates are reported as
//!   [`LinkEvent`]s tagged with the link id

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, TransportState};
use crate::media::{
    IceCandidate, MediaConstraints, MediaEngine, MediaHandle, PeerConnection, SdpType,
    SessionDescription, TrackKind,
};
use crate::types::{LinkId, ParticipantId};

const STREAM_LABEL: &str = "meshcast";

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Map a peer-connection state report; `Unspecified` carries nothing
#[must_use]
pub const fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

pub fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = desc.sdp.clone();
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => {
            return Err(Error::Transport("rollback descriptions are not negotiated".to_string()))
        }
    })
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(c: RTCIceCandidateInit) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

/// Local capture: sample tracks the application feeds with encoded frames
#[derive(Clone)]
pub struct LocalCapture {
    video: Option<Arc<TrackLocalStaticSample>>,
    audio: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalCapture {
    /// Write one encoded VP8 frame
    pub async fn write_video(&self, data: Bytes, duration: Duration) -> Result<()> {
        if let Some(track) = &self.video {
            track
                .write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }

    /// Write one encoded Opus frame
    pub async fn write_audio(&self, data: Bytes, duration: Duration) -> Result<()> {
        if let Some(track) = &self.audio {
            track
                .write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }

    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        [&self.video, &self.audio]
            .into_iter()
            .flatten()
            .map(|t| Arc::clone(t) as Arc<dyn TrackLocal + Send + Sync>)
            .collect()
    }
}

/// Tracks received on an inbound connection, ready to be sent onwards
#[derive(Clone)]
pub struct RelayedTracks {
    tracks: Vec<Arc<TrackLocalStaticRTP>>,
}

impl RelayedTracks {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.tracks
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn TrackLocal + Send + Sync>)
            .collect()
    }
}

fn local_tracks(media: &MediaHandle) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
    if let Some(capture) = media.payload::<LocalCapture>() {
        capture.tracks()
    } else if let Some(relayed) = media.payload::<RelayedTracks>() {
        relayed.tracks()
    } else {
        Vec::new()
    }
}

/// [`MediaEngine`] backed by `webrtc-rs`
pub struct RtcMediaEngine {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcMediaEngine {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    pub fn from_config(config: &MeshConfig) -> Result<Self> {
        Self::new(config.ice_servers.clone())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for RtcMediaEngine {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        let sample_track = |mime: &str, id: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                STREAM_LABEL.to_owned(),
            ))
        };

        let capture = LocalCapture {
            video: constraints.video.then(|| sample_track(MIME_TYPE_VP8, "video")),
            audio: constraints.audio.then(|| sample_track(MIME_TYPE_OPUS, "audio")),
        };

        let mut kinds = Vec::new();
        if capture.video.is_some() {
            kinds.push(TrackKind::Video);
        }
        if capture.audio.is_some() {
            kinds.push(TrackKind::Audio);
        }
        if kinds.is_empty() {
            return Err(Error::MediaUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        info!(kinds = ?kinds, "Created local capture tracks");
        Ok(MediaHandle::new(format!("{STREAM_LABEL}-capture"), kinds).with_payload(capture))
    }

    async fn release_media(&self, media: &MediaHandle) {
        // Sample tracks own no device; unbinding happens when connections close
        debug!(media = media.id(), "Released local capture");
    }

    async fn new_connection(
        &self,
        remote: &ParticipantId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_configuration()).await?);
        let connection = Arc::new(RtcConnection {
            remote: remote.clone(),
            pc: Arc::clone(&pc),
            received: Arc::new(Mutex::new(Vec::new())),
            forwarding: CancellationToken::new(),
        });

        let state_events = events.clone();
        let state_remote = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = transport_state(s) {
                let _ = state_events.send(LinkEvent {
                    link_id,
                    remote: state_remote.clone(),
                    kind: LinkEventKind::StateChanged(state),
                });
            }
            Box::pin(async {})
        }));

        let candidate_events = events;
        let candidate_remote = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering
            if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                let _ = candidate_events.send(LinkEvent {
                    link_id,
                    remote: candidate_remote.clone(),
                    kind: LinkEventKind::LocalCandidate(init.into()),
                });
            }
            Box::pin(async {})
        }));

        let received = Arc::clone(&connection.received);
        let forwarding = connection.forwarding.clone();
        let track_remote = remote.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let local = Arc::new(TrackLocalStaticRTP::new(
                track.codec().capability,
                track.id(),
                track.stream_id(),
            ));
            received.lock().push(Arc::clone(&local));
            tokio::spawn(forward_track(
                track,
                local,
                track_remote.clone(),
                forwarding.child_token(),
            ));
            Box::pin(async {})
        }));

        Ok(connection)
    }
}

/// Copy RTP packets from a received track into its local mirror
async fn forward_track(
    remote_track: Arc<TrackRemote>,
    local: Arc<TrackLocalStaticRTP>,
    from: ParticipantId,
    cancel: CancellationToken,
) {
    let kind = TrackKind::from(remote_track.kind());
    info!(
        from = %from,
        kind = ?kind,
        codec = %remote_track.codec().capability.mime_type,
        "Forwarding received track"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = remote_track.read_rtp() => match read {
                Ok((packet, _attributes)) => {
                    // No bound connections is not an error; packets are dropped
                    if let Err(e) = local.write_rtp(&packet).await {
                        debug!(from = %from, error = %e, "Failed to forward RTP packet");
                    }
                }
                Err(e) => {
                    debug!(from = %from, error = %e, "Received track ended");
                    break;
                }
            }
        }
    }

    debug!(from = %from, kind = ?kind, "RTP forwarder stopped");
}

struct RtcConnection {
    remote: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    received: Arc<Mutex<Vec<Arc<TrackLocalStaticRTP>>>>,
    forwarding: CancellationToken,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.pc.set_remote_description(to_rtc_description(&offer)?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(&answer)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn attach_track(&self, media: &MediaHandle) -> Result<()> {
        let tracks = local_tracks(media);
        if tracks.is_empty() {
            return Err(Error::Transport(format!(
                "media {} carries no WebRTC tracks",
                media.id()
            )));
        }

        for track in tracks {
            let sender = self.pc.add_track(track).await?;
            // RTCP has to be read for interceptors (NACK, reports) to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    fn remote_track(&self) -> Option<MediaHandle> {
        let received = self.received.lock();
        if received.is_empty() {
            return None;
        }
        let kinds = received.iter().map(|t| TrackKind::from(t.kind())).collect();
        Some(
            MediaHandle::new(format!("relay-from-{}", self.remote), kinds).with_payload(
                RelayedTracks {
                    tracks: received.clone(),
                },
            ),
        )
    }

    async fn close(&self) -> Result<()> {
        self.forwarding.cancel();
        if let Err(e) = self.pc.close().await {
            error!(remote = %self.remote, error = %e, "Failed to close peer connection");
            return Err(e.into());
        }
        Ok(())
    }
}
