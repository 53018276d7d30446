//! In-process collaborators
//!
//! Single-node implementations of the external interfaces, used by the
//! simulation harness and the test suites:
//!
//! - **`MemorySignalingHub`**: stream-scoped message bus
//! - **`MemoryStreamStore`**: stream records kept in memory
//! - **`LoopbackNetwork`**: simulated peer connections between participants

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, TransportState};
use crate::media::{
    IceCandidate, MediaConstraints, MediaEngine, MediaHandle, PeerConnection, SessionDescription,
    TrackKind,
};
use crate::metadata::{NewStreamRecord, StreamRecordStore};
use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport, Subscription};
use crate::types::{LinkId, ParticipantId, StreamId};

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Member {
    member_id: String,
    participant: ParticipantId,
    sender: mpsc::UnboundedSender<SignalingMessage>,
}

/// In-memory hub routing signaling messages between participants of a stream
#[derive(Clone, Default)]
pub struct MemorySignalingHub {
    /// Map of stream -> joined members
    channels: Arc<DashMap<StreamId, Vec<Member>>>,
}

impl MemorySignalingHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members currently joined to a stream's channel
    #[must_use]
    pub fn member_count(&self, stream_id: &StreamId) -> usize {
        self.channels.get(stream_id).map_or(0, |m| m.len())
    }

    /// Deliver a message: to its addressee if it has one, otherwise to every
    /// member except the sending one. Returns the number of deliveries.
    fn deliver(&self, stream_id: &StreamId, sender_member: &str, message: &SignalingMessage) -> usize {
        let mut sent_count = 0;
        let mut dead_members = Vec::new();

        if let Some(members) = self.channels.get(stream_id) {
            for member in members.iter() {
                if member.member_id == sender_member {
                    continue;
                }
                if let Some(to) = message.to() {
                    if *to != member.participant {
                        continue;
                    }
                }
                if member.sender.send(message.clone()).is_ok() {
                    sent_count += 1;
                } else {
                    dead_members.push(member.member_id.clone());
                }
            }
        }

        for member_id in dead_members {
            self.remove_member(stream_id, &member_id);
        }

        debug!(
            stream_id = %stream_id,
            kind = message.kind(),
            from = %message.from(),
            sent_count,
            "Delivered signaling message"
        );
        sent_count
    }

    fn remove_member(&self, stream_id: &StreamId, member_id: &str) {
        let now_empty = if let Some(mut members) = self.channels.get_mut(stream_id) {
            members.retain(|m| m.member_id != member_id);
            members.is_empty()
        } else {
            false
        };

        if now_empty {
            self.channels.remove_if(stream_id, |_, members| members.is_empty());
            debug!(stream_id = %stream_id, "Channel has no more members, removed");
        }
    }
}

#[async_trait]
impl SignalingTransport for MemorySignalingHub {
    async fn join_channel(
        &self,
        stream_id: &StreamId,
        participant: &ParticipantId,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = nanoid::nanoid!(8);

        self.channels
            .entry(stream_id.clone())
            .or_default()
            .push(Member {
                member_id: member_id.clone(),
                participant: participant.clone(),
                sender: tx,
            });

        info!(
            stream_id = %stream_id,
            participant = %participant,
            member_id = %member_id,
            "Participant joined signaling channel"
        );

        Ok(Subscription {
            channel: Arc::new(MemoryChannel {
                hub: self.clone(),
                stream_id: stream_id.clone(),
                member_id,
                left: AtomicBool::new(false),
            }),
            inbox: rx,
        })
    }
}

struct MemoryChannel {
    hub: MemorySignalingHub,
    stream_id: StreamId,
    member_id: String,
    left: AtomicBool,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(Error::SignalingSend("channel already left".to_string()));
        }
        self.hub.deliver(&self.stream_id, &self.member_id, &message);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        if !self.left.swap(true, Ordering::SeqCst) {
            self.hub.remove_member(&self.stream_id, &self.member_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stream records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: StreamId,
    pub host_id: ParticipantId,
    pub title: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub is_active: bool,
    pub viewer_count: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct MemoryStreamStore {
    records: Arc<DashMap<StreamId, StreamRecord>>,
}

impl MemoryStreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, stream_id: &StreamId) -> Option<StreamRecord> {
        self.records.get(stream_id).map(|r| r.value().clone())
    }

    /// Active public streams, newest first
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamRecord> {
        let mut streams: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.is_active && r.is_public)
            .map(|r| r.value().clone())
            .collect();
        streams.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        streams
    }
}

#[async_trait]
impl StreamRecordStore for MemoryStreamStore {
    async fn create_stream_record(&self, record: NewStreamRecord) -> Result<StreamId> {
        let id = StreamId::new(nanoid::nanoid!(12));
        self.records.insert(
            id.clone(),
            StreamRecord {
                id: id.clone(),
                host_id: record.host_id,
                title: record.title,
                description: record.description,
                is_public: record.is_public,
                is_active: true,
                viewer_count: 0,
                started_at: Utc::now(),
                ended_at: None,
            },
        );
        Ok(id)
    }

    async fn update_viewer_count(&self, stream_id: &StreamId, count: u64) -> Result<()> {
        let mut record = self
            .records
            .get_mut(stream_id)
            .ok_or_else(|| Error::Metadata(format!("stream {stream_id} not found")))?;
        record.viewer_count = count;
        Ok(())
    }

    async fn end_stream(&self, stream_id: &StreamId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(stream_id)
            .ok_or_else(|| Error::Metadata(format!("stream {stream_id} not found")))?;
        record.is_active = false;
        record.ended_at = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loopback media
// ---------------------------------------------------------------------------

/// Simulated network of paired peer connections.
///
/// The connection `a -> b` and the connection `b -> a` are the two ends of
/// one simulated link. Both ends report `Connected` once each has a local
/// and a remote description and has received at least one remote ICE
/// candidate. Closing one end reports `Closed` to the other.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    /// (local, remote) -> endpoint
    endpoints: DashMap<(ParticipantId, ParticipantId), Arc<LoopbackConnection>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Media engine for one participant, with a working capture source.
    /// The engine keeps the network alive; connections it opens do not.
    pub fn engine(&self, participant: impl Into<ParticipantId>) -> LoopbackMedia {
        LoopbackMedia {
            participant: participant.into(),
            network: Arc::clone(&self.inner),
            capture_available: true,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Media engine whose capture source cannot be acquired
    pub fn engine_without_capture(&self, participant: impl Into<ParticipantId>) -> LoopbackMedia {
        LoopbackMedia {
            capture_available: false,
            ..self.engine(participant)
        }
    }

    /// Simulate a transport failure on the link between `a` and `b`
    pub fn fail_link(&self, a: &ParticipantId, b: &ParticipantId) {
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            let endpoint = self.inner.endpoints.get(&key).map(|e| Arc::clone(e.value()));
            if let Some(endpoint) = endpoint {
                if endpoint.mark_failed() {
                    endpoint.report(TransportState::Failed);
                }
            }
        }
    }

    /// Number of endpoints not yet closed
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner
            .endpoints
            .iter()
            .filter(|e| !e.value().is_closed())
            .count()
    }

    /// Number of open endpoints owned by `participant`
    #[must_use]
    pub fn open_connections_of(&self, participant: &ParticipantId) -> usize {
        self.inner
            .endpoints
            .iter()
            .filter(|e| e.key().0 == *participant && !e.value().is_closed())
            .count()
    }

    /// Whether the endpoint `local -> remote` is connected
    #[must_use]
    pub fn is_connected(&self, local: &ParticipantId, remote: &ParticipantId) -> bool {
        self.inner
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|e| e.state.lock().connected)
    }

    /// ICE candidates applied to the endpoint `local -> remote`
    #[must_use]
    pub fn remote_candidates(&self, local: &ParticipantId, remote: &ParticipantId) -> usize {
        self.inner
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map_or(0, |e| e.state.lock().remote_candidates)
    }
}

impl NetworkInner {
    fn endpoint(&self, local: &ParticipantId, remote: &ParticipantId) -> Option<Arc<LoopbackConnection>> {
        self.endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Connect both ends once both are ready
    fn try_establish(&self, a: &ParticipantId, b: &ParticipantId) {
        let (Some(ab), Some(ba)) = (self.endpoint(a, b), self.endpoint(b, a)) else {
            return;
        };
        if !(ab.is_ready() && ba.is_ready()) {
            return;
        }

        let a_sends = ab.state.lock().attached.clone();
        let b_sends = ba.state.lock().attached.clone();
        if ab.mark_connected(b_sends) {
            ab.report(TransportState::Connected);
        }
        if ba.mark_connected(a_sends) {
            ba.report(TransportState::Connected);
        }
    }
}

/// Per-participant media engine on a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackMedia {
    participant: ParticipantId,
    network: Arc<NetworkInner>,
    capture_available: bool,
    released: Arc<AtomicBool>,
}

impl LoopbackMedia {
    /// Whether the capture source acquired from this engine was released
    #[must_use]
    pub fn media_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for LoopbackMedia {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        if !self.capture_available {
            return Err(Error::MediaUnavailable(format!(
                "no capture device for {}",
                self.participant
            )));
        }

        let mut kinds = Vec::new();
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if kinds.is_empty() {
            return Err(Error::MediaUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        self.released.store(false, Ordering::SeqCst);
        Ok(MediaHandle::new(format!("{}-capture", self.participant), kinds))
    }

    async fn release_media(&self, media: &MediaHandle) {
        debug!(participant = %self.participant, media = media.id(), "Released capture");
        self.released.store(true, Ordering::SeqCst);
    }

    async fn new_connection(
        &self,
        remote: &ParticipantId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(LoopbackConnection {
            local: self.participant.clone(),
            remote: remote.clone(),
            link_id,
            events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(EndpointState::default()),
        });
        self.network.endpoints.insert(
            (self.participant.clone(), remote.clone()),
            Arc::clone(&connection),
        );

        Ok(connection)
    }
}

#[derive(Default)]
struct EndpointState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: usize,
    attached: Option<MediaHandle>,
    received: Option<MediaHandle>,
    connected: bool,
    failed: bool,
    closed: bool,
}

struct LoopbackConnection {
    local: ParticipantId,
    remote: ParticipantId,
    link_id: LinkId,
    events: LinkEventSender,
    network: Weak<NetworkInner>,
    state: Mutex<EndpointState>,
}

impl LoopbackConnection {
    fn report(&self, state: TransportState) {
        // The owning session may already be gone
        let _ = self.events.send(LinkEvent {
            link_id: self.link_id,
            remote: self.remote.clone(),
            kind: LinkEventKind::StateChanged(state),
        });
    }

    fn emit_candidate(&self) {
        let _ = self.events.send(LinkEvent {
            link_id: self.link_id,
            remote: self.remote.clone(),
            kind: LinkEventKind::LocalCandidate(IceCandidate {
                candidate: format!("candidate:loopback 1 udp {} {}", self.local, self.link_id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }),
        });
    }

    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.local_description.is_some()
            && state.remote_description.is_some()
            && state.remote_candidates > 0
            && !state.connected
            && !state.failed
            && !state.closed
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn mark_connected(&self, received: Option<MediaHandle>) -> bool {
        let mut state = self.state.lock();
        if state.connected || state.failed || state.closed {
            return false;
        }
        state.connected = true;
        state.received = received;
        true
    }

    fn mark_failed(&self) -> bool {
        let mut state = self.state.lock();
        if state.failed || state.closed {
            return false;
        }
        state.failed = true;
        state.connected = false;
        true
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed || state.failed {
            return Err(Error::Transport(format!(
                "connection {} -> {} is no longer usable",
                self.local, self.remote
            )));
        }
        Ok(())
    }

    fn establish(&self) {
        if let Some(network) = self.network.upgrade() {
            network.try_establish(&self.local, &self.remote);
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_usable()?;
        let offer = SessionDescription::offer(format!(
            "loopback {} -> {} {}",
            self.local, self.remote, self.link_id
        ));
        self.state.lock().local_description = Some(offer.clone());
        self.emit_candidate();
        Ok(offer)
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.ensure_usable()?;
        let answer = SessionDescription::answer(format!(
            "loopback {} -> {} {}",
            self.local, self.remote, self.link_id
        ));
        {
            let mut state = self.state.lock();
            state.remote_description = Some(offer);
            state.local_description = Some(answer.clone());
        }
        self.emit_candidate();
        self.establish();
        Ok(answer)
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        self.ensure_usable()?;
        self.state.lock().remote_description = Some(answer);
        self.establish();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.ensure_usable()?;
        self.state.lock().remote_candidates += 1;
        self.establish();
        Ok(())
    }

    async fn attach_track(&self, media: &MediaHandle) -> Result<()> {
        self.ensure_usable()?;
        self.state.lock().attached = Some(media.clone());
        Ok(())
    }

    fn remote_track(&self) -> Option<MediaHandle> {
        self.state.lock().received.clone()
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connected = false;
        }

        let Some(network) = self.network.upgrade() else {
            return Ok(());
        };
        network.endpoints.remove_if(&(self.local.clone(), self.remote.clone()), |_, e| {
            e.link_id == self.link_id
        });

        if let Some(peer) = network.endpoint(&self.remote, &self.local) {
            let notify = {
                let state = peer.state.lock();
                !state.closed && !state.failed
            };
            if notify {
                peer.report(TransportState::Closed);
            }
        } else {
            warn!(local = %self.local, remote = %self.remote, "Closed loopback endpoint has no peer");
        }
        Ok(())
    }
}
