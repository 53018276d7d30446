//! Broadcaster session
//!
//! Owns the local capture, one outbound link per direct viewer, the set of
//! promoted relays and the aggregate viewer count. All mutations go through
//! one async mutex, so handlers for signaling messages, transport callbacks
//! and timer ticks never interleave on the session state.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::aggregator::ViewerCountAggregator;
use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::link::{
    LinkDirection, LinkEvent, LinkEventKind, LinkEventReceiver, LinkEventSender, LinkInput,
    LinkRole, LinkSnapshot, LinkState, PeerLink,
};
use crate::media::{IceCandidate, MediaConstraints, MediaEngine, MediaHandle, SessionDescription};
use crate::metadata::{NewStreamRecord, StreamRecordStore};
use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport};
use crate::topology::{Placement, TopologyPolicy};
use crate::types::{LinkId, ParticipantId, StreamId};

/// Parameters for starting a broadcast
#[derive(Debug, Clone)]
pub struct BroadcastParams {
    pub broadcaster_id: ParticipantId,
    pub title: String,
    pub description: Option<String>,
    pub is_public: bool,
    pub constraints: MediaConstraints,
    pub config: MeshConfig,
}

impl BroadcastParams {
    pub fn new(broadcaster_id: ParticipantId, title: impl Into<String>) -> Self {
        Self {
            broadcaster_id,
            title: title.into(),
            description: None,
            is_public: true,
            constraints: MediaConstraints::default(),
            config: MeshConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }
}

/// External services a broadcaster depends on
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaEngine>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub streams: Arc<dyn StreamRecordStore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcasterStats {
    pub stream_id: String,
    pub direct_links: usize,
    pub relay_links: usize,
    pub connected_links: usize,
    pub connecting_links: usize,
    pub promoted_relays: Vec<ParticipantId>,
    pub total_viewers: u64,
    pub near_capacity: bool,
    pub promotions: u64,
    pub deferred_joins: u64,
    pub stopped: bool,
}

#[derive(Default)]
struct BroadcasterState {
    media: Option<MediaHandle>,
    /// Keyed by viewer; insertion order decides "first found" for placement
    links: IndexMap<ParticipantId, PeerLink>,
    /// Always equal to the keys of `links` whose role is relay
    promoted: IndexSet<ParticipantId>,
    counts: ViewerCountAggregator,
    next_link_id: u64,
    near_capacity: bool,
    promotions: u64,
    deferred_joins: u64,
}

impl BroadcasterState {
    fn allocate_link_id(&mut self) -> LinkId {
        self.next_link_id += 1;
        LinkId::new(self.next_link_id)
    }

    fn snapshots(&self) -> Vec<LinkSnapshot> {
        self.links.values().map(PeerLink::snapshot).collect()
    }

    fn total_viewers(&self) -> u64 {
        let connected_direct = self
            .links
            .values()
            .filter(|l| l.role() == LinkRole::Direct && l.is_connected())
            .count();
        let connected_relays = self
            .links
            .values()
            .filter(|l| l.role() == LinkRole::Relay && l.is_connected())
            .map(PeerLink::remote);
        self.counts.total(connected_direct, connected_relays)
    }

    /// Drop relay bookkeeping for a link that is gone
    fn forget_relay(&mut self, remote: &ParticipantId) -> bool {
        let was_relay = self.promoted.shift_remove(remote);
        self.counts.forget(remote);
        was_relay
    }
}

struct BroadcasterInner {
    id: ParticipantId,
    stream_id: StreamId,
    config: MeshConfig,
    policy: TopologyPolicy,
    media_engine: Arc<dyn MediaEngine>,
    channel: Arc<dyn SignalingChannel>,
    streams: Arc<dyn StreamRecordStore>,
    state: Mutex<BroadcasterState>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    events_tx: LinkEventSender,
}

/// Handle to a running broadcast. Cloning shares the session; the
/// background loop stops when the last handle is dropped or on [`stop`].
///
/// [`stop`]: BroadcasterSession::stop
#[derive(Clone)]
pub struct BroadcasterSession {
    inner: Arc<BroadcasterInner>,
    _guard: Arc<DropGuard>,
}

impl BroadcasterSession {
    /// Acquire local media, create the stream record and join the stream's
    /// signaling channel. Anything acquired before a failing step is released.
    pub async fn start(params: BroadcastParams, deps: Collaborators) -> Result<Self> {
        let broadcaster_id = params.broadcaster_id.clone();

        let media = deps
            .media
            .acquire_local_media(&params.constraints)
            .await
            .map_err(|e| {
                error!(broadcaster_id = %broadcaster_id, error = %e, "Failed to acquire local media");
                match e {
                    Error::MediaUnavailable(_) => e,
                    other => Error::MediaUnavailable(other.to_string()),
                }
            })?;

        let record = NewStreamRecord {
            host_id: broadcaster_id.clone(),
            title: params.title.clone(),
            description: params.description.clone(),
            is_public: params.is_public,
        };
        let stream_id = match deps.streams.create_stream_record(record).await {
            Ok(id) => id,
            Err(e) => {
                error!(broadcaster_id = %broadcaster_id, error = %e, "Failed to create stream record");
                deps.media.release_media(&media).await;
                return Err(e);
            }
        };

        let subscription = match deps.signaling.join_channel(&stream_id, &broadcaster_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(
                    broadcaster_id = %broadcaster_id,
                    stream_id = %stream_id,
                    error = %e,
                    "Failed to join signaling channel"
                );
                if let Err(end_err) = deps.streams.end_stream(&stream_id).await {
                    warn!(stream_id = %stream_id, error = %end_err, "Failed to end stream record");
                }
                deps.media.release_media(&media).await;
                return Err(match e {
                    Error::ChannelJoinFailed(_) => e,
                    other => Error::ChannelJoinFailed(other.to_string()),
                });
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new(BroadcasterInner {
            id: broadcaster_id,
            stream_id,
            policy: TopologyPolicy::from_config(&params.config),
            config: params.config,
            media_engine: deps.media,
            channel: subscription.channel,
            streams: deps.streams,
            state: Mutex::new(BroadcasterState {
                media: Some(media),
                ..Default::default()
            }),
            stopped: AtomicBool::new(false),
            cancel: cancel.clone(),
            events_tx,
        });

        tokio::spawn(Arc::clone(&inner).run(subscription.inbox, events_rx));

        info!(
            broadcaster_id = %inner.id,
            stream_id = %inner.stream_id,
            channel = %inner.stream_id.channel_name(),
            max_direct = inner.policy.max_direct_connections(),
            "Broadcast started"
        );

        Ok(Self {
            inner,
            _guard: Arc::new(cancel.drop_guard()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.inner.id
    }

    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.inner.stream_id
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        self.inner.handle_message(message).await
    }

    /// Place a joining viewer. Returns `None` when the join was ignored
    /// (duplicate, own echo or stopped session).
    pub async fn on_viewer_join(&self, viewer: &ParticipantId) -> Result<Option<Placement>> {
        self.inner.on_viewer_join(viewer).await
    }

    pub async fn on_answer(&self, viewer: &ParticipantId, answer: SessionDescription) -> Result<()> {
        self.inner.on_answer(viewer, answer).await
    }

    pub async fn on_ice_candidate(
        &self,
        viewer: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.inner.on_ice_candidate(viewer, candidate).await
    }

    /// Record a relay's sub-tree size. Reports from non-relays are ignored.
    pub async fn on_relay_count_report(&self, relay: &ParticipantId, count: u64) -> bool {
        self.inner.on_relay_count_report(relay, count).await
    }

    pub async fn on_viewer_leave(&self, viewer: &ParticipantId) {
        self.inner.on_viewer_leave(viewer).await;
    }

    /// Push the aggregate count to the stream record if it changed
    pub async fn publish_viewer_count(&self) -> Option<u64> {
        self.inner.publish_viewer_count().await
    }

    /// Tear the broadcast down. Idempotent.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    pub async fn links(&self) -> Vec<LinkSnapshot> {
        self.inner.state.lock().await.snapshots()
    }

    pub async fn link_state(&self, viewer: &ParticipantId) -> Option<LinkState> {
        self.inner.state.lock().await.links.get(viewer).map(PeerLink::state)
    }

    pub async fn promoted_relays(&self) -> Vec<ParticipantId> {
        self.inner.state.lock().await.promoted.iter().cloned().collect()
    }

    pub async fn total_viewers(&self) -> u64 {
        self.inner.state.lock().await.total_viewers()
    }

    pub async fn stats(&self) -> BroadcasterStats {
        let state = self.inner.state.lock().await;
        let count_role = |role: LinkRole| state.links.values().filter(|l| l.role() == role).count();
        BroadcasterStats {
            stream_id: self.inner.stream_id.to_string(),
            direct_links: count_role(LinkRole::Direct),
            relay_links: count_role(LinkRole::Relay),
            connected_links: state.links.values().filter(|l| l.is_connected()).count(),
            connecting_links: state.links.values().filter(|l| l.is_connecting()).count(),
            promoted_relays: state.promoted.iter().cloned().collect(),
            total_viewers: state.total_viewers(),
            near_capacity: state.near_capacity,
            promotions: state.promotions,
            deferred_joins: state.deferred_joins,
            stopped: self.inner.is_stopped(),
        }
    }
}

impl BroadcasterInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<SignalingMessage>, mut events: LinkEventReceiver) {
        let mut publish = tokio::time::interval(self.config.publish_interval());
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(broadcaster_id = %self.id, "Broadcaster loop cancelled");
                    break;
                }
                Some(message) = inbox.recv() => {
                    let kind = message.kind();
                    if let Err(e) = self.handle_message(message).await {
                        warn!(broadcaster_id = %self.id, kind, error = %e, "Failed to handle signaling message");
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_link_event(event).await;
                }
                _ = publish.tick() => {
                    self.publish_viewer_count().await;
                }
            }
        }
    }

    async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        if !message.is_addressed_to(&self.id) {
            return Ok(());
        }

        match message {
            SignalingMessage::ViewerJoin { from } => self.on_viewer_join(&from).await.map(|_| ()),
            SignalingMessage::Answer { from, data, .. } => self.on_answer(&from, data).await,
            SignalingMessage::IceCandidate { from, data, .. } => {
                self.on_ice_candidate(&from, data).await
            }
            SignalingMessage::ViewerCount { from, viewer_count } => {
                self.on_relay_count_report(&from, viewer_count).await;
                Ok(())
            }
            SignalingMessage::ViewerLeave { from } => {
                self.on_viewer_leave(&from).await;
                Ok(())
            }
            other => {
                debug!(
                    broadcaster_id = %self.id,
                    kind = other.kind(),
                    from = %other.from(),
                    "Ignoring message not handled by the broadcaster"
                );
                Ok(())
            }
        }
    }

    async fn on_viewer_join(&self, viewer: &ParticipantId) -> Result<Option<Placement>> {
        if *viewer == self.id {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        if self.is_stopped() {
            return Ok(None);
        }
        if state.links.contains_key(viewer) {
            debug!(viewer_id = %viewer, "Duplicate viewer-join ignored");
            return Ok(None);
        }

        // Decide against a snapshot, then apply
        let placement = self.policy.place_viewer(&state.snapshots());

        match &placement {
            Placement::Direct => self.open_direct_link(&mut state, viewer).await?,
            Placement::Reuse(relay) => {
                self.send_relay_instruction(viewer, relay).await?;
                info!(viewer_id = %viewer, relay_id = %relay, "Routed viewer to existing relay");
            }
            Placement::Promote(relay) => {
                self.promote(&mut state, relay).await;
                self.send_relay_instruction(viewer, relay).await?;
                info!(viewer_id = %viewer, relay_id = %relay, "Routed viewer to newly promoted relay");
            }
            Placement::Deferred => {
                state.deferred_joins += 1;
                info!(
                    viewer_id = %viewer,
                    direct_links = TopologyPolicy::direct_count(&state.snapshots()),
                    "At capacity with no connected viewer to relay through; join deferred"
                );
            }
        }

        self.update_capacity(&mut state);
        Ok(Some(placement))
    }

    async fn open_direct_link(&self, state: &mut BroadcasterState, viewer: &ParticipantId) -> Result<()> {
        let media = state.media.clone().ok_or(Error::SessionClosed)?;
        let link_id = state.allocate_link_id();
        let connection = self
            .media_engine
            .new_connection(viewer, link_id, self.events_tx.clone())
            .await?;
        let mut link = PeerLink::new(
            link_id,
            viewer.clone(),
            LinkRole::Direct,
            LinkDirection::Outbound,
            connection,
        );

        let offer = match Self::negotiate_offer(&mut link, &media).await {
            Ok(offer) => offer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        state.links.insert(viewer.clone(), link);

        let message = SignalingMessage::Offer {
            from: self.id.clone(),
            to: viewer.clone(),
            data: offer,
        };
        if let Err(e) = self.channel.send(message).await {
            if let Some(mut link) = state.links.shift_remove(viewer) {
                link.close().await;
            }
            return Err(e);
        }

        info!(
            viewer_id = %viewer,
            link_id = %link_id,
            direct_links = TopologyPolicy::direct_count(&state.snapshots()),
            "Opened direct link"
        );
        Ok(())
    }

    async fn negotiate_offer(link: &mut PeerLink, media: &MediaHandle) -> Result<SessionDescription> {
        link.connection().attach_track(media).await?;
        let offer = link.connection().create_offer().await?;
        link.transition(LinkInput::NegotiationStarted)?;
        Ok(offer)
    }

    /// Mark a connected direct viewer as relay. Link role and promoted set
    /// change together under the state lock.
    async fn promote(&self, state: &mut BroadcasterState, relay: &ParticipantId) {
        let Some(link) = state.links.get_mut(relay) else {
            return;
        };
        link.set_role(LinkRole::Relay);
        state.promoted.insert(relay.clone());
        state.promotions += 1;

        info!(relay_id = %relay, relays = state.promoted.len(), "Promoted viewer to relay");

        let message = SignalingMessage::RelayPromote {
            from: self.id.clone(),
            to: relay.clone(),
        };
        if let Err(e) = self.channel.send(message).await {
            warn!(relay_id = %relay, error = %e, "Failed to notify viewer of promotion");
        }
    }

    async fn send_relay_instruction(&self, viewer: &ParticipantId, relay: &ParticipantId) -> Result<()> {
        self.channel
            .send(SignalingMessage::RelayRequest {
                from: self.id.clone(),
                to: viewer.clone(),
                relay_peer_id: Some(relay.clone()),
            })
            .await
    }

    fn update_capacity(&self, state: &mut BroadcasterState) {
        let direct = TopologyPolicy::direct_count(&state.snapshots());
        let near = self.policy.near_capacity(direct);
        if near && !state.near_capacity {
            warn!(
                broadcaster_id = %self.id,
                direct_links = direct,
                max_direct = self.policy.max_direct_connections(),
                "Direct fan-out is nearing capacity"
            );
        }
        state.near_capacity = near;
    }

    async fn on_answer(&self, viewer: &ParticipantId, answer: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        let connection = match state.links.get(viewer) {
            Some(link) if link.is_connecting() => Arc::clone(link.connection()),
            Some(link) => {
                debug!(viewer_id = %viewer, state = ?link.state(), "Dropping answer for settled link");
                return Ok(());
            }
            None => {
                debug!(viewer_id = %viewer, "Dropping answer with no pending link");
                return Ok(());
            }
        };

        if let Err(e) = connection.set_remote_answer(answer).await {
            warn!(viewer_id = %viewer, error = %e, "Failed to apply answer; dropping link");
            self.discard_link(&mut state, viewer).await;
            return Err(e);
        }
        debug!(viewer_id = %viewer, "Applied answer");
        Ok(())
    }

    async fn on_ice_candidate(&self, viewer: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        let state = self.state.lock().await;
        match state.links.get(viewer) {
            Some(link) if link.is_connecting() => link.connection().add_ice_candidate(candidate).await,
            Some(link) => {
                debug!(viewer_id = %viewer, state = ?link.state(), "Dropping ICE candidate for settled link");
                Ok(())
            }
            None => {
                debug!(viewer_id = %viewer, "Dropping ICE candidate with no link");
                Ok(())
            }
        }
    }

    async fn on_relay_count_report(&self, relay: &ParticipantId, count: u64) -> bool {
        let mut state = self.state.lock().await;
        if !state.promoted.contains(relay) {
            debug!(from = %relay, count, "Ignoring viewer-count from a non-relay");
            return false;
        }
        state.counts.record(relay.clone(), count);
        debug!(relay_id = %relay, count, "Recorded relay viewer count");
        true
    }

    async fn on_viewer_leave(&self, viewer: &ParticipantId) {
        let mut state = self.state.lock().await;
        if state.links.contains_key(viewer) {
            self.discard_link(&mut state, viewer).await;
            info!(viewer_id = %viewer, links = state.links.len(), "Viewer left");
        }
    }

    /// Close and remove a link along with any relay bookkeeping
    async fn discard_link(&self, state: &mut BroadcasterState, viewer: &ParticipantId) {
        if let Some(mut link) = state.links.shift_remove(viewer) {
            link.close().await;
            if state.forget_relay(viewer) {
                info!(relay_id = %viewer, "Relay removed; its sub-tree is no longer counted");
            }
        }
        self.update_capacity(state);
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        let mut state = self.state.lock().await;
        if self.is_stopped() {
            return;
        }

        let Some(link) = state.links.get_mut(&event.remote) else {
            debug!(remote = %event.remote, "Event for unknown link dropped");
            return;
        };
        if link.id() != event.link_id {
            debug!(remote = %event.remote, link_id = %event.link_id, "Stale link event dropped");
            return;
        }

        match event.kind {
            LinkEventKind::StateChanged(transport) => {
                let Some(input) = transport.as_input() else {
                    debug!(remote = %event.remote, transport = ?transport, "Transient transport state");
                    return;
                };
                let transition = match link.transition(input) {
                    Ok(t) => t,
                    Err(e) => {
                        debug!(remote = %event.remote, error = %e, "Ignoring transport report");
                        return;
                    }
                };

                if transition.entered_terminal() {
                    let failed = transition.to == LinkState::Failed;
                    if let Some(link) = state.links.shift_remove(&event.remote) {
                        // Release the transport; the state stays terminal
                        if let Err(e) = link.connection().close().await {
                            debug!(remote = %event.remote, error = %e, "Error releasing connection");
                        }
                    }
                    let was_relay = state.forget_relay(&event.remote);
                    self.update_capacity(&mut state);
                    if failed {
                        warn!(viewer_id = %event.remote, was_relay, "Link failed");
                    } else {
                        info!(viewer_id = %event.remote, was_relay, "Link closed");
                    }
                } else if transition.changed() && transition.to == LinkState::Connected {
                    info!(
                        viewer_id = %event.remote,
                        role = ?link.role(),
                        "Link connected"
                    );
                }
            }
            LinkEventKind::LocalCandidate(candidate) => {
                if link.state().is_terminal() {
                    return;
                }
                let message = SignalingMessage::IceCandidate {
                    from: self.id.clone(),
                    to: event.remote.clone(),
                    data: candidate,
                };
                if let Err(e) = self.channel.send(message).await {
                    debug!(viewer_id = %event.remote, error = %e, "Failed to send ICE candidate");
                }
            }
        }
    }

    async fn publish_viewer_count(&self) -> Option<u64> {
        if self.is_stopped() {
            return None;
        }
        let total = {
            let mut state = self.state.lock().await;
            let total = state.total_viewers();
            state.counts.take_publishable(total)?
        };

        if let Err(e) = self.streams.update_viewer_count(&self.stream_id, total).await {
            warn!(stream_id = %self.stream_id, total, error = %e, "Failed to publish viewer count");
            self.state.lock().await.counts.reset_published();
            return None;
        }
        debug!(stream_id = %self.stream_id, total, "Published viewer count");
        Some(total)
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let media = {
            let mut state = self.state.lock().await;
            let links = state.links.len();
            for (_, mut link) in state.links.drain(..) {
                link.close().await;
            }
            state.promoted.clear();
            state.counts.clear();
            debug!(broadcaster_id = %self.id, links, "Closed all links");
            state.media.take()
        };

        let end = SignalingMessage::StreamEnd {
            from: self.id.clone(),
        };
        if let Err(e) = self.channel.send(end).await {
            warn!(broadcaster_id = %self.id, error = %e, "Failed to announce stream end");
        }
        if let Err(e) = self.channel.leave().await {
            warn!(broadcaster_id = %self.id, error = %e, "Failed to leave signaling channel");
        }
        if let Err(e) = self.streams.end_stream(&self.stream_id).await {
            warn!(stream_id = %self.stream_id, error = %e, "Failed to end stream record");
        }
        if let Some(media) = media {
            self.media_engine.release_media(&media).await;
        }

        info!(broadcaster_id = %self.id, stream_id = %self.stream_id, "Broadcast stopped");
    }
}
