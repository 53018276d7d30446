//! Viewer session
//!
//! A viewer holds at most one inbound link (from the broadcaster or from a
//! relay). Once that link is connected the viewer may forward the received
//! stream to sub-viewers over outbound relay links, and reports the size of
//! its sub-tree upstream on a fixed interval.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::link::{
    LinkDirection, LinkEvent, LinkEventKind, LinkEventReceiver, LinkEventSender, LinkInput,
    LinkRole, LinkSnapshot, LinkState, PeerLink,
};
use crate::media::{IceCandidate, MediaEngine, SessionDescription};
use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport};
use crate::types::{LinkId, ParticipantId, StreamId};

#[derive(Debug, Clone)]
pub struct ViewerParams {
    pub viewer_id: ParticipantId,
    pub stream_id: StreamId,
    pub config: MeshConfig,
}

impl ViewerParams {
    pub fn new(viewer_id: ParticipantId, stream_id: StreamId) -> Self {
        Self {
            viewer_id,
            stream_id,
            config: MeshConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerStatus {
    /// Announced, waiting for an inbound link
    #[default]
    Joining,
    Connected,
    /// Inbound link lost or the stream ended; no automatic rejoin
    Disconnected,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerStats {
    pub viewer_id: ParticipantId,
    pub status: ViewerStatus,
    pub upstream: Option<LinkSnapshot>,
    pub is_relay: bool,
    pub promoted: bool,
    pub sub_viewers: usize,
    pub connected_sub_viewers: usize,
    pub announcements: u64,
    pub last_reported_count: Option<u64>,
}

#[derive(Default)]
struct ViewerState {
    status: ViewerStatus,
    inbound: Option<PeerLink>,
    /// Set once the inbound link connects; cleared when it is lost
    is_relay: bool,
    promoted: bool,
    broadcaster: Option<ParticipantId>,
    outbound: IndexMap<ParticipantId, PeerLink>,
    /// Relay the broadcaster sent us to, until its offer arrives
    pending_relay: Option<ParticipantId>,
    last_reported: Option<u64>,
    next_link_id: u64,
    announcements: u64,
}

impl ViewerState {
    fn allocate_link_id(&mut self) -> LinkId {
        self.next_link_id += 1;
        LinkId::new(self.next_link_id)
    }

    fn connected_outbound(&self) -> usize {
        self.outbound.values().filter(|l| l.is_connected()).count()
    }

    fn is_upstream(&self, peer: &ParticipantId) -> bool {
        self.inbound.as_ref().is_some_and(|l| l.remote() == peer)
    }
}

struct ViewerInner {
    id: ParticipantId,
    stream_id: StreamId,
    config: MeshConfig,
    media_engine: Arc<dyn MediaEngine>,
    channel: Arc<dyn SignalingChannel>,
    state: Mutex<ViewerState>,
    left: AtomicBool,
    cancel: CancellationToken,
    events_tx: LinkEventSender,
}

/// Handle to a joined viewer. Cloning shares the session.
#[derive(Clone)]
pub struct ViewerSession {
    inner: Arc<ViewerInner>,
    _guard: Arc<DropGuard>,
}

impl ViewerSession {
    /// Join the stream's signaling channel and announce presence
    pub async fn join(
        params: ViewerParams,
        media: Arc<dyn MediaEngine>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Self> {
        let subscription = signaling
            .join_channel(&params.stream_id, &params.viewer_id)
            .await
            .map_err(|e| {
                error!(
                    viewer_id = %params.viewer_id,
                    stream_id = %params.stream_id,
                    error = %e,
                    "Failed to join signaling channel"
                );
                Error::SignalingUnavailable(e.to_string())
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let inner = Arc::new(ViewerInner {
            id: params.viewer_id,
            stream_id: params.stream_id,
            config: params.config,
            media_engine: media,
            channel: subscription.channel,
            state: Mutex::new(ViewerState::default()),
            left: AtomicBool::new(false),
            cancel: cancel.clone(),
            events_tx,
        });

        if let Err(e) = inner.announce().await {
            if let Err(leave_err) = inner.channel.leave().await {
                debug!(error = %leave_err, "Failed to leave channel after failed announce");
            }
            return Err(Error::SignalingUnavailable(e.to_string()));
        }

        tokio::spawn(Arc::clone(&inner).run(subscription.inbox, events_rx));

        info!(viewer_id = %inner.id, stream_id = %inner.stream_id, "Viewer joined stream");

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

    /// Broadcast a viewer-join announcement
    pub async fn announce(&self) -> Result<()> {
        self.inner.announce().await
    }

    /// Start over after the inbound link was lost or the stream ended
    pub async fn rejoin(&self) -> Result<()> {
        self.inner.rejoin().await
    }

    pub async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        self.inner.handle_message(message).await
    }

    pub async fn on_offer(&self, from: &ParticipantId, offer: SessionDescription) -> Result<()> {
        self.inner.accept_offer(from, offer, LinkRole::Direct).await
    }

    pub async fn on_relay_offer(&self, from: &ParticipantId, offer: SessionDescription) -> Result<()> {
        self.inner.on_relay_offer(from, offer).await
    }

    /// The broadcaster told us to connect via `relay`
    pub async fn on_relay_instruction(&self, from: &ParticipantId, relay: &ParticipantId) -> Result<()> {
        self.inner.on_relay_instruction(from, relay).await
    }

    /// A peer asked us to relay the stream. Returns whether an offer was sent.
    pub async fn on_relay_request_from_peer(&self, requester: &ParticipantId) -> Result<bool> {
        self.inner.on_relay_request_from_peer(requester).await
    }

    pub async fn on_relay_answer(&self, from: &ParticipantId, answer: SessionDescription) -> Result<()> {
        self.inner.on_relay_answer(from, answer).await
    }

    pub async fn on_ice_candidate(&self, from: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        self.inner.on_ice_candidate(from, candidate).await
    }

    pub async fn on_promoted(&self, from: &ParticipantId) {
        self.inner.on_promoted(from).await;
    }

    pub async fn on_stream_end(&self, from: &ParticipantId) {
        self.inner.on_stream_end(from).await;
    }

    pub async fn on_peer_leave(&self, peer: &ParticipantId) {
        self.inner.on_peer_leave(peer).await;
    }

    /// Send the sub-tree size upstream. Returns the count sent, if any.
    pub async fn report_downstream_count(&self) -> Result<Option<u64>> {
        self.inner.report_downstream_count().await
    }

    /// Close every link, announce departure and leave the channel. Idempotent.
    pub async fn leave(&self) {
        self.inner.leave().await;
    }

    pub async fn status(&self) -> ViewerStatus {
        self.inner.state.lock().await.status
    }

    /// Whether this viewer can serve as a relay
    pub async fn is_relay(&self) -> bool {
        self.inner.state.lock().await.is_relay
    }

    /// Whether the broadcaster designated this viewer as a relay
    pub async fn is_promoted(&self) -> bool {
        self.inner.state.lock().await.promoted
    }

    pub async fn upstream(&self) -> Option<LinkSnapshot> {
        self.inner.state.lock().await.inbound.as_ref().map(PeerLink::snapshot)
    }

    pub async fn outbound_links(&self) -> Vec<LinkSnapshot> {
        self.inner
            .state
            .lock()
            .await
            .outbound
            .values()
            .map(PeerLink::snapshot)
            .collect()
    }

    /// Number of connected sub-viewers
    pub async fn remote_peer_count(&self) -> usize {
        self.inner.state.lock().await.connected_outbound()
    }

    pub async fn stats(&self) -> ViewerStats {
        let state = self.inner.state.lock().await;
        ViewerStats {
            viewer_id: self.inner.id.clone(),
            status: state.status,
            upstream: state.inbound.as_ref().map(PeerLink::snapshot),
            is_relay: state.is_relay,
            promoted: state.promoted,
            sub_viewers: state.outbound.len(),
            connected_sub_viewers: state.connected_outbound(),
            announcements: state.announcements,
            last_reported_count: state.last_reported,
        }
    }
}

impl ViewerInner {
    fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<SignalingMessage>, mut events: LinkEventReceiver) {
        let report_period = self.config.count_report_interval();
        let retry_period = self.config.join_retry_interval();
        let mut report = tokio::time::interval_at(Instant::now() + report_period, report_period);
        let mut retry = tokio::time::interval_at(Instant::now() + retry_period, retry_period);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(viewer_id = %self.id, "Viewer loop cancelled");
                    break;
                }
                Some(message) = inbox.recv() => {
                    let kind = message.kind();
                    if let Err(e) = self.handle_message(message).await {
                        warn!(viewer_id = %self.id, kind, error = %e, "Failed to handle signaling message");
                    }
                }
                Some(event) = events.recv() => {
                    self.handle_link_event(event).await;
                }
                _ = report.tick() => {
                    if let Err(e) = self.report_downstream_count().await {
                        debug!(viewer_id = %self.id, error = %e, "Failed to report viewer count");
                    }
                }
                _ = retry.tick() => {
                    self.retry_join().await;
                }
            }
        }
    }

    async fn announce(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.channel
            .send(SignalingMessage::ViewerJoin {
                from: self.id.clone(),
            })
            .await?;
        state.announcements += 1;
        Ok(())
    }

    async fn retry_join(&self) {
        let waiting = {
            let mut state = self.state.lock().await;
            let waiting = state.status == ViewerStatus::Joining && state.inbound.is_none();
            if waiting {
                // A fresh announcement supersedes an unanswered relay instruction
                state.pending_relay = None;
            }
            waiting
        };
        if waiting && !self.has_left() {
            debug!(viewer_id = %self.id, "No inbound link yet; announcing again");
            if let Err(e) = self.announce().await {
                warn!(viewer_id = %self.id, error = %e, "Failed to re-announce");
            }
        }
    }

    async fn rejoin(&self) -> Result<()> {
        if self.has_left() {
            return Err(Error::SessionClosed);
        }
        {
            let mut state = self.state.lock().await;
            if state.status != ViewerStatus::Disconnected {
                return Ok(());
            }
            state.status = ViewerStatus::Joining;
        }
        info!(viewer_id = %self.id, "Rejoining stream");
        self.announce().await
    }

    async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        if !message.is_addressed_to(&self.id) {
            return Ok(());
        }

        match message {
            SignalingMessage::Offer { from, data, .. } => {
                self.accept_offer(&from, data, LinkRole::Direct).await
            }
            SignalingMessage::RelayOffer { from, data, .. } => self.on_relay_offer(&from, data).await,
            SignalingMessage::RelayRequest {
                from,
                relay_peer_id: Some(relay),
                ..
            } => self.on_relay_instruction(&from, &relay).await,
            SignalingMessage::RelayRequest {
                from,
                relay_peer_id: None,
                ..
            } => self.on_relay_request_from_peer(&from).await.map(|_| ()),
            SignalingMessage::RelayAnswer { from, data, .. } => {
                self.on_relay_answer(&from, data).await
            }
            SignalingMessage::IceCandidate { from, data, .. } => {
                self.on_ice_candidate(&from, data).await
            }
            SignalingMessage::RelayPromote { from, .. } => {
                self.on_promoted(&from).await;
                Ok(())
            }
            SignalingMessage::StreamEnd { from } => {
                self.on_stream_end(&from).await;
                Ok(())
            }
            SignalingMessage::ViewerLeave { from } => {
                self.on_peer_leave(&from).await;
                Ok(())
            }
            // Addressed to the broadcaster
            SignalingMessage::ViewerJoin { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::ViewerCount { .. } => Ok(()),
        }
    }

    async fn on_relay_offer(&self, from: &ParticipantId, offer: SessionDescription) -> Result<()> {
        {
            let state = self.state.lock().await;
            if let Some(expected) = &state.pending_relay {
                if expected != from {
                    debug!(
                        viewer_id = %self.id,
                        from = %from,
                        expected = %expected,
                        "Relay offer from unexpected peer ignored"
                    );
                    return Ok(());
                }
            }
        }
        self.accept_offer(from, offer, LinkRole::Relay).await
    }

    /// Answer an offer on the inbound link. The first placement wins: later
    /// offers are ignored while an inbound link exists, and a direct offer is
    /// ignored while a relay instruction is outstanding.
    async fn accept_offer(&self, from: &ParticipantId, offer: SessionDescription, role: LinkRole) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.has_left() {
            return Ok(());
        }
        if let Some(inbound) = &state.inbound {
            debug!(
                viewer_id = %self.id,
                from = %from,
                upstream = %inbound.remote(),
                "Already have an inbound link; offer ignored"
            );
            return Ok(());
        }
        if state.outbound.contains_key(from) {
            debug!(viewer_id = %self.id, from = %from, "Offer from own sub-viewer ignored");
            return Ok(());
        }
        if role == LinkRole::Direct {
            if let Some(relay) = &state.pending_relay {
                debug!(
                    viewer_id = %self.id,
                    from = %from,
                    relay = %relay,
                    "Waiting on relay instruction; direct offer ignored"
                );
                return Ok(());
            }
        }

        let link_id = state.allocate_link_id();
        let connection = self
            .media_engine
            .new_connection(from, link_id, self.events_tx.clone())
            .await?;
        let mut link = PeerLink::new(link_id, from.clone(), role, LinkDirection::Inbound, connection);

        let answer = match link.connection().create_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };
        if let Err(e) = link.transition(LinkInput::NegotiationStarted) {
            link.close().await;
            return Err(e);
        }

        state.inbound = Some(link);
        state.pending_relay = None;
        if role == LinkRole::Direct {
            state.broadcaster = Some(from.clone());
        }

        let reply = match role {
            LinkRole::Direct => SignalingMessage::Answer {
                from: self.id.clone(),
                to: from.clone(),
                data: answer,
            },
            LinkRole::Relay => SignalingMessage::RelayAnswer {
                from: self.id.clone(),
                to: from.clone(),
                data: answer,
            },
        };
        if let Err(e) = self.channel.send(reply).await {
            if let Some(mut link) = state.inbound.take() {
                link.close().await;
            }
            return Err(e);
        }

        info!(viewer_id = %self.id, upstream = %from, role = ?role, "Answered inbound offer");
        Ok(())
    }

    async fn on_relay_instruction(&self, from: &ParticipantId, relay: &ParticipantId) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.has_left() {
            return Ok(());
        }
        if state.inbound.is_some() {
            debug!(viewer_id = %self.id, relay = %relay, "Already have an inbound link; relay instruction ignored");
            return Ok(());
        }
        if *relay == self.id {
            warn!(viewer_id = %self.id, "Instructed to relay through self; ignored");
            return Ok(());
        }

        state.broadcaster = Some(from.clone());
        state.pending_relay = Some(relay.clone());
        self.channel
            .send(SignalingMessage::RelayRequest {
                from: self.id.clone(),
                to: relay.clone(),
                relay_peer_id: None,
            })
            .await?;

        info!(viewer_id = %self.id, relay = %relay, "Requested stream from relay");
        Ok(())
    }

    async fn on_relay_request_from_peer(&self, requester: &ParticipantId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if self.has_left() {
            return Ok(false);
        }
        if !state.is_relay {
            debug!(viewer_id = %self.id, requester = %requester, "Not relay-capable; request ignored");
            return Ok(false);
        }
        if *requester == self.id || state.is_upstream(requester) {
            debug!(viewer_id = %self.id, requester = %requester, "Relay request would form a cycle; ignored");
            return Ok(false);
        }
        if state.outbound.contains_key(requester) {
            debug!(viewer_id = %self.id, requester = %requester, "Duplicate relay request ignored");
            return Ok(false);
        }

        let source = state
            .inbound
            .as_ref()
            .filter(|l| l.is_connected())
            .and_then(|l| l.connection().remote_track());
        let Some(source) = source else {
            debug!(viewer_id = %self.id, requester = %requester, "No received stream to relay yet");
            return Ok(false);
        };

        let link_id = state.allocate_link_id();
        let connection = self
            .media_engine
            .new_connection(requester, link_id, self.events_tx.clone())
            .await?;
        let mut link = PeerLink::new(
            link_id,
            requester.clone(),
            LinkRole::Relay,
            LinkDirection::Outbound,
            connection,
        );

        let offer = async {
            link.connection().attach_track(&source).await?;
            let offer = link.connection().create_offer().await?;
            link.transition(LinkInput::NegotiationStarted)?;
            Ok::<_, Error>(offer)
        }
        .await;
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        state.outbound.insert(requester.clone(), link);

        let message = SignalingMessage::RelayOffer {
            from: self.id.clone(),
            to: requester.clone(),
            data: offer,
        };
        if let Err(e) = self.channel.send(message).await {
            if let Some(mut link) = state.outbound.shift_remove(requester) {
                link.close().await;
            }
            return Err(e);
        }

        info!(
            viewer_id = %self.id,
            sub_viewer = %requester,
            sub_viewers = state.outbound.len(),
            "Relaying stream to sub-viewer"
        );
        Ok(true)
    }

    async fn on_relay_answer(&self, from: &ParticipantId, answer: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        let connection = match state.outbound.get(from) {
            Some(link) if link.is_connecting() => Arc::clone(link.connection()),
            _ => {
                debug!(viewer_id = %self.id, from = %from, "Dropping relay answer with no pending link");
                return Ok(());
            }
        };

        if let Err(e) = connection.set_remote_answer(answer).await {
            warn!(viewer_id = %self.id, sub_viewer = %from, error = %e, "Failed to apply relay answer");
            if let Some(mut link) = state.outbound.shift_remove(from) {
                link.close().await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn on_ice_candidate(&self, from: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        let state = self.state.lock().await;
        let link = if state.is_upstream(from) {
            state.inbound.as_ref()
        } else {
            state.outbound.get(from)
        };

        match link {
            Some(link) if link.is_connecting() => link.connection().add_ice_candidate(candidate).await,
            Some(link) => {
                debug!(viewer_id = %self.id, from = %from, state = ?link.state(), "Dropping ICE candidate for settled link");
                Ok(())
            }
            None => {
                debug!(viewer_id = %self.id, from = %from, "Dropping ICE candidate with no link");
                Ok(())
            }
        }
    }

    async fn on_promoted(&self, from: &ParticipantId) {
        let mut state = self.state.lock().await;
        if state.broadcaster.as_ref().is_some_and(|b| b != from) {
            debug!(viewer_id = %self.id, from = %from, "Promotion from a non-broadcaster ignored");
            return;
        }
        state.promoted = true;
        info!(viewer_id = %self.id, is_relay = state.is_relay, "Promoted to relay");
    }

    async fn on_stream_end(&self, from: &ParticipantId) {
        let mut state = self.state.lock().await;
        if state.broadcaster.as_ref().is_some_and(|b| b != from) {
            debug!(viewer_id = %self.id, from = %from, "Stream end from a non-broadcaster ignored");
            return;
        }
        self.drop_upstream(&mut state).await;
        info!(viewer_id = %self.id, "Stream ended");
    }

    async fn on_peer_leave(&self, peer: &ParticipantId) {
        let mut state = self.state.lock().await;
        if let Some(mut link) = state.outbound.shift_remove(peer) {
            link.close().await;
            info!(viewer_id = %self.id, sub_viewer = %peer, "Sub-viewer left");
        } else if state.is_upstream(peer) {
            info!(viewer_id = %self.id, upstream = %peer, "Upstream left");
            self.drop_upstream(&mut state).await;
        }
    }

    /// Close the inbound link and every relay link fed by it
    async fn drop_upstream(&self, state: &mut ViewerState) {
        if let Some(mut inbound) = state.inbound.take() {
            if inbound.state().is_terminal() {
                if let Err(e) = inbound.connection().close().await {
                    debug!(viewer_id = %self.id, error = %e, "Error releasing inbound connection");
                }
            } else {
                inbound.close().await;
            }
        }

        let sub_viewers = state.outbound.len();
        for (_, mut link) in state.outbound.drain(..) {
            link.close().await;
        }

        state.is_relay = false;
        state.promoted = false;
        state.pending_relay = None;
        state.last_reported = None;
        if state.status != ViewerStatus::Left {
            state.status = ViewerStatus::Disconnected;
        }

        if sub_viewers > 0 {
            info!(viewer_id = %self.id, sub_viewers, "Upstream lost; closed relay links");
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        let mut state = self.state.lock().await;
        if self.has_left() {
            return;
        }

        let is_inbound = state
            .inbound
            .as_ref()
            .is_some_and(|l| l.remote() == &event.remote && l.id() == event.link_id);
        let is_outbound = state
            .outbound
            .get(&event.remote)
            .is_some_and(|l| l.id() == event.link_id);
        if !is_inbound && !is_outbound {
            debug!(viewer_id = %self.id, remote = %event.remote, link_id = %event.link_id, "Stale link event dropped");
            return;
        }

        match event.kind {
            LinkEventKind::StateChanged(transport) => {
                let Some(input) = transport.as_input() else {
                    debug!(viewer_id = %self.id, remote = %event.remote, transport = ?transport, "Transient transport state");
                    return;
                };
                if is_inbound {
                    self.apply_inbound(&mut state, input).await;
                } else {
                    self.apply_outbound(&mut state, &event.remote, input).await;
                }
            }
            LinkEventKind::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate {
                    from: self.id.clone(),
                    to: event.remote.clone(),
                    data: candidate,
                };
                if let Err(e) = self.channel.send(message).await {
                    debug!(viewer_id = %self.id, remote = %event.remote, error = %e, "Failed to send ICE candidate");
                }
            }
        }
    }

    async fn apply_inbound(&self, state: &mut ViewerState, input: LinkInput) {
        let Some(inbound) = state.inbound.as_mut() else {
            return;
        };
        let transition = match inbound.transition(input) {
            Ok(t) => t,
            Err(e) => {
                debug!(viewer_id = %self.id, error = %e, "Ignoring transport report");
                return;
            }
        };
        let upstream = inbound.remote().clone();

        if transition.entered_terminal() {
            warn!(viewer_id = %self.id, upstream = %upstream, state = ?transition.to, "Inbound link lost");
            self.drop_upstream(state).await;
        } else if transition.changed() && transition.to == LinkState::Connected {
            state.is_relay = true;
            state.status = ViewerStatus::Connected;
            state.pending_relay = None;
            info!(viewer_id = %self.id, upstream = %upstream, "Receiving stream");
        }
    }

    async fn apply_outbound(&self, state: &mut ViewerState, remote: &ParticipantId, input: LinkInput) {
        let Some(link) = state.outbound.get_mut(remote) else {
            return;
        };
        let transition = match link.transition(input) {
            Ok(t) => t,
            Err(e) => {
                debug!(viewer_id = %self.id, error = %e, "Ignoring transport report");
                return;
            }
        };

        if transition.entered_terminal() {
            if let Some(link) = state.outbound.shift_remove(remote) {
                if let Err(e) = link.connection().close().await {
                    debug!(viewer_id = %self.id, error = %e, "Error releasing relay connection");
                }
            }
            info!(
                viewer_id = %self.id,
                sub_viewer = %remote,
                state = ?transition.to,
                sub_viewers = state.outbound.len(),
                "Relay link ended"
            );
        } else if transition.changed() && transition.to == LinkState::Connected {
            info!(
                viewer_id = %self.id,
                sub_viewer = %remote,
                connected = state.connected_outbound(),
                "Relay link connected"
            );
        }
    }

    async fn report_downstream_count(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;
        if self.has_left() {
            return Ok(None);
        }

        let connected = state.connected_outbound() as u64;
        let count = if connected > 0 {
            1 + connected
        } else if state.last_reported.is_some_and(|c| c > 1) {
            // Last sub-viewer gone: tell the broadcaster once
            1
        } else {
            return Ok(None);
        };

        self.channel
            .send(SignalingMessage::ViewerCount {
                from: self.id.clone(),
                viewer_count: count,
            })
            .await?;
        state.last_reported = Some(count);
        debug!(viewer_id = %self.id, count, "Reported sub-tree size");
        Ok(Some(count))
    }

    async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        {
            let mut state = self.state.lock().await;
            state.status = ViewerStatus::Left;
            self.drop_upstream(&mut state).await;
        }

        let message = SignalingMessage::ViewerLeave {
            from: self.id.clone(),
        };
        if let Err(e) = self.channel.send(message).await {
            warn!(viewer_id = %self.id, error = %e, "Failed to announce departure");
        }
        if let Err(e) = self.channel.leave().await {
            warn!(viewer_id = %self.id, error = %e, "Failed to leave signaling channel");
        }

        info!(viewer_id = %self.id, "Viewer left stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LoopbackNetwork, MemorySignalingHub};
    use crate::signaling::Subscription;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    async fn join(network: &LoopbackNetwork, hub: &MemorySignalingHub, who: &str) -> ViewerSession {
        ViewerSession::join(
            ViewerParams::new(id(who), StreamId::from("s1")),
            Arc::new(network.engine(who)),
            Arc::new(hub.clone()),
        )
        .await
        .unwrap()
    }

    async fn listen(hub: &MemorySignalingHub, who: &str) -> Subscription {
        hub.join_channel(&StreamId::from("s1"), &id(who)).await.unwrap()
    }

    fn drain(sub: &mut Subscription) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = sub.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[tokio::test]
    async fn test_join_announces_presence() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut host = listen(&hub, "host").await;

        let viewer = join(&network, &hub, "a").await;
        assert_eq!(viewer.status().await, ViewerStatus::Joining);
        assert_eq!(
            drain(&mut host),
            vec![SignalingMessage::ViewerJoin { from: id("a") }]
        );
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_first_offer_wins() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut host = listen(&hub, "host").await;
        let viewer = join(&network, &hub, "a").await;
        drain(&mut host);

        viewer
            .on_offer(&id("host"), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        viewer
            .on_relay_offer(&id("r"), SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let upstream = viewer.upstream().await.unwrap();
        assert_eq!(upstream.remote, id("host"));
        assert_eq!(upstream.role, LinkRole::Direct);
        assert_eq!(upstream.state, LinkState::Connecting);
        assert!(drain(&mut host)
            .iter()
            .any(|m| matches!(m, SignalingMessage::Answer { .. })));
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_relay_instruction_beats_later_direct_offer() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut host = listen(&hub, "host").await;
        let mut relay = listen(&hub, "r").await;
        let viewer = join(&network, &hub, "c").await;
        drain(&mut host);

        viewer
            .on_relay_instruction(&id("host"), &id("r"))
            .await
            .unwrap();
        viewer
            .on_offer(&id("host"), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(viewer.upstream().await.is_none());
        assert!(drain(&mut host).is_empty());

        viewer
            .on_relay_offer(&id("r"), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let upstream = viewer.upstream().await.unwrap();
        assert_eq!(upstream.remote, id("r"));
        assert_eq!(upstream.role, LinkRole::Relay);
        assert!(drain(&mut relay)
            .iter()
            .any(|m| matches!(m, SignalingMessage::RelayAnswer { .. })));
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_relay_request_rejected_before_connected() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let viewer = join(&network, &hub, "a").await;

        assert!(!viewer.on_relay_request_from_peer(&id("c")).await.unwrap());
        assert!(viewer.outbound_links().await.is_empty());
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_relay_instruction_sends_request_to_relay() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut relay = listen(&hub, "r").await;
        let viewer = join(&network, &hub, "c").await;
        drain(&mut relay);

        viewer
            .on_relay_instruction(&id("host"), &id("r"))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut relay),
            vec![SignalingMessage::RelayRequest {
                from: id("c"),
                to: id("r"),
                relay_peer_id: None,
            }]
        );

        // Offers from anyone but the named relay are ignored
        viewer
            .on_relay_offer(&id("x"), SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(viewer.upstream().await.is_none());
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_no_report_without_sub_viewers() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let viewer = join(&network, &hub, "a").await;
        assert_eq!(viewer.report_downstream_count().await.unwrap(), None);
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_rejoin_only_after_disconnect() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut host = listen(&hub, "host").await;
        let viewer = join(&network, &hub, "a").await;
        drain(&mut host);

        // Still joining: nothing to do
        viewer.rejoin().await.unwrap();
        assert!(drain(&mut host).is_empty());

        viewer.on_stream_end(&id("host")).await;
        assert_eq!(viewer.status().await, ViewerStatus::Disconnected);

        viewer.rejoin().await.unwrap();
        assert_eq!(viewer.status().await, ViewerStatus::Joining);
        assert_eq!(
            drain(&mut host),
            vec![SignalingMessage::ViewerJoin { from: id("a") }]
        );
        viewer.leave().await;
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let mut host = listen(&hub, "host").await;
        let viewer = join(&network, &hub, "a").await;
        drain(&mut host);

        viewer.leave().await;
        viewer.leave().await;

        assert_eq!(viewer.status().await, ViewerStatus::Left);
        assert_eq!(
            drain(&mut host),
            vec![SignalingMessage::ViewerLeave { from: id("a") }]
        );
        assert!(viewer.rejoin().await.is_err());
    }
}
