//! PeerLink connection state machine
//!
//! A `PeerLink` wraps one underlying [`PeerConnection`] and records where it
//! is in its lifecycle:
//!
//! ```text
//! new -> connecting -> connected
//!   \         \           \
//!    +---------+-----------+--> failed  (terminal)
//!    +---------+-----------+--> closed  (terminal, explicit teardown)
//! ```
//!
//! Transport callbacks are never applied directly. The transport adapter
//! pushes a [`LinkEvent`] into the owning session's queue; the session maps
//! it to a [`LinkInput`] and calls [`PeerLink::transition`] while holding its
//! own state, so every transition is atomic with the session's bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::media::{IceCandidate, PeerConnection};
use crate::types::{LinkId, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDirection {
    /// From the broadcaster or a relay towards a viewer
    Outbound,
    /// At a viewer, from its upstream
    Inbound,
}

/// Inputs accepted by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkInput {
    /// Offer/answer exchange started
    NegotiationStarted,
    /// Underlying transport reports a stable connection
    TransportConnected,
    /// Transport failure or ICE exhaustion
    TransportFailed,
    /// Explicit teardown, local or remote
    Close,
}

/// Connection state as reported by the peer-connection library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Map a transport report to a state machine input.
    ///
    /// `Disconnected` is transient (the library may recover on its own) and
    /// `New`/`Connecting` carry no information the link does not already have.
    #[must_use]
    pub const fn as_input(self) -> Option<LinkInput> {
        match self {
            Self::Connected => Some(LinkInput::TransportConnected),
            Self::Failed => Some(LinkInput::TransportFailed),
            Self::Closed => Some(LinkInput::Close),
            Self::New | Self::Connecting | Self::Disconnected => None,
        }
    }
}

/// Compute the next state for `input`, or reject the combination.
///
/// Late transport reports against a terminal link are absorbed as no-ops;
/// `failed` stays `failed` even when a close follows it.
pub fn next_state(state: LinkState, input: LinkInput) -> Result<LinkState> {
    use LinkInput as I;
    use LinkState as S;

    match (state, input) {
        (S::New, I::NegotiationStarted) => Ok(S::Connecting),
        (S::Connecting, I::TransportConnected) | (S::Connected, I::TransportConnected) => {
            Ok(S::Connected)
        }
        (S::Failed | S::Closed, I::TransportConnected | I::TransportFailed | I::Close) => Ok(state),
        (_, I::TransportFailed) => Ok(S::Failed),
        (_, I::Close) => Ok(S::Closed),
        (from, input) => Err(Error::InvalidTransition { from, input }),
    }
}

/// Result of applying one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
}

impl Transition {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// True only on the transition that first reaches failed/closed
    #[must_use]
    pub const fn entered_terminal(&self) -> bool {
        !self.from.is_terminal() && self.to.is_terminal()
    }
}

/// Callback produced by a connection, tagged with the link it belongs to
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link_id: LinkId,
    pub remote: ParticipantId,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    StateChanged(TransportState),
    /// Locally gathered ICE candidate to forward to the remote side
    LocalCandidate(IceCandidate),
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Read-only view of a link, used for topology decisions and stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub remote: ParticipantId,
    pub role: LinkRole,
    pub direction: LinkDirection,
    pub state: LinkState,
}

/// One point-to-point media connection to a single remote participant
pub struct PeerLink {
    id: LinkId,
    remote: ParticipantId,
    role: LinkRole,
    direction: LinkDirection,
    state: LinkState,
    connection: Arc<dyn PeerConnection>,
    created_at: DateTime<Utc>,
    last_transition_at: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(
        id: LinkId,
        remote: ParticipantId,
        role: LinkRole,
        direction: LinkDirection,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote,
            role,
            direction,
            state: LinkState::New,
            connection,
            created_at: now,
            last_transition_at: now,
        }
    }

    #[must_use]
    pub const fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub const fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    #[must_use]
    pub const fn role(&self) -> LinkRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: LinkRole) {
        self.role = role;
    }

    #[must_use]
    pub const fn direction(&self) -> LinkDirection {
        self.direction
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.state == LinkState::Connecting
    }

    /// Apply one input to the state machine
    pub fn transition(&mut self, input: LinkInput) -> Result<Transition> {
        let from = self.state;
        let to = next_state(from, input)?;
        if from != to {
            self.state = to;
            self.last_transition_at = Utc::now();
            debug!(
                remote = %self.remote,
                link_id = %self.id,
                from = ?from,
                to = ?to,
                "Link state changed"
            );
        }
        Ok(Transition { from, to })
    }

    /// Fail with the terminal event if the link can no longer be used
    pub fn ensure_open(&self) -> Result<()> {
        match self.state {
            LinkState::Failed => Err(Error::LinkFailed(self.remote.clone())),
            LinkState::Closed => Err(Error::LinkClosed(self.remote.clone())),
            _ => Ok(()),
        }
    }

    /// Tear down the underlying connection and move to `closed`
    pub async fn close(&mut self) -> Transition {
        if let Err(e) = self.connection.close().await {
            warn!(remote = %self.remote, error = %e, "Failed to close peer connection");
        }
        // Close is accepted from every state.
        self.transition(LinkInput::Close).unwrap_or(Transition {
            from: self.state,
            to: self.state,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            remote: self.remote.clone(),
            role: self.role,
            direction: self.direction,
            state: self.state,
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaHandle, SessionDescription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct NullConnection {
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for NullConnection {
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("null"))
        }
        async fn create_answer(&self, _offer: SessionDescription) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("null"))
        }
        async fn set_remote_answer(&self, _answer: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Ok(())
        }
        async fn attach_track(&self, _media: &MediaHandle) -> Result<()> {
            Ok(())
        }
        fn remote_track(&self) -> Option<MediaHandle> {
            None
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn link() -> (PeerLink, Arc<NullConnection>) {
        let conn = Arc::new(NullConnection::default());
        let link = PeerLink::new(
            LinkId::new(1),
            ParticipantId::from("viewer"),
            LinkRole::Direct,
            LinkDirection::Outbound,
            conn.clone(),
        );
        (link, conn)
    }

    #[test]
    fn test_happy_path() {
        let (mut link, _) = link();
        assert_eq!(link.state(), LinkState::New);

        link.transition(LinkInput::NegotiationStarted).unwrap();
        assert!(link.is_connecting());

        let t = link.transition(LinkInput::TransportConnected).unwrap();
        assert!(t.changed());
        assert!(link.is_connected());

        // Repeated connected reports are absorbed
        let t = link.transition(LinkInput::TransportConnected).unwrap();
        assert!(!t.changed());
    }

    #[test]
    fn test_failed_reachable_from_every_open_state() {
        for inputs in [
            vec![],
            vec![LinkInput::NegotiationStarted],
            vec![LinkInput::NegotiationStarted, LinkInput::TransportConnected],
        ] {
            let (mut link, _) = link();
            for input in inputs {
                link.transition(input).unwrap();
            }
            let t = link.transition(LinkInput::TransportFailed).unwrap();
            assert!(t.entered_terminal());
            assert_eq!(link.state(), LinkState::Failed);
        }
    }

    #[test]
    fn test_terminal_states_absorb_late_reports() {
        let (mut link, _) = link();
        link.transition(LinkInput::TransportFailed).unwrap();

        let t = link.transition(LinkInput::TransportConnected).unwrap();
        assert!(!t.changed());
        let t = link.transition(LinkInput::Close).unwrap();
        assert!(!t.entered_terminal());
        assert_eq!(link.state(), LinkState::Failed);
        assert!(matches!(link.ensure_open(), Err(Error::LinkFailed(_))));
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        let (mut link, _) = link();
        assert!(matches!(
            link.transition(LinkInput::TransportConnected),
            Err(Error::InvalidTransition {
                from: LinkState::New,
                ..
            })
        ));

        link.transition(LinkInput::NegotiationStarted).unwrap();
        assert!(link.transition(LinkInput::NegotiationStarted).is_err());

        link.transition(LinkInput::Close).unwrap();
        assert!(link.transition(LinkInput::NegotiationStarted).is_err());
    }

    #[tokio::test]
    async fn test_close_from_any_state() {
        let (mut link, conn) = link();
        link.transition(LinkInput::NegotiationStarted).unwrap();
        link.transition(LinkInput::TransportConnected).unwrap();

        let t = link.close().await;
        assert!(t.entered_terminal());
        assert_eq!(link.state(), LinkState::Closed);
        assert!(conn.closed.load(Ordering::SeqCst));
        assert!(matches!(link.ensure_open(), Err(Error::LinkClosed(_))));
    }

    #[test]
    fn test_transport_state_mapping() {
        assert_eq!(
            TransportState::Connected.as_input(),
            Some(LinkInput::TransportConnected)
        );
        assert_eq!(
            TransportState::Failed.as_input(),
            Some(LinkInput::TransportFailed)
        );
        assert_eq!(TransportState::Closed.as_input(), Some(LinkInput::Close));
        assert_eq!(TransportState::Disconnected.as_input(), None);
    }
}
