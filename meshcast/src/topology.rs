//! Viewer placement policy
//!
//! Pure decision logic: given the broadcaster's current links, decide
//! whether a joining viewer gets a direct link or is sent to a relay.
//! The broadcaster computes a [`Placement`] against a snapshot and applies
//! it afterwards, so the decision never observes its own mutations.

use serde::{Deserialize, Serialize};

use crate::config::MeshConfig;
use crate::link::{LinkRole, LinkSnapshot, LinkState};
use crate::types::ParticipantId;

/// Outcome of placing one viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "placement", content = "relay", rename_all = "lowercase")]
pub enum Placement {
    /// Open a direct link from the broadcaster
    Direct,
    /// Send the viewer to an already-connected relay
    Reuse(ParticipantId),
    /// Promote this connected direct viewer, then send the viewer to it
    Promote(ParticipantId),
    /// Nobody is eligible yet; the viewer has to announce again
    Deferred,
}

impl Placement {
    /// The relay the viewer will be sent to, if any
    #[must_use]
    pub const fn relay(&self) -> Option<&ParticipantId> {
        match self {
            Self::Reuse(id) | Self::Promote(id) => Some(id),
            Self::Direct | Self::Deferred => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyPolicy {
    max_direct_connections: usize,
    relay_threshold: usize,
}

impl TopologyPolicy {
    #[must_use]
    pub const fn new(max_direct_connections: usize, relay_threshold: usize) -> Self {
        Self {
            max_direct_connections,
            relay_threshold,
        }
    }

    #[must_use]
    pub const fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.max_direct_connections, config.relay_threshold)
    }

    #[must_use]
    pub const fn max_direct_connections(&self) -> usize {
        self.max_direct_connections
    }

    /// Number of direct (non-relay) links, whatever their state
    #[must_use]
    pub fn direct_count(links: &[LinkSnapshot]) -> usize {
        links.iter().filter(|l| l.role == LinkRole::Direct).count()
    }

    /// Whether the direct fan-out has reached the relay threshold
    #[must_use]
    pub const fn near_capacity(&self, direct_count: usize) -> bool {
        direct_count >= self.relay_threshold
    }

    /// Decide where a new viewer goes.
    ///
    /// Below the cap the viewer connects directly. At the cap the first
    /// connected relay is reused; failing that the first connected direct
    /// viewer is promoted. No load metric is consulted.
    #[must_use]
    pub fn place_viewer(&self, links: &[LinkSnapshot]) -> Placement {
        if Self::direct_count(links) < self.max_direct_connections {
            return Placement::Direct;
        }

        let connected = |role: LinkRole| {
            links
                .iter()
                .find(|l| l.role == role && l.state == LinkState::Connected)
                .map(|l| l.remote.clone())
        };

        if let Some(relay) = connected(LinkRole::Relay) {
            return Placement::Reuse(relay);
        }
        if let Some(candidate) = connected(LinkRole::Direct) {
            return Placement::Promote(candidate);
        }
        Placement::Deferred
    }
}
