//! End-to-end mesh scenarios
//!
//! A broadcaster and several viewers run their event loops over the
//! in-process signaling hub and the loopback media network.
//!
//! Run with: cargo test --test mesh_scenarios

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshcast::{
    BroadcastParams, BroadcasterSession, Collaborators, Error, IceCandidate, LinkRole, LinkState,
    LoopbackNetwork, MemorySignalingHub, MemoryStreamStore, MeshConfig, ParticipantId, Result,
    SessionDescription, SignalingTransport, StreamId, Subscription, ViewerParams, ViewerSession,
    ViewerStatus,
};

fn id(s: &str) -> ParticipantId {
    ParticipantId::from(s)
}

fn fast_config(max_direct: usize) -> MeshConfig {
    MeshConfig {
        max_direct_connections: max_direct,
        relay_threshold: max_direct,
        count_report_interval_ms: 30,
        publish_interval_ms: 30,
        join_retry_interval_ms: 60,
        ..MeshConfig::default()
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

struct Mesh {
    network: LoopbackNetwork,
    hub: MemorySignalingHub,
    store: MemoryStreamStore,
    config: MeshConfig,
    broadcaster: BroadcasterSession,
}

impl Mesh {
    async fn start(max_direct: usize) -> Self {
        let network = LoopbackNetwork::new();
        let hub = MemorySignalingHub::new();
        let store = MemoryStreamStore::new();
        let config = fast_config(max_direct);

        let broadcaster = BroadcasterSession::start(
            BroadcastParams::new(id("host"), "scenario").with_config(config.clone()),
            Collaborators {
                media: Arc::new(network.engine("host")),
                signaling: Arc::new(hub.clone()),
                streams: Arc::new(store.clone()),
            },
        )
        .await
        .unwrap();

        Self {
            network,
            hub,
            store,
            config,
            broadcaster,
        }
    }

    async fn viewer(&self, name: &str) -> ViewerSession {
        ViewerSession::join(
            ViewerParams::new(id(name), self.broadcaster.stream_id().clone())
                .with_config(self.config.clone()),
            Arc::new(self.network.engine(name)),
            Arc::new(self.hub.clone()),
        )
        .await
        .unwrap()
    }

    /// Join a viewer and wait until its inbound link is connected
    async fn connected_viewer(&self, name: &str) -> ViewerSession {
        let viewer = self.viewer(name).await;
        let v = viewer.clone();
        eventually(&format!("{name} connected"), move || {
            let v = v.clone();
            async move { v.status().await == ViewerStatus::Connected }
        })
        .await;
        viewer
    }
}

#[tokio::test]
async fn test_joins_up_to_cap_are_all_direct() {
    let mesh = Mesh::start(3).await;
    let viewers = [
        mesh.connected_viewer("a").await,
        mesh.connected_viewer("b").await,
        mesh.connected_viewer("c").await,
    ];

    let links = mesh.broadcaster.links().await;
    assert_eq!(links.len(), 3);
    assert!(links
        .iter()
        .all(|l| l.role == LinkRole::Direct && l.state == LinkState::Connected));
    assert!(mesh.broadcaster.promoted_relays().await.is_empty());

    for viewer in &viewers {
        let upstream = viewer.upstream().await.unwrap();
        assert_eq!(upstream.remote, id("host"));
        assert!(viewer.is_relay().await);
        assert!(!viewer.is_promoted().await);
    }

    let stream_id = mesh.broadcaster.stream_id().clone();
    let store = mesh.store.clone();
    eventually("published count of 3", move || {
        let store = store.clone();
        let stream_id = stream_id.clone();
        async move { store.get(&stream_id).is_some_and(|r| r.viewer_count == 3) }
    })
    .await;

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_join_past_cap_promotes_a_direct_viewer() {
    let mesh = Mesh::start(2).await;
    let a = mesh.connected_viewer("a").await;
    let b = mesh.connected_viewer("b").await;
    let c = mesh.connected_viewer("c").await;

    // C is fed by a promoted viewer, never by the broadcaster
    let upstream = c.upstream().await.unwrap();
    assert_ne!(upstream.remote, id("host"));
    assert_eq!(upstream.role, LinkRole::Relay);
    assert_eq!(upstream.state, LinkState::Connected);

    let promoted = mesh.broadcaster.promoted_relays().await;
    assert_eq!(promoted, vec![upstream.remote.clone()]);

    // No direct link beyond the cap
    let links = mesh.broadcaster.links().await;
    assert_eq!(links.len(), 2);
    assert!(links.iter().all(|l| l.remote != id("c")));
    let relay_links: Vec<_> = links.iter().filter(|l| l.role == LinkRole::Relay).collect();
    assert_eq!(relay_links.len(), 1);
    assert_eq!(relay_links[0].remote, upstream.remote);

    let relay = if upstream.remote == id("a") { &a } else { &b };
    let r = relay.clone();
    eventually("relay notified of promotion", move || {
        let r = r.clone();
        async move { r.is_promoted().await }
    })
    .await;
    assert_eq!(relay.outbound_links().await.len(), 1);

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_promotion_follows_relay_capability() {
    let mesh = Mesh::start(1).await;
    let a = mesh.connected_viewer("a").await;

    // Capable but not needed yet
    assert!(a.is_relay().await);
    assert!(mesh.broadcaster.promoted_relays().await.is_empty());

    let b = mesh.connected_viewer("b").await;
    assert_eq!(mesh.broadcaster.promoted_relays().await, vec![id("a")]);
    assert!(a.is_relay().await);

    // B can relay too, but nobody promoted it
    assert!(b.is_relay().await);
    assert!(!b.is_promoted().await);

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_late_answer_and_candidate_for_connected_link_are_dropped() {
    let mesh = Mesh::start(2).await;
    let a = mesh.connected_viewer("a").await;

    let broadcaster = mesh.broadcaster.clone();
    eventually("broadcaster side connected", move || {
        let broadcaster = broadcaster.clone();
        async move { broadcaster.link_state(&id("a")).await == Some(LinkState::Connected) }
    })
    .await;

    let host_seen = mesh.network.remote_candidates(&id("host"), &id("a"));
    let viewer_seen = mesh.network.remote_candidates(&id("a"), &id("host"));
    let late = IceCandidate {
        candidate: "candidate:late".to_string(),
        sdp_mid: None,
        sdp_mline_index: None,
    };

    mesh.broadcaster
        .on_ice_candidate(&id("a"), late.clone())
        .await
        .unwrap();
    mesh.broadcaster
        .on_answer(&id("a"), SessionDescription::answer("v=0 late"))
        .await
        .unwrap();
    a.on_ice_candidate(&id("host"), late).await.unwrap();

    assert_eq!(mesh.network.remote_candidates(&id("host"), &id("a")), host_seen);
    assert_eq!(mesh.network.remote_candidates(&id("a"), &id("host")), viewer_seen);
    assert_eq!(
        mesh.broadcaster.link_state(&id("a")).await,
        Some(LinkState::Connected)
    );
    assert_eq!(a.upstream().await.unwrap().state, LinkState::Connected);

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_repeated_announcements_yield_one_link() {
    let mesh = Mesh::start(2).await;
    let a = mesh.viewer("a").await;
    a.announce().await.unwrap();
    a.announce().await.unwrap();

    let v = a.clone();
    eventually("a connected", move || {
        let v = v.clone();
        async move { v.status().await == ViewerStatus::Connected }
    })
    .await;

    assert_eq!(mesh.broadcaster.links().await.len(), 1);
    assert_eq!(mesh.network.open_connections_of(&id("host")), 1);
    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_relay_sub_tree_counts_toward_total() {
    let mesh = Mesh::start(1).await;
    let a = mesh.connected_viewer("a").await;
    // B promotes A, which frees the direct slot for C; D reuses A
    let _b = mesh.connected_viewer("b").await;
    let _c = mesh.connected_viewer("c").await;
    let _d = mesh.connected_viewer("d").await;

    assert_eq!(mesh.broadcaster.promoted_relays().await, vec![id("a")]);
    assert_eq!(a.remote_peer_count().await, 2);

    let relay = a.clone();
    eventually("relay reported 3", move || {
        let relay = relay.clone();
        async move { relay.stats().await.last_reported_count == Some(3) }
    })
    .await;

    // One direct viewer plus the relay's sub-tree of three
    let broadcaster = mesh.broadcaster.clone();
    eventually("aggregate of 4", move || {
        let broadcaster = broadcaster.clone();
        async move { broadcaster.total_viewers().await == 4 }
    })
    .await;

    let stats = mesh.broadcaster.stats().await;
    assert_eq!(stats.direct_links, 1);
    assert_eq!(stats.relay_links, 1);
    assert_eq!(stats.promotions, 1);

    // Two connected sub-links report the relay plus both of them
    assert_eq!(a.report_downstream_count().await.unwrap(), Some(3));

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_sub_viewer_leave_decays_count() {
    let mesh = Mesh::start(1).await;
    let a = mesh.connected_viewer("a").await;
    let b = mesh.connected_viewer("b").await;

    let broadcaster = mesh.broadcaster.clone();
    eventually("aggregate of 2", move || {
        let broadcaster = broadcaster.clone();
        async move { broadcaster.total_viewers().await == 2 }
    })
    .await;

    b.leave().await;

    let relay = a.clone();
    eventually("relay dropped its sub-viewer", move || {
        let relay = relay.clone();
        async move { relay.outbound_links().await.is_empty() }
    })
    .await;

    let broadcaster = mesh.broadcaster.clone();
    eventually("aggregate back to 1", move || {
        let broadcaster = broadcaster.clone();
        async move { broadcaster.total_viewers().await == 1 }
    })
    .await;

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_relay_failure_cascades_to_sub_viewers() {
    let mesh = Mesh::start(1).await;
    let a = mesh.connected_viewer("a").await;
    let b = mesh.connected_viewer("b").await;

    mesh.network.fail_link(&id("host"), &id("a"));

    let broadcaster = mesh.broadcaster.clone();
    eventually("broadcaster forgot the relay", move || {
        let broadcaster = broadcaster.clone();
        async move {
            broadcaster.links().await.is_empty() && broadcaster.promoted_relays().await.is_empty()
        }
    })
    .await;

    let sub = b.clone();
    eventually("sub-viewer disconnected", move || {
        let sub = sub.clone();
        async move { sub.status().await == ViewerStatus::Disconnected }
    })
    .await;

    assert_eq!(a.status().await, ViewerStatus::Disconnected);
    assert!(!a.is_relay().await);
    assert!(!a.is_promoted().await);
    assert!(a.outbound_links().await.is_empty());
    assert_eq!(mesh.broadcaster.total_viewers().await, 0);

    // Recovery is a fresh join from the viewer side
    a.rejoin().await.unwrap();
    let v = a.clone();
    eventually("a reconnected", move || {
        let v = v.clone();
        async move { v.status().await == ViewerStatus::Connected }
    })
    .await;

    mesh.broadcaster.stop().await;
}

#[tokio::test]
async fn test_stop_leaves_no_links_anywhere() {
    let mesh = Mesh::start(1).await;
    let a = mesh.connected_viewer("a").await;
    let b = mesh.connected_viewer("b").await;
    let c = mesh.connected_viewer("c").await;
    assert!(mesh.network.open_connections() > 0);

    mesh.broadcaster.stop().await;
    assert!(mesh.broadcaster.links().await.is_empty());

    let network = mesh.network.clone();
    eventually("every connection closed", move || {
        let network = network.clone();
        async move { network.open_connections() == 0 }
    })
    .await;

    for viewer in [&a, &b, &c] {
        let v = viewer.clone();
        eventually("viewer released its links", move || {
            let v = v.clone();
            async move { v.upstream().await.is_none() && v.outbound_links().await.is_empty() }
        })
        .await;
        assert_eq!(viewer.status().await, ViewerStatus::Disconnected);
    }

    let record = mesh.store.get(mesh.broadcaster.stream_id()).unwrap();
    assert!(!record.is_active);
}

#[tokio::test]
async fn test_start_fails_without_capture() {
    let network = LoopbackNetwork::new();
    let store = MemoryStreamStore::new();
    let result = BroadcasterSession::start(
        BroadcastParams::new(id("host"), "no camera"),
        Collaborators {
            media: Arc::new(network.engine_without_capture("host")),
            signaling: Arc::new(MemorySignalingHub::new()),
            streams: Arc::new(store.clone()),
        },
    )
    .await;

    assert!(matches!(result, Err(Error::MediaUnavailable(_))));
    assert!(store.active_streams().is_empty());
}

struct UnreachableTransport;

#[async_trait]
impl SignalingTransport for UnreachableTransport {
    async fn join_channel(
        &self,
        stream_id: &StreamId,
        _participant: &ParticipantId,
    ) -> Result<Subscription> {
        Err(Error::ChannelJoinFailed(format!(
            "{} unreachable",
            stream_id.channel_name()
        )))
    }
}

#[tokio::test]
async fn test_start_fails_when_channel_unreachable() {
    let network = LoopbackNetwork::new();
    let media = network.engine("host");
    let store = MemoryStreamStore::new();

    let result = BroadcasterSession::start(
        BroadcastParams::new(id("host"), "offline"),
        Collaborators {
            media: Arc::new(media.clone()),
            signaling: Arc::new(UnreachableTransport),
            streams: Arc::new(store.clone()),
        },
    )
    .await;

    assert!(matches!(result, Err(Error::ChannelJoinFailed(_))));
    // Everything acquired before the failure was given back
    assert!(media.media_released());
    assert!(store.active_streams().is_empty());
}

#[tokio::test]
async fn test_viewer_join_fails_when_signaling_unavailable() {
    let network = LoopbackNetwork::new();
    let result = ViewerSession::join(
        ViewerParams::new(id("a"), StreamId::from("s1")),
        Arc::new(network.engine("a")),
        Arc::new(UnreachableTransport),
    )
    .await;

    assert!(matches!(result, Err(Error::SignalingUnavailable(_))));
}
