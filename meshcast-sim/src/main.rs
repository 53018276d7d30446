use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use meshcast::{
    init_logging, BroadcastParams, BroadcasterSession, Collaborators, LoopbackNetwork,
    MemorySignalingHub, MemoryStreamStore, MeshConfig, ParticipantId, ViewerParams, ViewerSession,
};

#[derive(Parser, Debug)]
#[command(name = "meshcast-sim")]
#[command(about = "Run a broadcaster and viewers over an in-process mesh", long_about = None)]
struct Args {
    /// Configuration file (TOML/YAML/JSON)
    #[arg(long, env = "MESHCAST_CONFIG")]
    config: Option<String>,

    /// Number of viewers to join
    #[arg(long, default_value = "12")]
    viewers: usize,

    /// Override the direct connection cap from the configuration
    #[arg(long)]
    max_direct: Option<usize>,

    /// Time given to the mesh to settle after each step
    #[arg(long, default_value = "200")]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = MeshConfig::load(args.config.as_deref())?;
    if let Some(max_direct) = args.max_direct {
        config.max_direct_connections = max_direct;
        config.relay_threshold = config.relay_threshold.min(max_direct);
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    init_logging(&config.logging)?;
    info!(
        viewers = args.viewers,
        max_direct = config.max_direct_connections,
        "meshcast simulation starting"
    );

    let settle = Duration::from_millis(args.settle_ms);
    let network = LoopbackNetwork::new();
    let hub = MemorySignalingHub::new();
    let store = MemoryStreamStore::new();

    let broadcaster = BroadcasterSession::start(
        BroadcastParams::new(ParticipantId::new("broadcaster"), "Simulated broadcast")
            .with_config(config.clone()),
        Collaborators {
            media: Arc::new(network.engine("broadcaster")),
            signaling: Arc::new(hub.clone()),
            streams: Arc::new(store.clone()),
        },
    )
    .await?;

    let mut viewers = Vec::with_capacity(args.viewers);
    for i in 1..=args.viewers {
        let viewer_id = ParticipantId::new(format!("viewer-{i}"));
        let viewer = ViewerSession::join(
            ViewerParams::new(viewer_id.clone(), broadcaster.stream_id().clone())
                .with_config(config.clone()),
            Arc::new(network.engine(viewer_id.as_str())),
            Arc::new(hub.clone()),
        )
        .await?;
        viewers.push(viewer);
        // Joining one at a time keeps placement readable in the output
        tokio::time::sleep(settle).await;
    }

    // Let relays report and the broadcaster publish
    tokio::time::sleep(config.count_report_interval().max(config.publish_interval()) + settle).await;

    let mut viewer_stats = Vec::with_capacity(viewers.len());
    for viewer in &viewers {
        viewer_stats.push(viewer.stats().await);
    }
    let record = store.get(broadcaster.stream_id());
    let report = serde_json::json!({
        "broadcaster": broadcaster.stats().await,
        "links": broadcaster.links().await,
        "viewers": viewer_stats,
        "stream": record,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    broadcaster.stop().await;
    tokio::time::sleep(settle).await;
    for viewer in &viewers {
        viewer.leave().await;
    }
    tokio::time::sleep(settle).await;

    let open = network.open_connections();
    if open > 0 {
        error!(open, "Connections still open after teardown");
        return Err(anyhow::anyhow!("{open} connection(s) left open after teardown"));
    }
    if hub.member_count(broadcaster.stream_id()) > 0 {
        warn!("Signaling channel still has members after teardown");
    }

    info!("Simulation finished; all links closed");
    Ok(())
}
