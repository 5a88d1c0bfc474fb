//! Headless mesh participant
//!
//! Joins a study room through a signaling relay with synthetic capture
//! tracks, logs mesh notices and periodic state, and leaves on Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Two participants in the same room
//! cargo run --bin mesh_peer -- --room algebra-101 --peer-id alice
//! cargo run --bin mesh_peer -- --room algebra-101 --peer-id bob
//!
//! # Load settings from YAML, override the relay
//! cargo run --bin mesh_peer -- --config mesh.yaml \
//!   --signaling-url ws://relay.local:8080 --room algebra-101
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studysync_mesh::{
    MeshConfig, MeshHandle, MeshSession, SyntheticMediaSource, TurnServerConfig,
    WebRtcConnectionFactory, WebSocketSignalingChannel,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// StudySync mesh peer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Signaling relay base URL
    #[arg(long, default_value = "ws://localhost:8080", env = "STUDYSYNC_SIGNALING_URL")]
    signaling_url: String,

    /// Room to join
    #[arg(long, env = "STUDYSYNC_ROOM")]
    room: String,

    /// YAML configuration file; CLI flags override it
    #[arg(long, env = "STUDYSYNC_MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Local peer ID (random if omitted)
    #[arg(long, env = "STUDYSYNC_PEER_ID")]
    peer_id: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "STUDYSYNC_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Maximum remote peers
    #[arg(long, env = "STUDYSYNC_MAX_PEERS")]
    max_peers: Option<u32>,

    /// Maximum join announcement delay in milliseconds
    #[arg(long)]
    join_jitter_ms: Option<u64>,

    /// Drop peers whose offer stays unanswered this long
    #[arg(long)]
    offer_timeout_secs: Option<u64>,

    /// Do not capture video
    #[arg(long, default_value_t = false)]
    no_video: bool,

    /// Do not capture audio
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// Seconds between mesh state log lines
    #[arg(long, default_value_t = 10)]
    status_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "STUDYSYNC_LOG_JSON")]
    log_json: bool,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        // Password may contain colons
        credential: parts[4..].join(":"),
    })
}

/// Build MeshConfig from the optional file plus CLI overrides
fn build_config(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading mesh config from {}", path.display());
            MeshConfig::from_file(path)?
        }
        None => MeshConfig::default(),
    };

    if args.peer_id.is_some() {
        config.peer_id = args.peer_id.clone();
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    if !args.turn_servers.is_empty() {
        config.turn_servers = args
            .turn_servers
            .iter()
            .map(|s| parse_turn_server(s))
            .collect::<Result<_, _>>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    if let Some(jitter) = args.join_jitter_ms {
        config.join_jitter_max_ms = jitter;
    }
    if args.offer_timeout_secs.is_some() {
        config.offer_timeout_secs = args.offer_timeout_secs;
    }
    if args.no_video {
        config.media.video = false;
    }
    if args.no_audio {
        config.media.audio = false;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = build_config(&args)?;
    // Pin the ID so logs and the session agree
    config.peer_id = Some(config.local_peer_id());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        peer_id = ?config.peer_id,
        room = %args.room,
        signaling_url = %args.signaling_url,
        "StudySync mesh peer starting"
    );

    let channel = WebSocketSignalingChannel::connect(&args.signaling_url, &args.room).await?;
    let factory = WebRtcConnectionFactory::new(&config)?;
    let mesh = MeshSession::start(
        config,
        Arc::new(channel),
        Arc::new(factory),
        Arc::new(SyntheticMediaSource::new()),
    )
    .await?;

    if let Some(error) = mesh.media_error() {
        warn!("Joining without local media: {}", error);
    }

    let mut notices = mesh.notices();
    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval_secs.max(1)));

    info!("Joined. Press Ctrl+C to leave.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, leaving room...");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => info!(?notice, "Mesh notice"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} notices", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = status.tick() => log_status(&mesh),
            _ = mesh.left() => {
                warn!("Session ended");
                break;
            }
        }
    }

    mesh.leave().await?;
    mesh.left().await;
    info!("Left room {}", args.room);
    Ok(())
}

fn log_status(mesh: &MeshHandle) {
    let snapshot = mesh.snapshot();
    info!(
        phase = ?snapshot.phase,
        peers = snapshot.peers.len(),
        video = snapshot.video_enabled,
        audio = snapshot.audio_enabled,
        screen_sharing = snapshot.screen_sharing,
        "Mesh status"
    );
    for peer in &snapshot.peers {
        info!(
            peer_id = %peer.peer_id,
            negotiation = ?peer.negotiation,
            connection = ?peer.connection,
            remote_tracks = peer.remote_stream.as_ref().map_or(0, |s| s.tracks.len()),
            "Peer"
        );
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
