//! Room-scoped WebSocket signaling relay
//!
//! Every text frame a client sends to `/rooms/{room_id}` is forwarded to
//! every client connected to the same room, the sender included.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin signaling_relay -- --listen 0.0.0.0:8080
//!
//! # JSON logs, verbose relay tracing
//! RUST_LOG=studysync_mesh=debug cargo run --bin signaling_relay -- --log-json
//! ```

use clap::Parser;
use studysync_mesh::SignalingRelay;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// StudySync signaling relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "STUDYSYNC_RELAY_ADDR")]
    listen: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "STUDYSYNC_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let relay = SignalingRelay::bind(&args.listen).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %relay.local_addr()?,
        "Signaling relay listening"
    );

    relay
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, stopping relay...");
        })
        .await?;

    info!("Signaling relay stopped");
    Ok(())
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
