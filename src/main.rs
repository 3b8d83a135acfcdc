use cometd::config::Config;
use cometd::network::{self, limit::ConnLimiter};
use cometd::reactor::ServerCore;
use cometd::telemetry;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path; falls back
/// to `config.toml`.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: failed to load config from {config_path}: {e}");
        e
    })?;

    telemetry::init(config.server.log_format);

    info!(
        server = %config.server.name,
        network = %config.server.network,
        sid = %config.server.sid,
        "starting cometd"
    );

    let listen_addr = config.listen.addr.clone();
    let limiter = Arc::new(Mutex::new(ConnLimiter::new(&config.ratelimit)));

    let (core, events_rx) = ServerCore::new(config);
    let events_tx = core.event_sender();

    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "listening");
    tokio::spawn(network::accept_loop(listener, events_tx, limiter));

    core.run(events_rx).await;
    Ok(())
}
