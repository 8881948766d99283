use anyhow::{bail, Context, Result};
use core_mesh::config::{self, Config};
use core_mesh::transport::{self, TcpTransport};
use core_mesh::{Peer, Position};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// One peer process: `astro-node <node_id> <x> <y> <z> <type>` where type 0 is
/// a satellite and 1 is a ground station. The node answers on
/// `BIND_HOST:BASE_PORT + node_id`.
fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 5 {
        bail!("usage: astro-node <node_id> <x> <y> <z> <type (0=satellite, 1=ground station)>");
    }
    let node_id: u16 = args[0].parse().context("node_id must be a u16")?;
    let x: f64 = args[1].parse().context("x must be a float")?;
    let y: f64 = args[2].parse().context("y must be a float")?;
    let z: f64 = args[3].parse().context("z must be a float")?;
    let kind: u8 = args[4].parse().context("type must be 0 or 1")?;
    if kind > 1 {
        bail!("type must be 0 (satellite) or 1 (ground station)");
    }

    // Config via env: BIND_HOST=127.0.0.1, BASE_PORT=5000, RUST_LOG=info
    let host = std::env::var("BIND_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let base_port: u16 = match std::env::var("BASE_PORT") {
        Ok(v) => v.parse().context("BASE_PORT must be a u16")?,
        Err(_) => config::BASE_PORT,
    };

    let cfg = Config {
        received_images_dir: format!("received_images_{node_id}").into(),
        ..Config::default()
    };
    let request_timeout = cfg.request_timeout;

    let tcp = TcpTransport::new(host.clone(), base_port, request_timeout);
    let position = Position::new(x, y, z);
    let peer = if kind == 0 {
        Peer::satellite(node_id, position, cfg, Arc::new(tcp))
    } else {
        Peer::ground_station(node_id, position, cfg, Arc::new(tcp))
    };

    info!(
        node_id,
        kind = if kind == 0 { "satellite" } else { "ground station" },
        x,
        y,
        z,
        "peer starting"
    );
    peer.spawn_loops();

    let bind = format!("{}:{}", host, base_port as u32 + node_id as u32);
    async_std::task::block_on(transport::serve(peer, &bind)).context("transport serve failed")
}
