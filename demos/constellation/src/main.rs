//! In-process constellation walkthrough: five satellites and one ground
//! station share one process over the in-memory transport. Discovery, routing
//! convergence, message relay and an image downlink run end to end, with the
//! interval clocks scaled down so the whole run takes a few seconds.

use anyhow::Result;
use core_mesh::config::{Config, GROUND_STATION_ID_OFFSET};
use core_mesh::transport::{MemoryTransport, Transport};
use core_mesh::{Peer, Position};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn demo_config(images: &std::path::Path) -> Config {
    Config {
        broadcast_interval: Duration::from_millis(300),
        position_update_interval: Duration::from_millis(1000),
        heartbeat_interval: Duration::from_millis(500),
        heartbeat_timeout: Duration::from_millis(1500),
        sync_interval: Duration::from_millis(500),
        max_satellites: 5,
        max_ground_stations: 1,
        received_images_dir: images.to_path_buf(),
        capture_dir: images.join("captures"),
        ..Config::default()
    }
}

#[async_std::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let workdir = tempfile::tempdir()?;
    let transport = MemoryTransport::new();

    // A chain of satellites 7 units apart (range 10), ground station at the end
    let mut peers = Vec::new();
    for id in 1u16..=5 {
        let dir = workdir.path().join(format!("sat_{id}"));
        let peer = Peer::satellite(
            id,
            Position::new(f64::from(id - 1) * 7.0, 0.0, 0.0),
            demo_config(&dir),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        transport.register(&peer);
        peer.spawn_loops();
        peers.push(peer);
    }
    let station_id = GROUND_STATION_ID_OFFSET + 1;
    let station_dir = workdir.path().join("station");
    let station = Peer::ground_station(
        station_id,
        Position::new(4.0 * 7.0 + 5.0, 0.0, 0.0),
        demo_config(&station_dir),
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    transport.register(&station);
    station.spawn_loops();

    info!("constellation launched; waiting for discovery and route convergence");
    async_std::task::sleep(Duration::from_secs(2)).await;

    for peer in &peers {
        let info = peer.info();
        info!(
            node_id = info.node_id,
            neighbors = info.neighbor_count,
            routes = peer.routing_snapshot().len(),
            "peer state"
        );
    }

    // Multi-hop message from the far end to the ground station
    info!("sending a message from satellite 1 to the ground station");
    peers[0]
        .handle_send(station_id, b"hello from the far side".to_vec())
        .await;
    if let Some(delivery) = station.last_received() {
        info!(
            src = delivery.src,
            ttl = delivery.ttl,
            payload = %String::from_utf8_lossy(&delivery.payload),
            "ground station delivery"
        );
    }

    // Capture an image at satellite 1 and downlink it
    info!("downlinking a captured image from satellite 1");
    let capture = core_packet::image::capture(&workdir.path().join("sat_1_captures"))?;
    peers[0]
        .handle_transmit_image(station_id, &capture.display().to_string())
        .await;
    async_std::task::sleep(Duration::from_millis(500)).await;
    for path in station.received_images() {
        info!(image = %path.display(), "ground station stored image");
    }

    // Fail a mid-chain relay; its neighbors evict it and purge its routes
    info!("failing satellite 3; neighbors evict it after the heartbeat timeout");
    peers[2].handle_fail();
    async_std::task::sleep(Duration::from_secs(3)).await;
    for peer in &peers {
        info!(
            node_id = peer.id(),
            neighbors = peer.neighbors_snapshot().len(),
            routes = peer.routing_snapshot().len(),
            "post-failure state"
        );
    }

    for peer in &peers {
        peer.shutdown();
    }
    station.shutdown();
    Ok(())
}
