//! Peer configuration: intervals, ranges and deployment bounds.

use core_packet::PeerId;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ground stations take IDs offset by this constant; satellites use small IDs.
pub const GROUND_STATION_ID_OFFSET: PeerId = 1000;

/// Default base port for the deterministic id-to-address mapping
/// (`port = base_port + id`).
pub const BASE_PORT: u16 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    /// A peer is a neighbor iff its Euclidean distance is within this range.
    pub discovery_range: f64,
    /// Interval between self-position broadcasts.
    pub broadcast_interval: Duration,
    /// Interval between mobility-model position recomputations.
    pub position_update_interval: Duration,
    /// Interval between heartbeats (and neighbor-monitor passes).
    pub heartbeat_interval: Duration,
    /// A neighbor is evicted when its last heartbeat is older than this.
    pub heartbeat_timeout: Duration,
    /// Interval between Berkeley clock-sync rounds.
    pub sync_interval: Duration,
    /// Bound on every outbound transport call.
    pub request_timeout: Duration,
    /// Partial image assemblies idle longer than this are discarded.
    pub image_buffer_ttl: Duration,
    /// Circular-orbit mobility parameters for satellites.
    pub orbit_radius: f64,
    pub orbit_angular_velocity: f64,
    /// Deployment bounds: satellite IDs run `1..=max_satellites`, ground
    /// stations `OFFSET+1..=OFFSET+max_ground_stations`. Position broadcasts
    /// target every one of these addresses.
    pub max_satellites: PeerId,
    pub max_ground_stations: PeerId,
    /// Where reassembled inbound images are persisted.
    pub received_images_dir: PathBuf,
    /// Where synthesized captures are written.
    pub capture_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_range: 10.0,
            broadcast_interval: Duration::from_secs(3),
            position_update_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(7),
            sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            image_buffer_ttl: Duration::from_secs(60),
            orbit_radius: 2.0,
            orbit_angular_velocity: 0.01,
            max_satellites: 10,
            max_ground_stations: 2,
            received_images_dir: PathBuf::from("received_images"),
            capture_dir: PathBuf::from("images"),
        }
    }
}

impl Config {
    /// Every peer ID that may exist in this deployment.
    pub fn deployment_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        (1..=self.max_satellites).chain(
            (1..=self.max_ground_stations).map(|i| GROUND_STATION_ID_OFFSET + i),
        )
    }
}

/// Load the launcher-generated positions file: a JSON map `id -> [x, y, z]`.
pub fn load_positions(path: &Path) -> io::Result<HashMap<PeerId, [f64; 3]>> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
