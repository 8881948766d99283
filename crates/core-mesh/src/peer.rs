//! The peer: one satellite node or ground station.
//!
//! A `Peer` owns every component and is shared behind `Arc` between the
//! background loops and inbound request handlers, so several peers can run in
//! one process (tests, demos). No handler holds a lock across an await;
//! iteration over neighbors always works on a snapshot.
//!
//! State is `ACTIVE` or `FAILED`. A failed peer answers inbound requests with
//! a structured offline response and its loops no-op until `recover`.

use crate::clock::{self, ClockService};
use crate::config::Config;
use crate::engine::{Delivery, ForwardOutcome, PacketEngine};
use crate::keys::KeyAgent;
use crate::neighbors::{NeighborEntry, NeighborTable};
use crate::position::{CircularOrbit, Fixed, Mobility, Position, PositionService};
use crate::transport::{Request, Response, Transport};
use core_packet::{MsgType, PeerId};
use core_routing::{Route, RoutingTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Satellite,
    GroundStation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Active,
    Failed,
}

/// Read-only snapshot returned by the info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: PeerId,
    pub kind: PeerKind,
    pub state: NodeState,
    pub position: Position,
    pub sequence_number: u32,
    pub neighbor_count: usize,
    pub session_key_count: usize,
}

pub struct Peer {
    id: PeerId,
    kind: PeerKind,
    cfg: Config,
    state: RwLock<NodeState>,
    running: AtomicBool,
    position: PositionService,
    neighbors: Arc<NeighborTable>,
    routing: Arc<Mutex<RoutingTable>>,
    keys: Arc<KeyAgent>,
    clock: ClockService,
    engine: PacketEngine,
    transport: Arc<dyn Transport>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        kind: PeerKind,
        initial: Position,
        model: Box<dyn Mobility>,
        cfg: Config,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let neighbors = Arc::new(NeighborTable::new());
        let routing = Arc::new(Mutex::new(RoutingTable::new(id)));
        let keys = Arc::new(KeyAgent::new());
        let engine = PacketEngine::new(
            id,
            cfg.clone(),
            Arc::clone(&keys),
            Arc::clone(&neighbors),
            Arc::clone(&routing),
            Arc::clone(&transport),
        );
        Arc::new(Self {
            id,
            kind,
            cfg,
            state: RwLock::new(NodeState::Active),
            running: AtomicBool::new(true),
            position: PositionService::new(initial, model),
            neighbors,
            routing,
            keys,
            clock: ClockService::new(id),
            engine,
            transport,
        })
    }

    /// A satellite circles its launch position per the configured orbit.
    pub fn satellite(
        id: PeerId,
        initial: Position,
        cfg: Config,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let orbit = CircularOrbit {
            center_x: initial.x,
            center_y: initial.y,
            radius: cfg.orbit_radius,
            angular_velocity: cfg.orbit_angular_velocity,
            altitude: initial.z,
        };
        Self::new(id, PeerKind::Satellite, initial, Box::new(orbit), cfg, transport)
    }

    /// Ground stations never move.
    pub fn ground_station(
        id: PeerId,
        initial: Position,
        cfg: Config,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::new(
            id,
            PeerKind::GroundStation,
            initial,
            Box::new(Fixed(initial)),
            cfg,
            transport,
        )
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.state() == NodeState::Active
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> Position {
        self.position.current()
    }

    pub fn clock(&self) -> &ClockService {
        &self.clock
    }

    pub fn neighbors_snapshot(&self) -> HashMap<PeerId, NeighborEntry> {
        self.neighbors.snapshot()
    }

    pub fn routing_snapshot(&self) -> HashMap<PeerId, Route> {
        self.routing.lock().unwrap().snapshot()
    }

    /// Drop one route, forcing the flood fallback for that destination.
    pub fn clear_route(&self, dst: PeerId) -> bool {
        self.routing.lock().unwrap().clear_route(dst)
    }

    pub fn has_session_key(&self, peer: PeerId) -> bool {
        self.keys.has_key(peer)
    }

    pub fn last_received(&self) -> Option<Delivery> {
        self.engine.last_received()
    }

    pub fn received_images(&self) -> Vec<std::path::PathBuf> {
        self.engine.received_images()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.id,
            kind: self.kind,
            state: self.state(),
            position: self.position(),
            sequence_number: self.engine.sequence_number(),
            neighbor_count: self.neighbors.len(),
            session_key_count: self.keys.key_count(),
        }
    }

    // ------------------------------------------------------------------
    // Inbound handlers (dispatched by the Router)
    // ------------------------------------------------------------------

    pub async fn handle_receive(&self, from: PeerId, bytes: &[u8]) -> Response {
        if !self.is_active() {
            log::warn!("general: node {}: offline; ignoring inbound packet", self.id);
            return Response::Offline;
        }
        match self.engine.receive(from, bytes).await {
            Ok(_) => Response::Ok,
            Err(e) => {
                log::error!(
                    "general: node {}: inbound packet from {} dropped: {}",
                    self.id,
                    from,
                    e
                );
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Store the sender's public key, derive the session key and reply
    /// in-kind so the initiator can derive too.
    pub fn handle_exchange_key(&self, id: PeerId, public_key: &str) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        match self.keys.accept(id, public_key) {
            Ok(()) => {
                log::info!("general: node {}: key exchange completed with {}", self.id, id);
                Response::KeyExchange {
                    id: self.id,
                    public_key: self.keys.public_key_b64(),
                }
            }
            Err(e) => {
                log::error!("general: node {}: key exchange with {} failed: {}", self.id, id, e);
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Neighbor admission. In-range reports upsert the neighbor, refresh the
    /// direct route and trigger key exchange; out-of-range reports never
    /// evict (eviction is heartbeat-driven).
    pub async fn handle_update_position(&self, id: PeerId, position: Position) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        if id == self.id {
            return Response::Ok;
        }
        let distance = self.position().distance(&position);
        if distance > self.cfg.discovery_range {
            log::debug!(
                "general: node {}: peer {} out of range at {:.2}",
                self.id,
                id,
                distance
            );
            return Response::Ok;
        }
        if self.neighbors.upsert(id, position, distance, clock::wall_now()) {
            log::info!(
                "general: node {}: added neighbor {} at distance {:.2}",
                self.id,
                id,
                distance
            );
        }
        let changed = { self.routing.lock().unwrap().set_direct(id, distance) };
        if !self.keys.has_key(id) {
            self.engine.ensure_session_key(id).await;
        }
        if changed {
            self.advertise().await;
        }
        Response::Ok
    }

    pub fn handle_heartbeat(&self, id: PeerId, ts: f64) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        if self.neighbors.record_heartbeat(id, ts) {
            log::debug!("general: node {}: heartbeat from {}", self.id, id);
        } else {
            log::debug!("general: node {}: heartbeat from non-neighbor {}", self.id, id);
        }
        Response::Ok
    }

    /// Merge a neighbor's advertised routing table, propagating on change.
    /// Advertisements from unknown peers are ignored with a warning.
    pub async fn handle_routing_table(
        &self,
        sender_id: PeerId,
        table: &HashMap<PeerId, Route>,
    ) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        let Some(sender_cost) = self.neighbors.distance_to(sender_id) else {
            log::warn!(
                "routing: node {}: advertisement from non-neighbor {}; ignored",
                self.id,
                sender_id
            );
            return Response::Ok;
        };
        let changed = {
            self.routing
                .lock()
                .unwrap()
                .merge(sender_id, sender_cost, table)
        };
        if changed {
            self.advertise().await;
        }
        Response::Ok
    }

    pub fn handle_synchronize_time(&self, times: &HashMap<PeerId, f64>) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        Response::Adjustment {
            adjustment: self.clock.synchronize(times),
        }
    }

    pub fn handle_get_local_time(&self) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        Response::LocalTime {
            time: self.clock.local_time(),
        }
    }

    pub fn handle_get_neighbors(&self) -> Response {
        Response::Neighbors {
            neighbors: self.neighbors_snapshot(),
        }
    }

    pub fn handle_get_routing_table(&self) -> Response {
        Response::RoutingTable {
            table: self.routing_snapshot(),
        }
    }

    pub fn handle_get_info(&self) -> Response {
        Response::Info { info: self.info() }
    }

    pub fn handle_get_last_received(&self) -> Response {
        Response::LastReceived {
            delivery: self.last_received(),
        }
    }

    pub fn handle_get_received_images(&self) -> Response {
        Response::ReceivedImages {
            paths: self
                .received_images()
                .into_iter()
                .map(|p| p.display().to_string())
                .collect(),
        }
    }

    pub fn handle_capture_image(&self) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        match core_packet::image::capture(&self.cfg.capture_dir) {
            Ok(path) => Response::ImageCaptured {
                path: path.display().to_string(),
            },
            Err(e) => {
                log::error!("general: node {}: image capture failed: {}", self.id, e);
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn handle_transmit_image(&self, dst: PeerId, path: &str) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        match self.engine.transmit_image(dst, Path::new(path)).await {
            Ok(chunks) => {
                log::info!(
                    "general: node {}: image {} sent to {} as {} chunks",
                    self.id,
                    path,
                    dst,
                    chunks
                );
                Response::Ok
            }
            Err(e) => {
                log::error!(
                    "general: node {}: image transmission to {} failed: {}",
                    self.id,
                    dst,
                    e
                );
                Response::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn handle_send(&self, dst: PeerId, payload: Vec<u8>) -> Response {
        if !self.is_active() {
            return Response::Offline;
        }
        match self.engine.send(dst, payload, MsgType::Data).await {
            ForwardOutcome::Dropped(reason) => Response::Error {
                message: format!("packet dropped: {reason}"),
            },
            _ => Response::Ok,
        }
    }

    pub fn handle_fail(&self) -> Response {
        *self.state.write().unwrap() = NodeState::Failed;
        log::warn!("general: node {}: state is now FAILED", self.id);
        Response::Ok
    }

    pub fn handle_recover(&self) -> Response {
        *self.state.write().unwrap() = NodeState::Active;
        log::info!("general: node {}: state is now ACTIVE", self.id);
        Response::Ok
    }

    // ------------------------------------------------------------------
    // Outbound operations (driven by the background loops)
    // ------------------------------------------------------------------

    /// Broadcast our position to every possible deployment address. Failures
    /// are expected (most addresses have no peer) and skipped.
    pub async fn broadcast_position(&self) {
        let position = self.position();
        let request = Request::UpdatePosition {
            id: self.id,
            position,
        };
        for target in self.cfg.deployment_ids().collect::<Vec<_>>() {
            if target == self.id {
                continue;
            }
            if let Err(e) = self.transport.call(target, request.clone()).await {
                log::debug!(
                    "general: node {}: position broadcast to {} failed: {}",
                    self.id,
                    target,
                    e
                );
            }
        }
    }

    /// Send one heartbeat to each current neighbor (snapshot first).
    pub async fn send_heartbeats(&self) {
        let ts = clock::wall_now();
        for neighbor in self.neighbors.ids() {
            let request = Request::Heartbeat { id: self.id, ts };
            if let Err(e) = self.transport.call(neighbor, request).await {
                log::warn!(
                    "general: node {}: heartbeat to {} failed: {}",
                    self.id,
                    neighbor,
                    e
                );
            }
        }
    }

    /// Send the full routing table to every neighbor.
    pub async fn advertise(&self) {
        let table = self.routing_snapshot();
        for neighbor in self.neighbors.ids() {
            let request = Request::ReceiveRoutingTable {
                sender_id: self.id,
                table: table.clone(),
            };
            if let Err(e) = self.transport.call(neighbor, request).await {
                log::warn!(
                    "routing: node {}: advertisement to {} failed: {}",
                    self.id,
                    neighbor,
                    e
                );
            }
        }
    }

    /// One Berkeley round: gather neighbor local times (non-responders are
    /// skipped) and average. Returns the applied adjustment.
    pub async fn run_clock_sync(&self) -> f64 {
        let mut times = HashMap::new();
        for neighbor in self.neighbors.ids() {
            match self.transport.call(neighbor, Request::GetLocalTime).await {
                Ok(Response::LocalTime { time }) => {
                    times.insert(neighbor, time);
                }
                Ok(Response::Offline) => {
                    log::debug!(
                        "general: node {}: neighbor {} offline during clock sync",
                        self.id,
                        neighbor
                    );
                }
                Ok(other) => {
                    log::warn!(
                        "general: node {}: unexpected local-time reply from {}: {:?}",
                        self.id,
                        neighbor,
                        other
                    );
                }
                Err(e) => {
                    log::warn!(
                        "general: node {}: time fetch from {} failed: {}",
                        self.id,
                        neighbor,
                        e
                    );
                }
            }
        }
        self.clock.synchronize(&times)
    }

    /// Evict neighbors whose last heartbeat is older than the timeout and
    /// purge every route through them. `now` is the monitor's clock.
    pub fn evict_stale_neighbors(&self, now: f64) -> Vec<PeerId> {
        let evicted = self
            .neighbors
            .evict_stale(now, self.cfg.heartbeat_timeout.as_secs_f64());
        if !evicted.is_empty() {
            let mut routing = self.routing.lock().unwrap();
            for &neighbor in &evicted {
                let dropped = routing.purge_next_hop(neighbor);
                log::warn!(
                    "routing: node {}: neighbor {} unreachable; purged {} routes",
                    self.id,
                    neighbor,
                    dropped.len()
                );
            }
        }
        evicted
    }

    /// Recompute our own position from the mobility model.
    pub fn update_own_position(&self, t: f64) {
        let p = self.position.advance(t);
        log::debug!(
            "general: node {}: position now ({:.2}, {:.2}, {:.2})",
            self.id,
            p.x,
            p.y,
            p.z
        );
    }

    /// Stop every background loop at its next iteration boundary.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawn the background loops: position broadcast, mobility update,
    /// heartbeat, neighbor monitor (which also prunes stale image buffers)
    /// and clock sync. Loops keep running while FAILED but skip their work.
    pub fn spawn_loops(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        async_std::task::spawn(async move {
            while peer.is_running() {
                if peer.is_active() {
                    peer.broadcast_position().await;
                }
                async_std::task::sleep(peer.cfg.broadcast_interval).await;
            }
        });

        let peer = Arc::clone(self);
        async_std::task::spawn(async move {
            while peer.is_running() {
                if peer.is_active() {
                    peer.update_own_position(clock::wall_now());
                }
                async_std::task::sleep(peer.cfg.position_update_interval).await;
            }
        });

        let peer = Arc::clone(self);
        async_std::task::spawn(async move {
            while peer.is_running() {
                if peer.is_active() {
                    peer.send_heartbeats().await;
                }
                async_std::task::sleep(peer.cfg.heartbeat_interval).await;
            }
        });

        let peer = Arc::clone(self);
        async_std::task::spawn(async move {
            while peer.is_running() {
                if peer.is_active() {
                    peer.evict_stale_neighbors(clock::wall_now());
                    peer.engine.prune_assemblies();
                }
                async_std::task::sleep(peer.cfg.heartbeat_interval).await;
            }
        });

        let peer = Arc::clone(self);
        async_std::task::spawn(async move {
            while peer.is_running() {
                if peer.is_active() {
                    peer.run_clock_sync().await;
                }
                async_std::task::sleep(peer.cfg.sync_interval).await;
            }
        });
    }
}
