//! Packet forwarding engine.
//!
//! The forward path decides, for one packet, whether to deliver locally,
//! relay to the routed next hop, or flood to every neighbor when no route
//! exists. Payloads are encrypted hop by hop: the engine decrypts inbound
//! bytes with the previous hop's session key and re-encrypts under the next
//! hop's key before transmission. The header travels in cleartext.
//!
//! Delivery states for one packet:
//!
//! ```text
//! Sent -> Forwarded* -> Delivered | Flooded | Dropped(TTL | NoKey | ParseError)
//! ```
//!
//! Image payloads (`msg_type = 2`) are reassembled only at their destination;
//! relays treat chunks like any other packet.

use crate::clock;
use crate::config::Config;
use crate::keys::{KeyAgent, KeyError};
use crate::neighbors::NeighborTable;
use crate::transport::{Request, Transport};
use core_packet::{chunk, zlib, MsgType, Packet, PacketError, PeerId};
use core_routing::RoutingTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("image file error: {0}")]
    Image(#[from] std::io::Error),
}

/// Where a packet ended up after one pass through the forward path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    DeliveredLocal,
    Forwarded(PeerId),
    Flooded(usize),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TtlExpired,
    NoSessionKey(PeerId),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::TtlExpired => write!(f, "TTL expired"),
            DropReason::NoSessionKey(peer) => write!(f, "no session key with peer {peer}"),
        }
    }
}

/// A locally delivered payload, exposed through the last-received query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub src: PeerId,
    pub msg_type: u8,
    pub seq: u32,
    pub ttl: u32,
    pub payload: Vec<u8>,
}

struct Assembly {
    total: u32,
    chunks: HashMap<u32, Vec<u8>>,
    last_chunk_at: Instant,
}

pub struct PacketEngine {
    node_id: PeerId,
    cfg: Config,
    keys: Arc<KeyAgent>,
    neighbors: Arc<NeighborTable>,
    routing: Arc<Mutex<RoutingTable>>,
    transport: Arc<dyn Transport>,
    seq: AtomicU32,
    last_received: Mutex<Option<Delivery>>,
    assemblies: Mutex<HashMap<PeerId, Assembly>>,
}

impl PacketEngine {
    pub fn new(
        node_id: PeerId,
        cfg: Config,
        keys: Arc<KeyAgent>,
        neighbors: Arc<NeighborTable>,
        routing: Arc<Mutex<RoutingTable>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node_id,
            cfg,
            keys,
            neighbors,
            routing,
            transport,
            seq: AtomicU32::new(0),
            last_received: Mutex::new(None),
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn sequence_number(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn last_received(&self) -> Option<Delivery> {
        self.last_received.lock().unwrap().clone()
    }

    /// Source send path: build a packet and run it through the forward path.
    pub async fn send(&self, dst: PeerId, payload: Vec<u8>, msg_type: MsgType) -> ForwardOutcome {
        let packet = Packet::new(msg_type, self.node_id, dst, self.next_seq(), payload);
        self.forward(packet).await
    }

    /// Forward path. The payload must be plaintext; encryption to the chosen
    /// hop happens here.
    pub async fn forward(&self, mut packet: Packet) -> ForwardOutcome {
        if packet.dst == self.node_id {
            self.deliver_local(&packet);
            return ForwardOutcome::DeliveredLocal;
        }
        if packet.decrement_ttl() == 0 {
            log::warn!(
                "general: node {}: dropping packet seq {} for {}: TTL expired",
                self.node_id,
                packet.seq,
                packet.dst
            );
            return ForwardOutcome::Dropped(DropReason::TtlExpired);
        }

        let next_hop = { self.routing.lock().unwrap().next_hop(packet.dst) };
        match next_hop {
            Some(hop) => {
                if !self.ensure_session_key(hop).await {
                    log::error!(
                        "general: node {}: cannot forward to {}: no session key after exchange",
                        self.node_id,
                        hop
                    );
                    return ForwardOutcome::Dropped(DropReason::NoSessionKey(hop));
                }
                log::info!(
                    "routing: node {}: forwarding seq {} for {} via {}",
                    self.node_id,
                    packet.seq,
                    packet.dst,
                    hop
                );
                self.send_to_hop(hop, &packet).await;
                ForwardOutcome::Forwarded(hop)
            }
            None => {
                let targets = self.neighbors.ids();
                log::info!(
                    "routing: node {}: no route to {}; flooding seq {} to {} neighbors",
                    self.node_id,
                    packet.dst,
                    packet.seq,
                    targets.len()
                );
                let mut reached = 0usize;
                for hop in targets {
                    if !self.ensure_session_key(hop).await {
                        log::warn!(
                            "general: node {}: skipping flood target {}: no session key",
                            self.node_id,
                            hop
                        );
                        continue;
                    }
                    if self.send_to_hop(hop, &packet).await {
                        reached += 1;
                    }
                }
                ForwardOutcome::Flooded(reached)
            }
        }
    }

    /// Make sure a session key with `peer` exists, initiating a key exchange
    /// once if needed. The exchange endpoint replies in-kind with the peer's
    /// public key, which completes our half of the derivation.
    pub async fn ensure_session_key(&self, peer: PeerId) -> bool {
        if self.keys.has_key(peer) {
            return true;
        }
        log::info!(
            "general: node {}: no session key with {}; initiating exchange",
            self.node_id,
            peer
        );
        let request = Request::ExchangeKey {
            id: self.node_id,
            public_key: self.keys.public_key_b64(),
        };
        match self.transport.call(peer, request).await {
            Ok(crate::transport::Response::KeyExchange { id, public_key }) => {
                if let Err(e) = self.keys.accept(id, &public_key) {
                    log::error!("general: node {}: key exchange with {} failed: {}", self.node_id, peer, e);
                }
            }
            Ok(other) => {
                log::warn!(
                    "general: node {}: unexpected exchange reply from {}: {:?}",
                    self.node_id,
                    peer,
                    other
                );
            }
            Err(e) => {
                log::warn!(
                    "general: node {}: key exchange request to {} failed: {}",
                    self.node_id,
                    peer,
                    e
                );
            }
        }
        self.keys.has_key(peer)
    }

    /// Encrypt the payload under the hop key and transmit. Transport failures
    /// are logged and swallowed; loops must keep running.
    async fn send_to_hop(&self, hop: PeerId, packet: &Packet) -> bool {
        let ciphertext = match self.keys.encrypt(hop, &packet.payload) {
            Ok(ct) => ct,
            Err(e) => {
                log::error!("general: node {}: encrypt to {} failed: {}", self.node_id, hop, e);
                return false;
            }
        };
        let mut wire = packet.clone();
        wire.payload = ciphertext;
        let request = Request::Receive {
            from: self.node_id,
            bytes: wire.to_bytes().to_vec(),
        };
        match self.transport.call(hop, request).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("general: node {}: send to {} failed: {}", self.node_id, hop, e);
                false
            }
        }
    }

    /// Inbound bytes from adjacent peer `from`: parse, decrypt with the
    /// previous hop's key, then deliver or re-enter the forward path.
    pub async fn receive(&self, from: PeerId, bytes: &[u8]) -> Result<ForwardOutcome, EngineError> {
        let mut packet = Packet::from_bytes(bytes)?;
        let plaintext = self.keys.decrypt(from, &packet.payload)?;
        packet.payload = plaintext;

        if packet.dst == self.node_id {
            if packet.msg_type == MsgType::ImageChunk {
                self.absorb_chunk(&packet)?;
            } else {
                self.deliver_local(&packet);
            }
            Ok(ForwardOutcome::DeliveredLocal)
        } else {
            Ok(self.forward(packet).await)
        }
    }

    fn deliver_local(&self, packet: &Packet) {
        log::info!(
            "general: node {}: delivered packet seq {} from {}",
            self.node_id,
            packet.seq,
            packet.src
        );
        *self.last_received.lock().unwrap() = Some(Delivery {
            src: packet.src,
            msg_type: packet.msg_type as u8,
            seq: packet.seq,
            ttl: packet.ttl,
            payload: packet.payload.clone(),
        });
    }

    /// Buffer one image chunk; on the final unique index, reassemble, inflate
    /// and persist. Duplicate chunks overwrite (idempotent), so the result
    /// depends only on the set of indices received.
    fn absorb_chunk(&self, packet: &Packet) -> Result<Option<PathBuf>, EngineError> {
        let (meta, data) = chunk::decode(&packet.payload)?;
        let mut assemblies = self.assemblies.lock().unwrap();
        let assembly = assemblies.entry(packet.src).or_insert_with(|| Assembly {
            total: meta.total,
            chunks: HashMap::new(),
            last_chunk_at: Instant::now(),
        });
        if assembly.total != meta.total {
            // The source restarted with a different chunk count; start over.
            assembly.total = meta.total;
            assembly.chunks.clear();
        }
        assembly.chunks.insert(meta.index, data.to_vec());
        assembly.last_chunk_at = Instant::now();
        log::info!(
            "general: node {}: buffered image chunk {}/{} from {}",
            self.node_id,
            meta.index,
            meta.total,
            packet.src
        );
        if assembly.chunks.len() as u32 != assembly.total {
            return Ok(None);
        }
        let complete = assemblies.remove(&packet.src).expect("assembly present");
        drop(assemblies);

        let mut compressed = Vec::new();
        for index in 1..=complete.total {
            compressed.extend_from_slice(&complete.chunks[&index]);
        }
        let image = zlib::inflate(&compressed)?;
        let path = self.persist_image(packet.src, &image)?;
        log::info!(
            "general: node {}: image from {} reassembled to {}",
            self.node_id,
            packet.src,
            path.display()
        );
        Ok(Some(path))
    }

    fn persist_image(&self, src: PeerId, image: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.cfg.received_images_dir)?;
        let unix = clock::wall_now() as u64;
        let path = self
            .cfg
            .received_images_dir
            .join(format!("image_from_satellite_{src}_{unix}.png"));
        std::fs::write(&path, image)?;
        Ok(path)
    }

    /// Drop partial assemblies idle longer than the configured TTL.
    pub fn prune_assemblies(&self) {
        let ttl = self.cfg.image_buffer_ttl;
        let node_id = self.node_id;
        self.assemblies.lock().unwrap().retain(|src, assembly| {
            let keep = assembly.last_chunk_at.elapsed() <= ttl;
            if !keep {
                log::warn!(
                    "general: node {}: discarding stale image buffer from {} ({}/{} chunks)",
                    node_id,
                    src,
                    assembly.chunks.len(),
                    assembly.total
                );
            }
            keep
        });
    }

    /// Source side of an image transfer: read, deflate, chunk, forward each
    /// chunk as its own packet. Returns the chunk count.
    pub async fn transmit_image(&self, dst: PeerId, path: &Path) -> Result<u32, EngineError> {
        let data = std::fs::read(path)?;
        let compressed = zlib::deflate(&data);
        let payloads = chunk::split(&compressed);
        let total = payloads.len() as u32;
        log::info!(
            "general: node {}: transmitting image {} to {} in {} chunks",
            self.node_id,
            path.display(),
            dst,
            total
        );
        for payload in payloads {
            let packet = Packet::new(
                MsgType::ImageChunk,
                self.node_id,
                dst,
                self.next_seq(),
                payload,
            );
            self.forward(packet).await;
        }
        Ok(total)
    }

    /// Persisted images received by this peer, sorted by path.
    pub fn received_images(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.cfg.received_images_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "png") {
                    out.push(path);
                }
            }
        }
        out.sort();
        out
    }
}
