//! Berkeley-style clock averaging.
//!
//! Every peer keeps a logical clock `wall_clock() + offset`. A sync round
//! averages the local time with whatever neighbor times were gathered and
//! applies the difference as an additive offset. The offset is an atomic
//! 64-bit float so readers never observe a torn value.

use core_packet::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
pub fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs_f64()
}

pub struct ClockService {
    node_id: PeerId,
    offset_bits: AtomicU64,
}

impl ClockService {
    pub fn new(node_id: PeerId) -> Self {
        Self {
            node_id,
            offset_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn offset(&self) -> f64 {
        f64::from_bits(self.offset_bits.load(Ordering::SeqCst))
    }

    pub fn adjust(&self, delta: f64) {
        self.offset_bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            })
            .expect("offset update");
    }

    /// Synchronized local time.
    pub fn local_time(&self) -> f64 {
        wall_now() + self.offset()
    }

    /// One averaging round: new local time becomes `mean({self} ∪ peers)`.
    /// An entry under our own id is ignored (we always contribute our live
    /// clock). With no peer times this is a no-op. Returns the applied
    /// adjustment.
    pub fn synchronize(&self, peer_times: &HashMap<PeerId, f64>) -> f64 {
        let own = self.local_time();
        let mut sum = own;
        let mut count = 1usize;
        for (&id, &t) in peer_times {
            if id == self.node_id {
                continue;
            }
            sum += t;
            count += 1;
        }
        let adjustment = sum / count as f64 - own;
        self.adjust(adjustment);
        log::debug!(
            "general: node {}: clock adjusted by {:+.6}s over {} peer times",
            self.node_id,
            adjustment,
            count - 1
        );
        adjustment
    }
}
