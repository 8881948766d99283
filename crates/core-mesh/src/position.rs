//! Self-position tracking and mobility models.
//!
//! Positions are abstract 3-vectors with Euclidean distance; there is no
//! orbital fidelity. A satellite follows a [`CircularOrbit`] in the x/y plane
//! while ground stations stay [`Fixed`]. Models are pluggable; the contract is
//! that positions change continuously with time.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

pub trait Mobility: Send + Sync {
    /// Position at wall time `t` (seconds).
    fn position_at(&self, t: f64) -> Position;
}

/// Circular motion around `(center_x, center_y)` at a fixed altitude:
/// `x = cx + r*cos(w*t)`, `y = cy + r*sin(w*t)`.
pub struct CircularOrbit {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
    pub angular_velocity: f64,
    pub altitude: f64,
}

impl Mobility for CircularOrbit {
    fn position_at(&self, t: f64) -> Position {
        let angle = self.angular_velocity * t;
        Position::new(
            self.center_x + self.radius * angle.cos(),
            self.center_y + self.radius * angle.sin(),
            self.altitude,
        )
    }
}

/// A peer that never moves (ground stations, tests).
pub struct Fixed(pub Position);

impl Mobility for Fixed {
    fn position_at(&self, _t: f64) -> Position {
        self.0
    }
}

/// Owns the peer's current position and recomputes it from the mobility model.
pub struct PositionService {
    current: RwLock<Position>,
    model: Box<dyn Mobility>,
}

impl PositionService {
    pub fn new(initial: Position, model: Box<dyn Mobility>) -> Self {
        Self {
            current: RwLock::new(initial),
            model,
        }
    }

    pub fn current(&self) -> Position {
        *self.current.read().unwrap()
    }

    /// Recompute the position for wall time `t` and store it.
    pub fn advance(&self, t: f64) -> Position {
        let next = self.model.position_at(t);
        *self.current.write().unwrap() = next;
        next
    }
}
