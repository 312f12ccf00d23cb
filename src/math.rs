//! Math types for Sonoray

pub use glam::{Quat, Vec3};

/// Position and orientation, used for the active listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}
