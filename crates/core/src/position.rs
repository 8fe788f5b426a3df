//! Avatar pose samples.

use serde::{Deserialize, Serialize};

/// World-space avatar pose: coordinates plus a unit rotation quaternion.
///
/// Produced by the rendering side at a fixed sampling rate and never mutated
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// World X coordinate.
    pub x: f32,
    /// World Y coordinate (height, ignored by spatial addressing).
    pub y: f32,
    /// World Z coordinate.
    pub z: f32,
    /// Rotation quaternion X.
    pub qx: f32,
    /// Rotation quaternion Y.
    pub qy: f32,
    /// Rotation quaternion Z.
    pub qz: f32,
    /// Rotation quaternion W.
    pub qw: f32,
}

impl Position {
    /// Pose at the given coordinates with the identity rotation.
    pub const fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
            qw: 1.0,
        }
    }

    /// Replace the rotation quaternion.
    pub const fn with_rotation(self, qx: f32, qy: f32, qz: f32, qw: f32) -> Self {
        Self {
            qx,
            qy,
            qz,
            qw,
            ..self
        }
    }
}
