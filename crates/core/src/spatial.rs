//! Spatial addressing: positions to parcels, parcels to grid cells, cells to topics.
//!
//! A parcel is the fixed-size square unit of land. Parcels are biased so that every
//! coordinate inside the world limits is non-negative and then grouped into square
//! blocks of `2^block_shift` parcels per side. Each block is one grid cell and one
//! routing topic, so small movements inside a block never change the topic.

use crate::Position;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Integer parcel coordinates (unbiased, may be negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Parcel {
    /// Parcel column.
    pub x: i32,
    /// Parcel row.
    pub z: i32,
}

/// Coarse grid cell a peer is located in; the unit of topic routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    /// Cell column.
    pub x: i32,
    /// Cell row.
    pub z: i32,
}

impl GridCell {
    /// Construct a cell from its coordinates.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Manhattan distance to `other`.
    pub fn manhattan(self, other: GridCell) -> u32 {
        self.x.abs_diff(other.x) + self.z.abs_diff(other.z)
    }

    /// Routing topic for this cell.
    pub fn topic(self) -> Topic {
        Topic(format!("{}:{}", self.x, self.z))
    }
}

impl fmt::Display for GridCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.z)
    }
}

/// Routing key used for pub/sub filtering.
///
/// Position topics have the form `"<gx>:<gz>"`; scene topics are the scene
/// identifier verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Wrap an arbitrary routing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the routing key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<GridCell> for Topic {
    fn from(cell: GridCell) -> Self {
        cell.topic()
    }
}

impl From<&str> for Topic {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl From<String> for Topic {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Grid geometry shared by every peer.
///
/// Senders and receivers coordinate only through these values, so all peers in a
/// world must use the same configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Parcel edge length in world units.
    pub parcel_size: f32,
    /// Bias added to parcel X so in-world values are non-negative.
    pub parcel_bias_x: i32,
    /// Bias added to parcel Z so in-world values are non-negative.
    pub parcel_bias_z: i32,
    /// Parcels per block side, as a power of two.
    pub block_shift: u32,
    /// Manhattan radius of the subscribed neighborhood around the current cell.
    pub neighbor_radius: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            parcel_size: 16.0,
            parcel_bias_x: 150,
            parcel_bias_z: 150,
            block_shift: 2,
            neighbor_radius: 1,
        }
    }
}

/// Invalid grid geometry.
#[derive(Debug, Error, PartialEq)]
pub enum GridConfigError {
    /// Parcel size must be a positive finite number.
    #[error("parcel size must be positive and finite, got {0}")]
    ParcelSize(f32),
    /// Shift would discard every bit of the coordinate.
    #[error("block shift {0} exceeds 30")]
    BlockShift(u32),
    /// Bias must keep coordinates non-negative.
    #[error("parcel bias must be non-negative, got ({0}, {1})")]
    NegativeBias(i32, i32),
}

impl GridConfig {
    /// Check the geometry for values that would make addressing meaningless.
    pub fn validate(&self) -> Result<(), GridConfigError> {
        if !self.parcel_size.is_finite() || self.parcel_size <= 0.0 {
            return Err(GridConfigError::ParcelSize(self.parcel_size));
        }
        if self.block_shift > 30 {
            return Err(GridConfigError::BlockShift(self.block_shift));
        }
        if self.parcel_bias_x < 0 || self.parcel_bias_z < 0 {
            return Err(GridConfigError::NegativeBias(
                self.parcel_bias_x,
                self.parcel_bias_z,
            ));
        }
        Ok(())
    }
}

/// Parcel containing `position`.
///
/// Coordinates are floored, so `-0.5` lands in parcel `-1`. Out-of-range values
/// saturate at the `i32` limits.
pub fn parcel_of(position: &Position, config: &GridConfig) -> Parcel {
    Parcel {
        x: (position.x / config.parcel_size).floor() as i32,
        z: (position.z / config.parcel_size).floor() as i32,
    }
}

/// Grid cell containing `position`.
pub fn cell_of(position: &Position, config: &GridConfig) -> GridCell {
    cell_of_parcel(parcel_of(position, config), config)
}

/// Grid cell containing `parcel`.
///
/// The arithmetic shift rounds toward negative infinity, which keeps block
/// boundaries consistent for parcels outside the biased range too.
///
/// Shifts of 32 or more (rejected by [`GridConfig::validate`]) still floor: every
/// non-negative coordinate lands in block 0 and every negative one in block -1.
pub fn cell_of_parcel(parcel: Parcel, config: &GridConfig) -> GridCell {
    GridCell {
        x: block_of(parcel.x.saturating_add(config.parcel_bias_x), config.block_shift),
        z: block_of(parcel.z.saturating_add(config.parcel_bias_z), config.block_shift),
    }
}

fn block_of(biased: i32, shift: u32) -> i32 {
    biased
        .checked_shr(shift)
        .unwrap_or(if biased < 0 { -1 } else { 0 })
}

/// Routing topic for `position`.
pub fn topic_for(position: &Position, config: &GridConfig) -> Topic {
    cell_of(position, config).topic()
}

/// True when the cells share an edge. Diagonal cells and a cell with itself are not adjacent.
pub fn are_adjacent(a: GridCell, b: GridCell) -> bool {
    a.manhattan(b) == 1
}

/// `center` plus every cell within `radius` Manhattan steps, in row-major order.
///
/// Radius 1 is the cell plus its [`are_adjacent`] neighbors, negative coordinates
/// included.
pub fn neighborhood(center: GridCell, radius: u32) -> Vec<GridCell> {
    let r = radius.min(i32::MAX as u32) as i32;
    let mut cells = Vec::new();
    for dz in -r..=r {
        let span = r - dz.abs();
        for dx in -span..=span {
            let cell = GridCell::new(center.x.saturating_add(dx), center.z.saturating_add(dz));
            if !cells.contains(&cell) {
                cells.push(cell);
            }
        }
    }
    cells
}
