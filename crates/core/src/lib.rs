#![warn(missing_docs)]
//! Core data model and spatial addressing shared across the workspace.

mod position;
mod profile;
pub mod spatial;

pub use position::Position;
pub use profile::UserProfile;
pub use spatial::{
    are_adjacent, cell_of, cell_of_parcel, neighborhood, parcel_of, topic_for, GridCell,
    GridConfig, GridConfigError, Parcel, Topic,
};

/// Milliseconds since the Unix epoch, saturating at zero for clocks set before 1970.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
