//! Local user profile as announced to nearby peers.

use serde::{Deserialize, Serialize};

/// Profile fields a peer announces. Unset fields are left out of the announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    /// Avatar type identifier.
    pub avatar_type: Option<String>,
    /// Human-readable name.
    pub display_name: Option<String>,
    /// Public key of the user identity.
    pub public_key: Option<String>,
}

impl UserProfile {
    /// Profile with only a display name.
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: Some(display_name.into()),
            ..Self::default()
        }
    }
}
