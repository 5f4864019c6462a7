//! Instance group lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Lifecycle state of an instance group, recorded on its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    /// Freshly observed, not yet reconciled.
    #[default]
    Init,
    Creating,
    /// Resources exist and match the desired spec.
    Active,
    /// Spec changed; resources are being modified in place.
    Updating,
    /// Rolling replacement of instances is underway.
    Upgrading,
    Deleting,
    /// Resources are confirmed absent.
    Deleted,
    /// Discovery or an action failed during the last tick.
    Error,
}

impl ReconcileState {
    /// Every state, in declaration order.
    pub const ALL: [ReconcileState; 8] = [
        Self::Init,
        Self::Creating,
        Self::Active,
        Self::Updating,
        Self::Upgrading,
        Self::Deleting,
        Self::Deleted,
        Self::Error,
    ];

    /// Returns the wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Upgrading => "upgrading",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }

    /// Terminal for the current tick.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Error)
    }

    /// Returns true while resources are being changed.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Updating | Self::Upgrading | Self::Deleting
        )
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileState {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ApiError::UnknownState(s.to_string()))
    }
}
