//! Transition selection.
//!
//! The next action is a pure function of what the tick observed: whether
//! deletion was requested, which resources exist, and how they differ from
//! the spec.

use igm_api::ReconcileState;

/// The action a tick executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    /// Modify resources in place.
    Update,
    /// Replace instances running a superseded launch configuration.
    Upgrade,
    Delete,
    /// Resources already match the spec.
    Noop,
}

/// Differences between the spec and an existing scaling group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drift {
    /// Size bounds or subnets differ.
    pub scaling_group: bool,
    /// The desired launch configuration is not the active one.
    pub launch_configuration: bool,
    /// The role is missing or its managed policies differ.
    pub role: bool,
    /// A launch configuration recorded earlier is no longer referenced.
    pub unused_launch_configuration: bool,
    /// Instances not running the active launch configuration.
    pub stale_instances: u32,
}

impl Drift {
    /// Returns true when resources must change in place.
    pub fn requires_update(&self) -> bool {
        self.scaling_group
            || self.launch_configuration
            || self.role
            || self.unused_launch_configuration
    }
}

/// What a tick saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub current: ReconcileState,
    pub deletion_requested: bool,
    pub has_scaling_group: bool,
    pub has_launch_configuration: bool,
    pub has_role: bool,
    pub drift: Drift,
}

/// Select the transition for this tick.
///
/// Deletion pre-empts everything else. A group recorded as `Deleted`
/// whose scaling group and launch configuration are gone stays put; a
/// surviving role at that point is not ours to delete.
pub fn next_transition(observation: &Observation) -> Transition {
    if observation.deletion_requested {
        let gone = !observation.has_scaling_group && !observation.has_launch_configuration;
        if observation.current == ReconcileState::Deleted && gone {
            return Transition::Noop;
        }
        return Transition::Delete;
    }

    if !observation.has_scaling_group {
        return Transition::Create;
    }

    if observation.drift.requires_update() {
        Transition::Update
    } else if observation.drift.stale_instances > 0 {
        Transition::Upgrade
    } else {
        Transition::Noop
    }
}
