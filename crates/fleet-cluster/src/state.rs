//! Local cluster lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the local process in the cluster.
///
/// Transitions only move forward: `Joining → Alive → Leaving → Left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Not yet registered.
    #[default]
    Joining,
    /// Registered and holding a live lease.
    Alive,
    /// Deregistration in progress.
    Leaving,
    /// Deregistered.
    Left,
}

impl ClusterState {
    /// Returns true if moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Joining, Self::Alive) | (Self::Alive, Self::Leaving) | (Self::Leaving, Self::Left)
        )
    }

    /// Returns the state as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Alive => "alive",
            Self::Leaving => "leaving",
            Self::Left => "left",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(ClusterState::Joining.can_transition_to(ClusterState::Alive));
        assert!(ClusterState::Alive.can_transition_to(ClusterState::Leaving));
        assert!(ClusterState::Leaving.can_transition_to(ClusterState::Left));
    }

    #[test]
    fn test_no_way_back_to_alive() {
        assert!(!ClusterState::Leaving.can_transition_to(ClusterState::Alive));
        assert!(!ClusterState::Left.can_transition_to(ClusterState::Alive));
        assert!(!ClusterState::Joining.can_transition_to(ClusterState::Left));
    }

    #[test]
    fn test_display() {
        assert_eq!(ClusterState::Alive.to_string(), "alive");
        assert_eq!(ClusterState::default(), ClusterState::Joining);
    }
}
