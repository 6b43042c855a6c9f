//! Federation health.
//!
//! Derived entirely from a merged view: each member's link state and how
//! much of the view it contributes.

use crate::state::MemberState;
use crate::view::MergedView;
use serde::Serialize;

/// Health of one member cluster's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberHealth {
    /// Synced; the member's nodes and indices are in the view.
    Healthy,
    /// A connection attempt is in progress.
    Connecting,
    /// Unreachable; the member contributes nothing to the view.
    Disconnected,
}

impl From<MemberState> for MemberHealth {
    fn from(state: MemberState) -> Self {
        match state {
            MemberState::Synced => MemberHealth::Healthy,
            MemberState::Connecting => MemberHealth::Connecting,
            MemberState::Disconnected => MemberHealth::Disconnected,
        }
    }
}

/// Health report for one member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberHealthReport {
    /// Member alias.
    pub alias: String,
    /// Link health.
    pub health: MemberHealth,
    /// Nodes the member contributes to the view, the tribe node's own
    /// client membership included.
    pub nodes: usize,
    /// Indices the member owns in the view.
    pub indices: usize,
}

/// Overall federation health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationHealth {
    /// Every member is synced.
    Healthy,
    /// Some members are not synced, but at most half are disconnected.
    Degraded,
    /// More than half of the members are disconnected.
    Critical,
    /// No member clusters configured.
    NotConfigured,
}

/// Health of the whole federation at one view version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// View version the report was computed from.
    pub version: u64,
    /// Overall status.
    pub status: FederationHealth,
    /// Per-member reports, sorted by alias.
    pub members: Vec<MemberHealthReport>,
}

impl HealthReport {
    /// Compute the report for a view.
    pub fn from_view(view: &MergedView) -> Self {
        let members: Vec<MemberHealthReport> = view
            .members()
            .iter()
            .map(|(alias, state)| MemberHealthReport {
                alias: alias.clone(),
                health: MemberHealth::from(*state),
                nodes: view.nodes().filter(|n| &n.cluster == alias).count(),
                indices: view.indices().filter(|i| &i.cluster == alias).count(),
            })
            .collect();

        Self {
            version: view.version(),
            status: federation_health(&members),
            members,
        }
    }

    /// Report for one member.
    pub fn member(&self, alias: &str) -> Option<&MemberHealthReport> {
        self.members.iter().find(|m| m.alias == alias)
    }

    /// Aliases of members that are not synced.
    pub fn unsynced(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.health != MemberHealth::Healthy)
            .map(|m| m.alias.as_str())
            .collect()
    }
}

fn federation_health(members: &[MemberHealthReport]) -> FederationHealth {
    if members.is_empty() {
        return FederationHealth::NotConfigured;
    }

    let total = members.len();
    let disconnected = members
        .iter()
        .filter(|m| m.health == MemberHealth::Disconnected)
        .count();
    let healthy = members
        .iter()
        .filter(|m| m.health == MemberHealth::Healthy)
        .count();

    if disconnected > total / 2 {
        FederationHealth::Critical
    } else if healthy < total {
        FederationHealth::Degraded
    } else {
        FederationHealth::Healthy
    }
}
