//! Index name conflict resolution across member clusters.
//!
//! Index names are not namespaced, so two members may report the same name.
//! The configured [`ConflictPolicy`] decides, per name and on every merge,
//! which copy (if any) enters the merged view.
//!
//! Under `prefer_<alias>` a name stays contested after a collision until no
//! member reports it any more: while contested, only the preferred member's
//! copy is ever shown. `drop` keeps no such memory.

use crate::error::TribeError;
use crate::state::{ClusterFacts, IndexMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

const PREFER_PREFIX: &str = "prefer_";

/// Policy applied when more than one member cluster reports an index name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictPolicy {
    /// Exclude the index from the merged view while more than one member claims it.
    #[default]
    Drop,
    /// Take the copy of the named member; exclude the name if that member does not report it.
    Prefer(String),
}

impl ConflictPolicy {
    /// Alias named by a `prefer_<alias>` policy.
    pub fn preferred_alias(&self) -> Option<&str> {
        match self {
            ConflictPolicy::Drop => None,
            ConflictPolicy::Prefer(alias) => Some(alias),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = TribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "drop" {
            return Ok(ConflictPolicy::Drop);
        }
        match s.strip_prefix(PREFER_PREFIX) {
            Some(alias) if !alias.is_empty() => Ok(ConflictPolicy::Prefer(alias.to_string())),
            _ => Err(TribeError::Config {
                reason: format!("on_conflict must be [drop] or [prefer_<alias>], got [{}]", s),
            }),
        }
    }
}

impl TryFrom<String> for ConflictPolicy {
    type Error = TribeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConflictPolicy> for String {
    fn from(policy: ConflictPolicy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Drop => write!(f, "drop"),
            ConflictPolicy::Prefer(alias) => write!(f, "{}{}", PREFER_PREFIX, alias),
        }
    }
}

/// An index name left out of the merged view by the conflict policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictExclusion {
    /// The excluded index name.
    pub index: String,
    /// Aliases of every member reporting the name, sorted.
    pub claimants: Vec<String>,
}

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub struct Resolution<'a> {
    /// Index name to `(owning alias, metadata)` for every name that survives.
    pub winners: BTreeMap<&'a str, (&'a str, &'a IndexMetadata)>,
    /// Names excluded because of a collision.
    pub exclusions: Vec<ConflictExclusion>,
    /// Names contested after this pass, to feed into the next one.
    pub contested: BTreeSet<String>,
}

/// Stateless resolver applying one [`ConflictPolicy`].
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    /// Create a resolver for the given policy.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// The configured policy.
    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Resolve index ownership across the given members' facts.
    ///
    /// `contested` is the set returned by the previous pass. For a fixed
    /// `contested` set the result depends only on the set of
    /// `(alias, facts)` pairs, not on the order they are passed in.
    pub fn resolve<'a, I>(&self, members: I, contested: &BTreeSet<String>) -> Resolution<'a>
    where
        I: IntoIterator<Item = (&'a str, &'a ClusterFacts)>,
    {
        let mut claims: BTreeMap<&'a str, Vec<(&'a str, &'a IndexMetadata)>> = BTreeMap::new();
        for (alias, facts) in members {
            for (name, meta) in &facts.indices {
                claims.entry(name.as_str()).or_default().push((alias, meta));
            }
        }

        let mut resolution = Resolution::default();
        for (name, mut claimants) in claims {
            claimants.sort_by(|a, b| a.0.cmp(b.0));

            let colliding = claimants.len() > 1;
            let was_contested = contested.contains(name);
            if colliding || was_contested {
                resolution.contested.insert(name.to_string());
            }

            let winner = match &self.policy {
                _ if !colliding && !was_contested => Some(claimants[0]),
                ConflictPolicy::Drop if !colliding => Some(claimants[0]),
                ConflictPolicy::Drop => None,
                ConflictPolicy::Prefer(preferred) => {
                    claimants.iter().find(|(alias, _)| *alias == preferred.as_str()).copied()
                }
            };

            match winner {
                Some(claim) => {
                    resolution.winners.insert(name, claim);
                }
                None => resolution.exclusions.push(ConflictExclusion {
                    index: name.to_string(),
                    claimants: claimants.iter().map(|(alias, _)| alias.to_string()).collect(),
                }),
            }
        }
        resolution
    }
}
