#![warn(missing_docs)]

//! Tribe node: a client of several independent clusters that merges their
//! state into one read-mostly view and routes requests to the owning cluster.

pub mod aggregator;
pub mod blocks;
#[allow(missing_docs)]
pub mod cli;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod link;
pub mod namespace;
pub mod router;
pub mod sim;
pub mod state;
pub mod tcp;
pub mod view;

pub use aggregator::{AggregatorHandle, StateAggregator};
pub use blocks::{BlockPolicy, BlockReason, OperationKind};
pub use config::{BlocksConfig, LinkConfig, RemoteConfig, TribeConfig};
pub use conflict::{ConflictPolicy, ConflictResolver};
pub use coordinator::TribeNode;
pub use error::{Result, TribeError};
pub use health::{FederationHealth, HealthReport};
pub use link::{ClusterConnector, LinkEvent, StateSource};
pub use router::{Operation, RemoteClient, RequestRouter, RouteTarget};
pub use state::{ClusterFacts, IndexMetadata, IndexRecord, IndexState, MemberState, NodeInfo, RemoteNode};
pub use view::MergedView;
