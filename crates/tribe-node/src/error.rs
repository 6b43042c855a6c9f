//! Error types for the tribe node.

use crate::blocks::BlockReason;
use thiserror::Error;

/// Errors that can occur in the tribe node.
#[derive(Debug, Error)]
pub enum TribeError {
    /// A member cluster could not be reached.
    #[error("member cluster [{alias}] unreachable: {msg}")]
    RemoteUnreachable {
        /// Alias of the member cluster.
        alias: String,
        /// Error message describing the connection issue.
        msg: String,
    },

    /// The operation was denied by the configured blocks.
    #[error("blocked by: [{}]", reason.description())]
    Blocked {
        /// Which block denied the operation.
        reason: BlockReason,
    },

    /// The target index is not part of the merged view.
    #[error("no such index [{index}]")]
    UnknownIndex {
        /// The index that was not found.
        index: String,
    },

    /// The operation needs a master and the tribe node never has one.
    #[error("no coordinator available for [{operation}]")]
    NoCoordinator {
        /// Name of the rejected operation.
        operation: String,
    },

    /// The target index exists but is closed on its owning cluster.
    #[error("index [{index}] is closed")]
    IndexClosed {
        /// The closed index.
        index: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// JSON encoding/decoding error.
    #[error("serialization error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The tribe node was shut down.
    #[error("tribe node shut down")]
    Shutdown,
}

impl TribeError {
    /// Stable machine-readable code for the rejection.
    pub fn code(&self) -> &'static str {
        match self {
            TribeError::RemoteUnreachable { .. } => "remote_unreachable",
            TribeError::Blocked { reason } => reason.code(),
            TribeError::UnknownIndex { .. } => "unknown_index",
            TribeError::NoCoordinator { .. } => "no_coordinator",
            TribeError::IndexClosed { .. } => "index_closed",
            TribeError::Config { .. } => "invalid_config",
            TribeError::Json(_) => "serialization",
            TribeError::Io(_) => "io",
            TribeError::Shutdown => "shutdown",
        }
    }

    /// Returns the block reason if this is a block rejection.
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            TribeError::Blocked { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type for tribe node operations.
pub type Result<T> = std::result::Result<T, TribeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_message_matches_diagnostic() {
        let err = TribeError::Blocked {
            reason: BlockReason::GlobalWrite,
        };
        assert_eq!(
            err.to_string(),
            "blocked by: [BAD_REQUEST/11/tribe node, write not allowed]"
        );
        assert_eq!(err.code(), "global_write_block");
    }

    #[test]
    fn test_pattern_block_message() {
        let err = TribeError::Blocked {
            reason: BlockReason::PatternWrite,
        };
        assert!(err.to_string().contains("FORBIDDEN/8/index write (api)"));
        assert_eq!(err.block_reason(), Some(BlockReason::PatternWrite));
    }

    #[test]
    fn test_codes_are_distinct() {
        let no_coord = TribeError::NoCoordinator {
            operation: "create_index".to_string(),
        };
        let unknown = TribeError::UnknownIndex {
            index: "x".to_string(),
        };
        assert_eq!(no_coord.code(), "no_coordinator");
        assert_eq!(unknown.code(), "unknown_index");
        assert!(no_coord.block_reason().is_none());
    }
}
