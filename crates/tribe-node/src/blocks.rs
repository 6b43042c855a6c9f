//! Write and metadata blocks applied to requests entering the tribe node.

use crate::config::BlocksConfig;
use crate::error::{Result, TribeError};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of operation, as far as blocks are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Reads are never blocked.
    Read,
    /// Document writes.
    Write,
    /// Index metadata changes (mappings, open/close, force merge).
    MetadataChange,
}

/// Why a block denied an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// `blocks.write` is set.
    GlobalWrite,
    /// `blocks.metadata` is set.
    GlobalMetadata,
    /// The target index matches a `blocks.write.indices` pattern.
    PatternWrite,
}

impl BlockReason {
    /// Machine-checkable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::GlobalWrite => "global_write_block",
            BlockReason::GlobalMetadata => "global_metadata_block",
            BlockReason::PatternWrite => "pattern_write_block",
        }
    }

    /// Numeric block id.
    pub fn id(&self) -> u32 {
        match self {
            BlockReason::GlobalWrite => 11,
            BlockReason::GlobalMetadata => 10,
            BlockReason::PatternWrite => 8,
        }
    }

    /// Status class reported alongside the block.
    pub fn status(&self) -> &'static str {
        match self {
            BlockReason::GlobalWrite | BlockReason::GlobalMetadata => "BAD_REQUEST",
            BlockReason::PatternWrite => "FORBIDDEN",
        }
    }

    /// Human readable diagnostic, `STATUS/id/description`.
    pub fn description(&self) -> String {
        let text = match self {
            BlockReason::GlobalWrite => "tribe node, write not allowed",
            BlockReason::GlobalMetadata => "tribe node, metadata not allowed",
            BlockReason::PatternWrite => "index write (api)",
        };
        format!("{}/{}/{}", self.status(), self.id(), text)
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of evaluating blocks for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    /// No block applies.
    Allow,
    /// A block applies.
    Deny(BlockReason),
}

impl BlockDecision {
    /// True if the operation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, BlockDecision::Allow)
    }

    /// Convert into a result, mapping a denial to [`TribeError::Blocked`].
    pub fn into_result(self) -> Result<()> {
        match self {
            BlockDecision::Allow => Ok(()),
            BlockDecision::Deny(reason) => Err(TribeError::Blocked { reason }),
        }
    }
}

/// Immutable block configuration evaluated against incoming operations.
#[derive(Debug, Clone, Default)]
pub struct BlockPolicy {
    write: bool,
    metadata: bool,
    write_patterns: Vec<Pattern>,
}

impl BlockPolicy {
    /// Build the policy, compiling the write patterns.
    pub fn new(config: &BlocksConfig) -> Result<Self> {
        let write_patterns = config
            .write_indices
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| TribeError::Config {
                    reason: format!("invalid blocks.write.indices pattern [{}]: {}", p, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            write: config.write,
            metadata: config.metadata,
            write_patterns,
        })
    }

    /// A policy that blocks nothing.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// True if any block is configured.
    pub fn has_blocks(&self) -> bool {
        self.write || self.metadata || !self.write_patterns.is_empty()
    }

    /// Evaluate blocks: global blocks first, then per-index write patterns.
    pub fn check(&self, kind: OperationKind, index: Option<&str>) -> BlockDecision {
        match kind {
            OperationKind::Read => BlockDecision::Allow,
            OperationKind::Write if self.write => BlockDecision::Deny(BlockReason::GlobalWrite),
            OperationKind::MetadataChange if self.metadata => {
                BlockDecision::Deny(BlockReason::GlobalMetadata)
            }
            OperationKind::Write => match index {
                Some(name) if self.write_patterns.iter().any(|p| p.matches(name)) => {
                    BlockDecision::Deny(BlockReason::PatternWrite)
                }
                _ => BlockDecision::Allow,
            },
            OperationKind::MetadataChange => BlockDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(write: bool, metadata: bool, patterns: &[&str]) -> BlockPolicy {
        BlockPolicy::new(&BlocksConfig {
            write,
            metadata,
            write_indices: patterns.iter().map(|p| p.to_string()).collect(),
        })
        .unwrap()
    }

    mod global_blocks {
        use super::*;

        #[test]
        fn test_global_write_blocks_every_write() {
            let p = policy(true, false, &[]);
            assert_eq!(
                p.check(OperationKind::Write, Some("test1")),
                BlockDecision::Deny(BlockReason::GlobalWrite)
            );
            assert_eq!(
                p.check(OperationKind::Write, None),
                BlockDecision::Deny(BlockReason::GlobalWrite)
            );
            assert!(p.check(OperationKind::MetadataChange, Some("test1")).is_allowed());
        }

        #[test]
        fn test_global_metadata_blocks_metadata_only() {
            let p = policy(false, true, &[]);
            assert_eq!(
                p.check(OperationKind::MetadataChange, Some("test1")),
                BlockDecision::Deny(BlockReason::GlobalMetadata)
            );
            assert!(p.check(OperationKind::Write, Some("test1")).is_allowed());
        }

        #[test]
        fn test_reads_never_blocked() {
            let p = policy(true, true, &["*"]);
            assert!(p.check(OperationKind::Read, Some("test1")).is_allowed());
            assert!(p.check(OperationKind::Read, None).is_allowed());
        }

        #[test]
        fn test_global_write_wins_over_pattern() {
            let p = policy(true, false, &["block_*"]);
            assert_eq!(
                p.check(OperationKind::Write, Some("block_test1")),
                BlockDecision::Deny(BlockReason::GlobalWrite)
            );
        }
    }

    mod pattern_blocks {
        use super::*;

        #[test]
        fn test_pattern_blocks_matching_index() {
            let p = policy(false, false, &["block_*"]);
            assert_eq!(
                p.check(OperationKind::Write, Some("block_test1")),
                BlockDecision::Deny(BlockReason::PatternWrite)
            );
            assert!(p.check(OperationKind::Write, Some("test1")).is_allowed());
        }

        #[test]
        fn test_pattern_does_not_apply_to_metadata() {
            let p = policy(false, false, &["block_*"]);
            assert!(p
                .check(OperationKind::MetadataChange, Some("block_test1"))
                .is_allowed());
        }

        #[test]
        fn test_multiple_patterns() {
            let p = policy(false, false, &["block_*", "logs-202?"]);
            assert!(!p.check(OperationKind::Write, Some("logs-2024")).is_allowed());
            assert!(p.check(OperationKind::Write, Some("logs-20245")).is_allowed());
        }

        #[test]
        fn test_invalid_pattern_rejected() {
            let result = BlockPolicy::new(&BlocksConfig {
                write: false,
                metadata: false,
                write_indices: vec!["[unclosed".to_string()],
            });
            assert!(matches!(result, Err(TribeError::Config { .. })));
        }
    }

    mod reasons {
        use super::*;

        #[test]
        fn test_descriptions() {
            assert_eq!(
                BlockReason::GlobalWrite.description(),
                "BAD_REQUEST/11/tribe node, write not allowed"
            );
            assert_eq!(
                BlockReason::GlobalMetadata.description(),
                "BAD_REQUEST/10/tribe node, metadata not allowed"
            );
            assert_eq!(
                BlockReason::PatternWrite.description(),
                "FORBIDDEN/8/index write (api)"
            );
        }

        #[test]
        fn test_into_result() {
            let err = BlockDecision::Deny(BlockReason::PatternWrite)
                .into_result()
                .unwrap_err();
            assert_eq!(err.block_reason(), Some(BlockReason::PatternWrite));
            assert!(BlockDecision::Allow.into_result().is_ok());
            assert!(!policy(false, false, &[]).has_blocks());
        }
    }
}
