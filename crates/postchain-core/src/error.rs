//! Error types for the ledger core. Every failure here is a local,
//! recoverable outcome; none of them is fatal to the node.

use thiserror::Error;

/// Why `add_block` refused a block. The candidate is simply discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockRejection {
    /// The block does not build on the current tip.
    #[error("stale parent: expected previous hash {expected}, got {found}")]
    StaleParent { expected: String, found: String },

    /// The block's index does not follow the tip's index.
    #[error("index mismatch: expected {expected}, got {found}")]
    IndexMismatch { expected: u64, found: u64 },

    /// The parent already holds the largest representable index.
    #[error("index space exhausted: no index follows {parent}")]
    IndexExhausted { parent: u64 },

    /// The claimed hash has too few leading zeros.
    #[error("insufficient work: {hash} has fewer than {difficulty} leading zeros")]
    InsufficientWork { hash: String, difficulty: u32 },

    /// The claimed hash is not the digest of the block's contents.
    #[error("digest mismatch: claimed {claimed}, computed {computed}")]
    DigestMismatch { claimed: String, computed: String },
}

/// Why a candidate chain failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("chain is empty")]
    Empty,

    #[error("genesis hash {hash} does not match its contents")]
    InconsistentGenesis { hash: String },

    #[error("block at position {position} is invalid: {reason}")]
    InvalidBlock {
        position: usize,
        #[source]
        reason: BlockRejection,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("block rejected: {0}")]
    RejectedBlock(#[from] BlockRejection),

    /// The chain moved while mining; the candidate was thrown away and its
    /// records went back to the pending queue.
    #[error("mining abandoned: chain changed during the search")]
    MiningAbandoned,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
