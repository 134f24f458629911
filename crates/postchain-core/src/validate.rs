use crate::block::{Block, SealedBlock};
use crate::error::{BlockRejection, ChainError};
use crate::pow::meets_difficulty;
use rayon::prelude::*;

/// Admission rules for `block` (with `claimed` as its hash) on top of `parent`.
///
/// Linkage is checked against the parent's *stored* hash, so an edit to any
/// earlier block breaks every descendant.
pub(crate) fn check_successor(
    parent: &SealedBlock,
    block: &Block,
    claimed: &str,
    difficulty: u32,
) -> Result<(), BlockRejection> {
    if block.previous_hash() != parent.hash() {
        return Err(BlockRejection::StaleParent {
            expected: parent.hash().to_string(),
            found: block.previous_hash().to_string(),
        });
    }
    let expected_index = next_index(parent)?;
    if block.index() != expected_index {
        return Err(BlockRejection::IndexMismatch {
            expected: expected_index,
            found: block.index(),
        });
    }
    if !meets_difficulty(claimed, difficulty) {
        return Err(BlockRejection::InsufficientWork {
            hash: claimed.to_string(),
            difficulty,
        });
    }
    let computed = block.compute_digest();
    if computed != claimed {
        return Err(BlockRejection::DigestMismatch {
            claimed: claimed.to_string(),
            computed,
        });
    }
    Ok(())
}

/// The index a child of `parent` must carry.
pub(crate) fn next_index(parent: &SealedBlock) -> Result<u64, BlockRejection> {
    parent
        .index()
        .checked_add(1)
        .ok_or(BlockRejection::IndexExhausted {
            parent: parent.index(),
        })
}

/// Check a whole chain, reporting the earliest failing position.
///
/// The genesis block only has to match its own digest. Every later block
/// must pass [`check_successor`] against the block before it. The input is
/// never modified.
pub fn validate_chain(chain: &[SealedBlock], difficulty: u32) -> Result<(), ChainError> {
    let genesis = chain.first().ok_or(ChainError::Empty)?;
    if !genesis.is_self_consistent() {
        return Err(ChainError::InconsistentGenesis {
            hash: genesis.hash().to_string(),
        });
    }

    // Each pair is independent; find_map_first keeps the result in chain order.
    let failure = chain
        .par_windows(2)
        .enumerate()
        .find_map_first(|(i, pair)| {
            check_successor(&pair[0], pair[1].block(), pair[1].hash(), difficulty)
                .err()
                .map(|reason| ChainError::InvalidBlock {
                    position: i + 1,
                    reason,
                })
        });

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub fn is_chain_valid(chain: &[SealedBlock], difficulty: u32) -> bool {
    validate_chain(chain, difficulty).is_ok()
}
