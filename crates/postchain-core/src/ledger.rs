use crate::block::{record_key, unix_timestamp, Block, Record, SealedBlock};
use crate::constants::{DEFAULT_DIFFICULTY, GENESIS_PREVIOUS_HASH, HASH_HEX_SIZE};
use crate::error::{BlockRejection, LedgerError};
use crate::pow::proof_of_work;
use crate::validate::{check_successor, next_index};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Leading hex zeros a block hash needs to be admitted.
    pub difficulty: u32,
    /// Fixed genesis timestamp. Nodes sharing it share a genesis block;
    /// `None` stamps genesis with the current time.
    pub genesis_timestamp: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            genesis_timestamp: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.difficulty as usize > HASH_HEX_SIZE {
            return Err(LedgerError::InvalidConfig(format!(
                "difficulty {} exceeds hash length {}",
                self.difficulty, HASH_HEX_SIZE
            )));
        }
        Ok(())
    }
}

/// Wire form of a full chain, as served to peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub length: usize,
    pub chain: Vec<SealedBlock>,
}

impl ChainSnapshot {
    pub fn new(chain: Vec<SealedBlock>) -> Self {
        Self {
            length: chain.len(),
            chain,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MineOutcome {
    Mined { index: u64 },
    NothingToMine,
}

/// A candidate block built from a drained pending queue, waiting for its
/// proof of work.
#[derive(Debug)]
pub struct MiningJob {
    block: Block,
    id: u64,
    /// Chain position of the tip the candidate was built on.
    parent_position: usize,
}

impl MiningJob {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub(crate) fn block_mut(&mut self) -> &mut Block {
        &mut self.block
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    /// Never empty: genesis is inserted at construction and replacement
    /// only accepts validated, non-empty chains.
    chain: Vec<SealedBlock>,
    pending: Vec<Record>,
    difficulty: u32,
    /// Outstanding candidates by id. Each maps to the first chain position
    /// whose blocks the candidate has not seen: its parent's successor,
    /// lowered by any replacement that rewrote the chain below it.
    candidates: HashMap<u64, usize>,
    next_candidate: u64,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let mut ledger = Self {
            chain: Vec::new(),
            pending: Vec::new(),
            difficulty: config.difficulty,
            candidates: HashMap::new(),
            next_candidate: 0,
        };
        ledger.create_genesis_block(config.genesis_timestamp.unwrap_or_else(unix_timestamp));
        Ok(ledger)
    }

    /// A zero-transaction genesis block, sealed with its plain digest.
    fn create_genesis_block(&mut self, timestamp: u64) {
        let genesis = Block::new(0, vec![], timestamp, GENESIS_PREVIOUS_HASH);
        let hash = genesis.compute_digest();
        debug!(%hash, "created genesis block");
        self.chain.push(genesis.seal(hash));
    }

    pub fn chain(&self) -> &[SealedBlock] {
        &self.chain
    }

    pub fn last_block(&self) -> &SealedBlock {
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain_length(&self) -> usize {
        self.chain.len()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn pending_transactions(&self) -> &[Record] {
        &self.pending
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot::new(self.chain.clone())
    }

    pub fn add_transaction(&mut self, record: Record) {
        self.pending.push(record);
    }

    /// The only way a block enters the chain. Checks linkage to the tip,
    /// index continuity, the difficulty predicate and the digest, then seals
    /// the block with `claimed_hash`. Returns the new block's index.
    pub fn add_block(&mut self, block: Block, claimed_hash: String) -> Result<u64, BlockRejection> {
        if let Err(reason) = check_successor(self.last_block(), &block, &claimed_hash, self.difficulty) {
            warn!(index = block.index(), %reason, "rejected block");
            return Err(reason);
        }
        Ok(self.append(block, claimed_hash))
    }

    fn append(&mut self, block: Block, hash: String) -> u64 {
        let index = block.index();
        info!(index, %hash, txs = block.transactions().len(), "appended block");
        self.chain.push(block.seal(hash));
        index
    }

    /// Drain the pending queue into a candidate on top of the current tip.
    /// Returns `None` when there is nothing to mine. Fails, leaving pending
    /// untouched, when the tip's index has no successor.
    pub fn prepare_candidate(&mut self) -> Result<Option<MiningJob>, LedgerError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let last = self.last_block();
        let index = next_index(last)?;
        let previous_hash = last.hash().to_string();
        let transactions = std::mem::take(&mut self.pending);
        let id = self.next_candidate;
        self.next_candidate = self.next_candidate.wrapping_add(1);
        let parent_position = self.chain.len() - 1;
        self.candidates.insert(id, parent_position + 1);
        debug!(index, txs = transactions.len(), "prepared mining candidate");
        Ok(Some(MiningJob {
            block: Block::new(index, transactions, unix_timestamp(), previous_hash),
            id,
            parent_position,
        }))
    }

    /// Admit a mined candidate. On rejection its records return to the
    /// pending queue.
    pub fn commit_candidate(&mut self, job: MiningJob, hash: String) -> Result<u64, LedgerError> {
        if let Err(reason) = check_successor(self.last_block(), &job.block, &hash, self.difficulty) {
            warn!(index = job.block.index(), %reason, "mined candidate rejected");
            self.restore_pending(job);
            return Err(reason.into());
        }
        self.candidates.remove(&job.id);
        Ok(self.append(job.block, hash))
    }

    /// Drop a candidate, returning its records to the front of the queue.
    pub fn abandon_candidate(&mut self, job: MiningJob) {
        debug!(index = job.block.index(), "abandoned mining candidate");
        self.restore_pending(job);
    }

    /// Seal every pending record into one new block.
    pub fn mine(&mut self) -> Result<MineOutcome, LedgerError> {
        let Some(mut job) = self.prepare_candidate()? else {
            return Ok(MineOutcome::NothingToMine);
        };
        let hash = proof_of_work(job.block_mut(), self.difficulty);
        let index = self.commit_candidate(job, hash)?;
        Ok(MineOutcome::Mined { index })
    }

    /// Swap in a validated chain, keeping the ledger itself and any pending
    /// records the adopted chain does not already carry.
    pub(crate) fn replace_chain(&mut self, chain: Vec<SealedBlock>) {
        if chain.is_empty() {
            warn!("refusing to replace the chain with an empty one");
            return;
        }
        let shared = self
            .chain
            .iter()
            .zip(&chain)
            .take_while(|(ours, theirs)| ours.hash() == theirs.hash())
            .count();
        self.chain = chain;
        for floor in self.candidates.values_mut() {
            *floor = (*floor).min(shared);
        }
        self.prune_committed(0);
    }

    /// Remove pending records carried by the blocks from chain position
    /// `from` onward, one pending entry per committed occurrence.
    pub(crate) fn prune_committed(&mut self, from: usize) {
        let blocks = self.chain.get(from..).unwrap_or_default();
        let dropped = remove_committed(&mut self.pending, blocks);
        if dropped > 0 {
            debug!(dropped, "pruned committed pending records");
        }
    }

    /// Put a candidate's records back at the front of the queue, minus the
    /// ones that blocks arriving since its preparation already carry.
    fn restore_pending(&mut self, job: MiningJob) {
        let floor = self
            .candidates
            .remove(&job.id)
            .unwrap_or(job.parent_position + 1);
        let mut restored = job.block.into_transactions();
        remove_committed(&mut restored, self.chain.get(floor..).unwrap_or_default());
        restored.append(&mut self.pending);
        self.pending = restored;
    }
}

/// Multiset removal: every record carried by `blocks` cancels at most one
/// equal entry of `records`, earliest first. Returns how many were removed.
fn remove_committed(records: &mut Vec<Record>, blocks: &[SealedBlock]) -> usize {
    let mut committed: HashMap<String, usize> = HashMap::new();
    for record in blocks.iter().flat_map(|b| b.transactions()) {
        *committed.entry(record_key(record)).or_default() += 1;
    }
    if committed.is_empty() {
        return 0;
    }
    let before = records.len();
    records.retain(|r| match committed.get_mut(&record_key(r)) {
        Some(count) if *count > 0 => {
            *count -= 1;
            false
        }
        _ => true,
    });
    before - records.len()
}
