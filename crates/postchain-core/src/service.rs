//! Shared, thread-safe front of the ledger for a running node.
//!
//! Every chain mutation happens under one write lock and bumps a generation
//! counter. Proof of work runs outside the lock and gives up as soon as the
//! generation moves, so a peer block or a consensus replacement preempts a
//! local search instead of racing it.

use crate::block::{Block, Record, SealedBlock};
use crate::consensus::{select_longest_valid, PeerChain, PeerId, Reconciliation};
use crate::error::{BlockRejection, LedgerError};
use crate::ledger::{ChainSnapshot, Ledger, MineOutcome, MiningJob};
use crate::pow::proof_of_work_cancellable;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// The set of peers a node knows about. The core only counts them.
pub trait PeerRegistry: Send + Sync {
    fn peers(&self) -> Vec<PeerId>;

    fn peer_count(&self) -> usize {
        self.peers().len()
    }
}

/// Where freshly mined blocks are announced.
pub trait BlockSink: Send + Sync {
    fn announce(&self, block: &SealedBlock);
}

pub struct LedgerService<P, S> {
    ledger: RwLock<Ledger>,
    generation: AtomicU64,
    peers: P,
    sink: S,
}

impl<P: PeerRegistry, S: BlockSink> LedgerService<P, S> {
    pub fn new(ledger: Ledger, peers: P, sink: S) -> Self {
        Self {
            ledger: RwLock::new(ledger),
            generation: AtomicU64::new(0),
            peers,
            sink,
        }
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    pub fn difficulty(&self) -> u32 {
        self.ledger.read().difficulty()
    }

    pub fn submit_transaction(&self, record: Record) {
        self.ledger.write().add_transaction(record);
    }

    pub fn get_chain(&self) -> ChainSnapshot {
        self.ledger.read().snapshot()
    }

    pub fn get_pending_transactions(&self) -> Vec<Record> {
        self.ledger.read().pending_transactions().to_vec()
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Mine all pending records into one block. Blocks the calling thread
    /// for the whole search; async callers should use `spawn_blocking`.
    pub fn mine(&self) -> Result<MineOutcome, LedgerError> {
        let (mut job, difficulty, started_at) = {
            let mut ledger = self.ledger.write();
            let Some(job) = ledger.prepare_candidate()? else {
                return Ok(MineOutcome::NothingToMine);
            };
            (job, ledger.difficulty(), self.generation.load(Ordering::Acquire))
        };

        let found = proof_of_work_cancellable(job.block_mut(), difficulty, || {
            self.generation.load(Ordering::Acquire) != started_at
        });
        self.finish_mining(job, found, started_at)
    }

    /// Commit or abandon a searched candidate. The generation is checked
    /// again under the lock: the chain may have moved after the last poll.
    fn finish_mining(
        &self,
        job: MiningJob,
        found: Option<String>,
        started_at: u64,
    ) -> Result<MineOutcome, LedgerError> {
        let sealed = {
            let mut ledger = self.ledger.write();
            let hash = match found {
                Some(hash) if self.generation.load(Ordering::Acquire) == started_at => hash,
                _ => {
                    ledger.abandon_candidate(job);
                    return Err(LedgerError::MiningAbandoned);
                }
            };
            ledger.commit_candidate(job, hash)?;
            self.bump_generation();
            ledger.last_block().clone()
        };

        self.sink.announce(&sealed);
        Ok(MineOutcome::Mined {
            index: sealed.index(),
        })
    }

    /// Admit a block announced by a peer.
    pub fn receive_block(&self, block: Block, claimed_hash: String) -> Result<u64, BlockRejection> {
        let mut ledger = self.ledger.write();
        let index = ledger.add_block(block, claimed_hash)?;
        let tip = ledger.chain_length() - 1;
        ledger.prune_committed(tip);
        self.bump_generation();
        Ok(index)
    }

    /// Adopt the longest valid candidate if it beats the local chain.
    ///
    /// Candidates are validated without holding the lock; the length is
    /// checked again before swapping in case the chain grew meanwhile.
    pub fn reconcile<I>(&self, candidates: I) -> Reconciliation
    where
        I: IntoIterator<Item = PeerChain>,
    {
        let candidates: Vec<PeerChain> = candidates.into_iter().collect();
        let expected = self.peer_count();
        if candidates.len() < expected {
            debug!(received = candidates.len(), expected, "not every peer answered");
        }

        let (local_len, difficulty) = {
            let ledger = self.ledger.read();
            (ledger.chain_length(), ledger.difficulty())
        };
        let Some(winner) = select_longest_valid(local_len, difficulty, candidates) else {
            return Reconciliation::Unchanged;
        };

        let mut ledger = self.ledger.write();
        if winner.chain.len() <= ledger.chain_length() {
            info!(peer = %winner.peer, "local chain caught up; keeping it");
            return Reconciliation::Unchanged;
        }
        let outcome = ledger.adopt(winner);
        self.bump_generation();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerConfig;
    use crate::pow::proof_of_work;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct StaticPeers(Vec<PeerId>);

    impl PeerRegistry for StaticPeers {
        fn peers(&self) -> Vec<PeerId> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<SealedBlock>>);

    impl BlockSink for RecordingSink {
        fn announce(&self, block: &SealedBlock) {
            self.0.lock().push(block.clone());
        }
    }

    fn service() -> LedgerService<StaticPeers, RecordingSink> {
        let ledger = Ledger::new(LedgerConfig {
            difficulty: 1,
            genesis_timestamp: Some(1_600_000_000),
        })
        .unwrap();
        LedgerService::new(
            ledger,
            StaticPeers(vec!["p1".into(), "p2".into()]),
            RecordingSink::default(),
        )
    }

    #[test]
    fn mined_blocks_are_announced() {
        let svc = service();
        svc.submit_transaction(json!({"author": "a", "content": "hi"}));
        assert_eq!(svc.mine(), Ok(MineOutcome::Mined { index: 1 }));
        let announced = svc.sink.0.lock();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0], svc.get_chain().chain[1]);
    }

    #[test]
    fn empty_mine_announces_nothing() {
        let svc = service();
        assert_eq!(svc.mine(), Ok(MineOutcome::NothingToMine));
        assert!(svc.sink.0.lock().is_empty());
    }

    #[test]
    fn received_block_prunes_matching_pending() {
        let svc = service();
        svc.submit_transaction(json!("shared"));
        svc.submit_transaction(json!("mine only"));
        let tip = svc.get_chain().chain[0].hash().to_string();
        let mut block = Block::new(1, vec![json!("shared")], 1_600_000_010, tip);
        let hash = proof_of_work(&mut block, 1);
        assert_eq!(svc.receive_block(block, hash), Ok(1));
        assert_eq!(svc.get_pending_transactions(), vec![json!("mine only")]);
    }

    #[test]
    fn unrelated_peer_block_keeps_resubmitted_record() {
        let svc = service();
        svc.submit_transaction(json!("pay 5"));
        svc.mine().unwrap();
        svc.submit_transaction(json!("pay 5"));

        let tip = svc.get_chain().chain[1].hash().to_string();
        let mut block = Block::new(2, vec![json!("unrelated")], 1_600_000_010, tip);
        let hash = proof_of_work(&mut block, 1);
        assert_eq!(svc.receive_block(block, hash), Ok(2));
        assert_eq!(svc.get_pending_transactions(), vec![json!("pay 5")]);
    }

    #[test]
    fn peer_block_cancels_one_duplicate_per_copy() {
        let svc = service();
        svc.submit_transaction(json!("twice"));
        svc.submit_transaction(json!("twice"));
        let tip = svc.get_chain().chain[0].hash().to_string();
        let mut block = Block::new(1, vec![json!("twice")], 1_600_000_010, tip);
        let hash = proof_of_work(&mut block, 1);
        svc.receive_block(block, hash).unwrap();
        assert_eq!(svc.get_pending_transactions(), vec![json!("twice")]);
    }

    #[test]
    fn received_block_bumps_generation() {
        let svc = service();
        let tip = svc.get_chain().chain[0].hash().to_string();
        let mut block = Block::new(1, vec![], 1_600_000_010, tip);
        let hash = proof_of_work(&mut block, 1);
        svc.receive_block(block, hash).unwrap();
        assert_eq!(svc.generation.load(Ordering::Acquire), 1);
    }

    #[test]
    fn rejected_peer_block_leaves_state_alone() {
        let svc = service();
        let block = Block::new(1, vec![], 1_600_000_010, "not the tip");
        assert!(svc.receive_block(block, "0".repeat(64)).is_err());
        assert_eq!(svc.get_chain().length, 1);
        assert_eq!(svc.generation.load(Ordering::Acquire), 0);
    }

    #[test]
    fn chain_change_preempts_mining() {
        // Difficulty 64 never completes; only preemption ends the search.
        let ledger = Ledger::new(LedgerConfig {
            difficulty: 64,
            genesis_timestamp: Some(1_600_000_000),
        })
        .unwrap();
        let svc = LedgerService::new(ledger, StaticPeers::default(), RecordingSink::default());
        svc.submit_transaction(json!("a"));

        std::thread::scope(|s| {
            let miner = s.spawn(|| svc.mine());
            while !svc.get_pending_transactions().is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            svc.submit_transaction(json!("b"));
            svc.bump_generation();
            assert_eq!(miner.join().unwrap(), Err(LedgerError::MiningAbandoned));
        });

        assert_eq!(svc.get_pending_transactions(), vec![json!("a"), json!("b")]);
        assert_eq!(svc.get_chain().length, 1);
        assert!(svc.sink.0.lock().is_empty());
    }

    /// Genesis at 1_600_000_000 and one block carrying "adopted", whose
    /// nonce was searched ahead of time for difficulty 7.
    fn premined_chain() -> Vec<SealedBlock> {
        let genesis = Block::new(0, vec![], 1_600_000_000, "0");
        let genesis_hash = genesis.compute_digest();
        let mut block = Block::new(1, vec![json!("adopted")], 1_600_000_100, genesis_hash.clone());
        block.set_nonce(80_443_785);
        let hash = block.compute_digest();
        vec![genesis.seal(genesis_hash), block.seal(hash)]
    }

    #[test]
    fn consensus_preempts_mining() {
        let peer_chain = premined_chain();
        assert!(crate::validate::is_chain_valid(&peer_chain, 7));

        let ledger = Ledger::new(LedgerConfig {
            difficulty: 7,
            genesis_timestamp: Some(1_600_000_000),
        })
        .unwrap();
        let svc = LedgerService::new(ledger, StaticPeers::default(), RecordingSink::default());
        svc.submit_transaction(json!("a"));

        std::thread::scope(|s| {
            let miner = s.spawn(|| svc.mine());
            while !svc.get_pending_transactions().is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            assert_eq!(
                svc.reconcile([PeerChain::new("p1", peer_chain.clone())]),
                Reconciliation::Replaced {
                    peer: "p1".into(),
                    length: 2
                }
            );
            assert_eq!(miner.join().unwrap(), Err(LedgerError::MiningAbandoned));
        });

        assert_eq!(svc.get_chain().chain, peer_chain);
        assert_eq!(svc.get_pending_transactions(), vec![json!("a")]);
        assert!(svc.sink.0.lock().is_empty());
    }

    #[test]
    fn chain_change_after_last_poll_abandons_candidate() {
        let svc = service();
        svc.submit_transaction(json!("a"));
        let (mut job, started_at) = {
            let mut ledger = svc.ledger.write();
            let job = ledger.prepare_candidate().unwrap().unwrap();
            (job, svc.generation.load(Ordering::Acquire))
        };
        let found = proof_of_work(job.block_mut(), 1);

        // A peer block lands between the search finishing and the commit.
        let tip = svc.get_chain().chain[0].hash().to_string();
        let mut block = Block::new(1, vec![json!("peer")], 1_600_000_010, tip);
        let hash = proof_of_work(&mut block, 1);
        svc.receive_block(block, hash).unwrap();

        assert_eq!(
            svc.finish_mining(job, Some(found), started_at),
            Err(LedgerError::MiningAbandoned)
        );
        assert_eq!(svc.get_pending_transactions(), vec![json!("a")]);
        assert_eq!(svc.get_chain().length, 2);
        assert!(svc.sink.0.lock().is_empty());
    }

    #[test]
    fn reconcile_replaces_with_longer_chain() {
        let svc = service();
        let other = service();
        for i in 0..3 {
            other.submit_transaction(json!(i));
            other.mine().unwrap();
        }
        let outcome = svc.reconcile([PeerChain::from_snapshot("p1", other.get_chain())]);
        assert_eq!(
            outcome,
            Reconciliation::Replaced {
                peer: "p1".into(),
                length: 4
            }
        );
        assert_eq!(svc.get_chain(), other.get_chain());
    }
}
