//! Longest-valid-chain reconciliation.
//!
//! Candidates arrive already fetched; this module only decides. A chain is
//! adopted only when it is strictly longer than the local one and passes
//! [`validate_chain`]. Among several such chains the longest wins, and the
//! first one seen wins a tie.

use crate::block::SealedBlock;
use crate::ledger::{ChainSnapshot, Ledger};
use crate::validate::validate_chain;
use tracing::{debug, info, warn};

pub type PeerId = String;

/// A chain offered by one peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerChain {
    pub peer: PeerId,
    pub chain: Vec<SealedBlock>,
}

impl PeerChain {
    pub fn new(peer: impl Into<PeerId>, chain: Vec<SealedBlock>) -> Self {
        Self {
            peer: peer.into(),
            chain,
        }
    }

    /// Build from a peer's `/chain` response. The advertised `length` is
    /// not trusted; only the blocks count.
    pub fn from_snapshot(peer: impl Into<PeerId>, snapshot: ChainSnapshot) -> Self {
        let peer = peer.into();
        if snapshot.length != snapshot.chain.len() {
            warn!(
                %peer,
                advertised = snapshot.length,
                actual = snapshot.chain.len(),
                "peer advertised a wrong chain length"
            );
        }
        Self::new(peer, snapshot.chain)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    Replaced { peer: PeerId, length: usize },
    Unchanged,
}

/// Pick the longest valid candidate strictly longer than `local_len`.
pub fn select_longest_valid<I>(local_len: usize, difficulty: u32, candidates: I) -> Option<PeerChain>
where
    I: IntoIterator<Item = PeerChain>,
{
    let mut best: Option<PeerChain> = None;
    for candidate in candidates {
        let bar = best.as_ref().map_or(local_len, |b| b.chain.len());
        if candidate.chain.len() <= bar {
            debug!(peer = %candidate.peer, length = candidate.chain.len(), "candidate not longer");
            continue;
        }
        match validate_chain(&candidate.chain, difficulty) {
            Ok(()) => best = Some(candidate),
            Err(err) => warn!(peer = %candidate.peer, %err, "discarding invalid candidate chain"),
        }
    }
    best
}

impl Ledger {
    /// Replace the local chain with the best candidate, if any beats it.
    pub fn reconcile<I>(&mut self, candidates: I) -> Reconciliation
    where
        I: IntoIterator<Item = PeerChain>,
    {
        match select_longest_valid(self.chain_length(), self.difficulty(), candidates) {
            Some(winner) => self.adopt(winner),
            None => Reconciliation::Unchanged,
        }
    }

    pub(crate) fn adopt(&mut self, winner: PeerChain) -> Reconciliation {
        let length = winner.chain.len();
        info!(peer = %winner.peer, from = self.chain_length(), to = length, "adopting longer chain");
        self.replace_chain(winner.chain);
        Reconciliation::Replaced {
            peer: winner.peer,
            length,
        }
    }
}
