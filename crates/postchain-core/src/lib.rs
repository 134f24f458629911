//! Ledger engine for postchain: blocks, proof of work, chain validation and
//! longest-valid-chain consensus.

pub mod block;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod pow;
pub mod service;
pub mod validate;

pub use block::{unix_timestamp, Block, Record, SealedBlock};
pub use consensus::{select_longest_valid, PeerChain, PeerId, Reconciliation};
pub use error::{BlockRejection, ChainError, LedgerError};
pub use ledger::{ChainSnapshot, Ledger, LedgerConfig, MineOutcome, MiningJob};
pub use service::{BlockSink, LedgerService, PeerRegistry};
pub use validate::{is_chain_valid, validate_chain};
