use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque transaction record. The ledger never looks inside it.
pub type Record = Value;

/// Seconds since the unix epoch, or 0 if the clock reads before it.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A candidate block. Everything except the nonce is fixed at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    index: u64,
    transactions: Vec<Record>,
    timestamp: u64,
    previous_hash: String,
    nonce: u64,
}

impl Block {
    pub fn new(
        index: u64,
        transactions: Vec<Record>,
        timestamp: u64,
        previous_hash: impl Into<String>,
    ) -> Self {
        Self {
            index,
            transactions,
            timestamp,
            previous_hash: previous_hash.into(),
            nonce: 0,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn transactions(&self) -> &[Record] {
        &self.transactions
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    pub(crate) fn into_transactions(self) -> Vec<Record> {
        self.transactions
    }

    /// Hex SHA-256 over the canonical JSON form of every field but the hash.
    pub fn compute_digest(&self) -> String {
        self.preimage().digest(self.nonce)
    }

    pub(crate) fn preimage(&self) -> Preimage {
        Preimage::new(self)
    }

    pub(crate) fn seal(self, hash: String) -> SealedBlock {
        SealedBlock { block: self, hash }
    }
}

/// A block bound to its identity hash. There is no way to mutate one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedBlock {
    #[serde(flatten)]
    block: Block,
    hash: String,
}

impl SealedBlock {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn index(&self) -> u64 {
        self.block.index
    }

    pub fn previous_hash(&self) -> &str {
        &self.block.previous_hash
    }

    pub fn transactions(&self) -> &[Record] {
        &self.block.transactions
    }

    /// True when the stored hash still matches the block's contents.
    pub fn is_self_consistent(&self) -> bool {
        self.block.compute_digest() == self.hash
    }

    /// Split a peer-announced block into the candidate and its claimed hash.
    pub fn into_parts(self) -> (Block, String) {
        (self.block, self.hash)
    }
}

/// The serialized digest input with the nonce cut out, so the proof-of-work
/// loop only re-hashes, never re-serializes.
///
/// Keys are written in sorted order: index, nonce, previousHash, timestamp,
/// transactions.
pub(crate) struct Preimage {
    head: Vec<u8>,
    tail: Vec<u8>,
}

impl Preimage {
    fn new(block: &Block) -> Self {
        let head = format!("{{\"index\":{},\"nonce\":", block.index).into_bytes();
        let transactions = Value::Array(block.transactions.iter().map(canonicalize).collect());
        let tail = format!(
            ",\"previousHash\":{},\"timestamp\":{},\"transactions\":{}}}",
            Value::String(block.previous_hash.clone()),
            block.timestamp,
            transactions
        )
        .into_bytes();
        Self { head, tail }
    }

    pub(crate) fn digest(&self, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.head);
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.tail);
        hex::encode(hasher.finalize())
    }
}

/// Rebuild a value with object keys in sorted order at every depth.
pub(crate) fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical compact JSON of a record; used to recognise the same record
/// across blocks and the pending queue.
pub(crate) fn record_key(record: &Record) -> String {
    canonicalize(record).to_string()
}
