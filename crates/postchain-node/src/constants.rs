pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:8000";
pub(crate) const DEFAULT_PEER_TIMEOUT_MS: u64 = 2_000;
pub(crate) const REQUIRED_TX_FIELDS: [&str; 2] = ["author", "content"];
