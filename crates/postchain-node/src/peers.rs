use anyhow::{Context, Result};
use parking_lot::RwLock;
use postchain_core::{BlockSink, ChainSnapshot, PeerChain, PeerId, PeerRegistry, SealedBlock};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, info, warn};

/// Turn `host:port` into a base URL; strips trailing slashes.
pub fn normalize_peer(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Registered peer base URLs, shared between the HTTP layer and the core.
#[derive(Clone, Default)]
pub struct PeerSet {
    inner: Arc<RwLock<BTreeSet<PeerId>>>,
}

impl PeerSet {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = Self::default();
        for peer in peers {
            set.add(peer.as_ref());
        }
        set
    }

    /// Returns true when the peer was not yet known.
    pub fn add(&self, addr: &str) -> bool {
        let peer = normalize_peer(addr);
        if peer == "http://" {
            return false;
        }
        let added = self.inner.write().insert(peer.clone());
        if added {
            info!(%peer, "registered peer");
        }
        added
    }
}

impl PeerRegistry for PeerSet {
    fn peers(&self) -> Vec<PeerId> {
        self.inner.read().iter().cloned().collect()
    }

    fn peer_count(&self) -> usize {
        self.inner.read().len()
    }
}

/// Hands mined blocks to the announcer task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SealedBlock>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SealedBlock>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BlockSink for ChannelSink {
    fn announce(&self, block: &SealedBlock) {
        if self.tx.send(block.clone()).is_err() {
            warn!(index = block.index(), "announcer is gone; block not broadcast");
        }
    }
}

/// HTTP client for talking to other nodes. Every request is timeout-bound.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building peer http client")?;
        Ok(Self { http })
    }

    pub async fn fetch_chain(&self, peer: &str) -> Result<ChainSnapshot> {
        let snapshot = self
            .http
            .get(format!("{peer}/chain"))
            .send()
            .await?
            .error_for_status()?
            .json::<ChainSnapshot>()
            .await?;
        Ok(snapshot)
    }

    /// Fetch every peer's chain concurrently. Peers that fail or time out
    /// are logged and left out.
    pub async fn fetch_chains(&self, peers: Vec<PeerId>) -> Vec<PeerChain> {
        let mut set = JoinSet::new();
        for peer in peers {
            let client = self.clone();
            set.spawn(async move {
                let result = client.fetch_chain(&peer).await;
                (peer, result)
            });
        }

        let mut chains = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((peer, Ok(snapshot))) => {
                    debug!(%peer, length = snapshot.chain.len(), "fetched peer chain");
                    chains.push(PeerChain::from_snapshot(peer, snapshot));
                }
                Ok((peer, Err(err))) => warn!(%peer, error = %err, "could not fetch peer chain"),
                Err(err) => warn!(error = %err, "chain fetch task failed"),
            }
        }
        chains
    }

    pub async fn post_block(&self, peer: &str, block: &SealedBlock) -> Result<()> {
        self.http
            .post(format!("{peer}/add_block"))
            .json(block)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Broadcast each mined block to every registered peer.
pub async fn run_announcer(
    client: PeerClient,
    peers: PeerSet,
    mut rx: mpsc::UnboundedReceiver<SealedBlock>,
) {
    while let Some(block) = rx.recv().await {
        let block = Arc::new(block);
        for peer in peers.peers() {
            let client = client.clone();
            let block = Arc::clone(&block);
            tokio::spawn(async move {
                match client.post_block(&peer, &block).await {
                    Ok(()) => debug!(%peer, index = block.index(), "announced block"),
                    Err(err) => warn!(%peer, index = block.index(), error = %err, "announce failed"),
                }
            });
        }
    }
    debug!("announcer stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn normalize_peer_examples() {
        assert_eq!(normalize_peer("127.0.0.1:8001"), "http://127.0.0.1:8001");
        assert_eq!(normalize_peer("http://node-b:8000/"), "http://node-b:8000");
        assert_eq!(normalize_peer(" https://x.example "), "https://x.example");
    }

    #[test]
    fn peer_set_deduplicates() {
        let peers = PeerSet::new(["a:1", "http://a:1", "b:2"]);
        assert_eq!(peers.peer_count(), 2);
        assert!(!peers.add("a:1/"));
        assert!(!peers.add("  "));
        assert_eq!(peers.peers(), vec!["http://a:1", "http://b:2"]);
    }

    /// An address nothing listens on: bind an ephemeral port, then free it.
    pub(crate) fn closed_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn unreachable_peers_are_skipped() {
        let client = PeerClient::new(Duration::from_millis(300)).unwrap();
        let chains = client
            .fetch_chains(vec![normalize_peer(&closed_addr())])
            .await;
        assert!(chains.is_empty());
    }
}
