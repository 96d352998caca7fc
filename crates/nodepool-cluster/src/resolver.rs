//! Static peer directory backing the `ResolveAddress` RPC.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<String, String>,
}

impl PeerDirectory {
    pub fn new(peers: BTreeMap<String, String>) -> Self {
        Self { peers }
    }

    pub fn resolve(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
