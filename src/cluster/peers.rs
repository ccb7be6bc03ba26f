//! Peer directory: which servers exist, per region, and who leads locally.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

/// A known peer server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable node identity of the peer.
    pub id: String,
    /// Address its RPC listener is reachable on.
    pub rpc_addr: SocketAddr,
    /// Address the consensus transport reports for it. Leader lookups key
    /// on this string, so it must match the consensus engine's notion of
    /// the peer's address byte for byte.
    pub raft_addr: String,
    /// Region the peer serves.
    pub region: String,
    /// Major protocol version the peer speaks.
    pub major_version: u8,
}

#[derive(Debug, Default)]
struct Directory {
    by_region: HashMap<String, Vec<Arc<Peer>>>,
    local_by_raft_addr: HashMap<String, Arc<Peer>>,
}

/// Mapping from region name to known peer servers, plus a secondary index
/// from consensus address to peer for servers of the local region.
///
/// One reader-writer lock guards both maps. Readers copy the peer list out
/// before releasing the lock so no lock is held across an RPC.
#[derive(Debug)]
pub struct PeerDirectory {
    local_region: String,
    inner: RwLock<Directory>,
}

impl PeerDirectory {
    /// Create an empty directory for a server in `local_region`.
    pub fn new(local_region: impl Into<String>) -> Self {
        Self {
            local_region: local_region.into(),
            inner: RwLock::new(Directory::default()),
        }
    }

    /// Region this directory considers local.
    pub fn local_region(&self) -> &str {
        &self.local_region
    }

    /// Insert or update a peer. A peer with the same id in the same region
    /// is replaced.
    pub fn insert(&self, peer: Peer) {
        let peer = Arc::new(peer);
        let mut inner = self.inner.write();
        let servers = inner.by_region.entry(peer.region.clone()).or_default();
        match servers.iter_mut().find(|existing| existing.id == peer.id) {
            Some(existing) => *existing = peer.clone(),
            None => servers.push(peer.clone()),
        }
        if peer.region == self.local_region {
            inner
                .local_by_raft_addr
                .insert(peer.raft_addr.clone(), peer);
        }
    }

    /// Remove a peer by region and id.
    pub fn remove(&self, region: &str, id: &str) {
        let mut inner = self.inner.write();
        if let Some(servers) = inner.by_region.get_mut(region) {
            servers.retain(|peer| peer.id != id);
            if servers.is_empty() {
                inner.by_region.remove(region);
            }
        }
        inner
            .local_by_raft_addr
            .retain(|_, peer| !(peer.region == region && peer.id == id));
    }

    /// Copy out the servers known for a region.
    pub fn region_servers(&self, region: &str) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .by_region
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a local-region peer by its consensus transport address.
    pub fn local_peer(&self, raft_addr: &str) -> Option<Arc<Peer>> {
        self.inner.read().local_by_raft_addr.get(raft_addr).cloned()
    }

    /// Pick one server of a region uniformly at random, or `None` when the
    /// region has no known servers.
    pub fn pick_region_server(&self, region: &str) -> Option<Arc<Peer>> {
        let servers = self.region_servers(region);
        if servers.is_empty() {
            return None;
        }
        let offset = rand::rng().random_range(0..servers.len());
        Some(servers[offset].clone())
    }

    /// Names of all regions with at least one known server.
    pub fn regions(&self) -> Vec<String> {
        self.inner.read().by_region.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, region: &str, port: u16) -> Peer {
        Peer {
            id: id.to_string(),
            rpc_addr: ([127, 0, 0, 1], port).into(),
            raft_addr: format!("127.0.0.1:{}", port + 1000),
            region: region.to_string(),
            major_version: 1,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let directory = PeerDirectory::new("east");
        directory.insert(peer("a", "east", 4001));
        directory.insert(peer("b", "west", 4002));

        assert_eq!(directory.region_servers("east").len(), 1);
        assert_eq!(directory.region_servers("west").len(), 1);
        assert!(directory.region_servers("north").is_empty());

        // Only local-region peers are indexed by consensus address.
        assert!(directory.local_peer("127.0.0.1:5001").is_some());
        assert!(directory.local_peer("127.0.0.1:5002").is_none());
    }

    #[test]
    fn insert_replaces_same_id() {
        let directory = PeerDirectory::new("east");
        directory.insert(peer("a", "east", 4001));
        let mut updated = peer("a", "east", 4001);
        updated.major_version = 2;
        directory.insert(updated);

        let servers = directory.region_servers("east");
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].major_version, 2);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let directory = PeerDirectory::new("east");
        directory.insert(peer("a", "east", 4001));
        directory.remove("east", "a");

        assert!(directory.region_servers("east").is_empty());
        assert!(directory.local_peer("127.0.0.1:5001").is_none());
        assert!(directory.regions().is_empty());
    }

    #[test]
    fn pick_region_server_is_uniformish() {
        let directory = PeerDirectory::new("east");
        directory.insert(peer("a", "west", 4001));
        directory.insert(peer("b", "west", 4002));
        directory.insert(peer("c", "west", 4003));

        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(directory.pick_region_server("west").unwrap().id.clone());
        }
        assert_eq!(seen.len(), 3, "all servers should be picked eventually");
        assert!(directory.pick_region_server("nowhere").is_none());
    }
}
