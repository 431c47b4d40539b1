//! Peer registry.
//!
//! File tokens are resolved by scanning every peer's catalog. Catalogs are
//! small and peers are few; a reverse index would buy little and would have
//! to chase token rotation.

use crate::peer::{HostedFile, Peer};
use dashmap::DashMap;
use std::sync::Arc;

/// All currently registered peers, keyed by internal peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer.
    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers.insert(peer.id().to_string(), peer);
    }

    /// Look up a peer by id.
    pub fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|p| Arc::clone(&p))
    }

    /// Remove a peer. Returns it if it was present.
    pub fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.remove(peer_id).map(|(_, p)| p)
    }

    /// Resolve a file token to its hosting peer and catalog entry.
    pub fn resolve_file(&self, file_token: &str) -> Option<(Arc<Peer>, HostedFile)> {
        self.peers.iter().find_map(|entry| {
            entry
                .value()
                .find_file(file_token)
                .map(|file| (Arc::clone(entry.value()), file))
        })
    }

    /// Find the disconnected peer whose current session key matches.
    ///
    /// Connected peers never match: their session key is only redeemable
    /// after a disconnect, so a stolen key is useless while the owner holds
    /// the channel.
    pub fn find_restorable(&self, session_key: &str) -> Option<Arc<Peer>> {
        self.peers.iter().find_map(|entry| {
            let peer = entry.value();
            (peer.is_waiting() && peer.matches_session_key(session_key))
                .then(|| Arc::clone(peer))
        })
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Total hosted files across all peers.
    pub fn file_count(&self) -> usize {
        self.peers.iter().map(|entry| entry.value().file_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeysConfig;
    use crate::pipe::TaskGuard;
    use crate::protocol::FileDeclaration;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn peer(id: &str) -> Arc<Peer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Peer::new(
            id.to_string(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            tx,
        ))
    }

    #[test]
    fn insert_get_remove() {
        let registry = PeerRegistry::new();
        registry.insert(peer("a"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_some());
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn resolves_file_tokens_across_peers() {
        let registry = PeerRegistry::new();
        let a = peer("a");
        let b = peer("b");
        let tokens = b
            .accept_files(
                vec![FileDeclaration {
                    name: "movie.mp4".into(),
                    size: 100,
                }],
                &KeysConfig::default(),
            )
            .unwrap();
        registry.insert(a);
        registry.insert(Arc::clone(&b));

        let (owner, file) = registry.resolve_file(&tokens[0].id).unwrap();
        assert_eq!(owner.id(), "b");
        assert_eq!(file.name, "movie.mp4");
        assert!(registry.resolve_file("missing").is_none());
        assert_eq!(registry.file_count(), 1);
    }

    #[tokio::test]
    async fn only_waiting_peers_are_restorable() {
        let registry = PeerRegistry::new();
        let p = peer("a");
        let key = p.mint_session_key(&KeysConfig::default()).unwrap();
        registry.insert(Arc::clone(&p));

        // Still connected: the key must not be redeemable.
        assert!(registry.find_restorable(&key).is_none());

        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        p.detach(TaskGuard::new(task.abort_handle()));
        let restored = registry.find_restorable(&key).unwrap();
        assert_eq!(restored.id(), "a");
        assert!(registry.find_restorable("wrong-key").is_none());
    }
}
