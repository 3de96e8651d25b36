//! Peer ID ⇄ public key index
//!
//! The reconciler and the policy/relay/ingress subsystems address peers by
//! opaque ID; the WireGuard driver addresses peers by public key. `PeerIndex`
//! is the single place that translation happens, so the two addressing
//! schemes never drift apart (SPEC_FULL.md §3, §4.3).

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Bidirectional, lock-guarded map between peer IDs and base64-encoded
/// public keys.
#[derive(Default)]
pub struct PeerIndex {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    id_to_key: HashMap<String, String>,
    key_to_id: HashMap<String, String>,
}

impl PeerIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for `peer_id`. If `peer_id` was
    /// already present under a different key, the stale reverse mapping is
    /// dropped first.
    pub async fn insert(&self, peer_id: &str, public_key: &str) {
        let mut inner = self.inner.write().await;
        if let Some(old_key) = inner.id_to_key.get(peer_id).cloned() {
            if old_key != public_key {
                inner.key_to_id.remove(&old_key);
            }
        }
        inner.id_to_key.insert(peer_id.to_string(), public_key.to_string());
        inner.key_to_id.insert(public_key.to_string(), peer_id.to_string());
    }

    /// Remove a peer by ID, returning its public key if present.
    pub async fn remove_by_id(&self, peer_id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.id_to_key.remove(peer_id) {
            inner.key_to_id.remove(&key);
            Some(key)
        } else {
            None
        }
    }

    /// Look up a peer's public key by ID.
    pub async fn public_key_for(&self, peer_id: &str) -> Option<String> {
        self.inner.read().await.id_to_key.get(peer_id).cloned()
    }

    /// Look up a peer's ID by public key.
    pub async fn peer_id_for(&self, public_key: &str) -> Option<String> {
        self.inner.read().await.key_to_id.get(public_key).cloned()
    }

    /// Number of indexed peers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.id_to_key.len()
    }

    /// True if the index holds no peers.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every indexed peer ID.
    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.read().await.id_to_key.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_lookup_both_directions() {
        let index = PeerIndex::new();
        index.insert("peer-a", "pubkeyA").await;
        assert_eq!(index.public_key_for("peer-a").await, Some("pubkeyA".to_string()));
        assert_eq!(index.peer_id_for("pubkeyA").await, Some("peer-a".to_string()));
    }

    #[tokio::test]
    async fn reinsert_with_new_key_drops_old_reverse_mapping() {
        let index = PeerIndex::new();
        index.insert("peer-a", "pubkeyA").await;
        index.insert("peer-a", "pubkeyB").await;

        assert_eq!(index.peer_id_for("pubkeyA").await, None);
        assert_eq!(index.peer_id_for("pubkeyB").await, Some("peer-a".to_string()));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn remove_by_id_clears_both_directions() {
        let index = PeerIndex::new();
        index.insert("peer-a", "pubkeyA").await;
        let removed = index.remove_by_id("peer-a").await;
        assert_eq!(removed, Some("pubkeyA".to_string()));
        assert!(index.is_empty().await);
        assert_eq!(index.peer_id_for("pubkeyA").await, None);
    }

    #[tokio::test]
    async fn remove_unknown_id_is_noop() {
        let index = PeerIndex::new();
        assert_eq!(index.remove_by_id("missing").await, None);
    }
}
