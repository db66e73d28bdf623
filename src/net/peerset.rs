//! Concurrent registry of connected peers, partitioned by role.
//!
//! One set-wide RwLock guards all indices; simple over fast is the right
//! trade at peer-count scale. A closed set never reopens.

use super::messages::PeerRole;
use super::peer::Peer;
use crate::types::Hash32;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer already registered: {0}")]
    AlreadyRegistered(String),
    #[error("peer address already registered for role: {0}")]
    AddressAlreadyRegistered(String),
    #[error("peer not registered: {0}")]
    NotRegistered(String),
    #[error("peer set is closed")]
    SetClosed,
    #[error("peer rejected: {0}")]
    Rejected(String),
}

/// Per-role admission hook, e.g. an allowlist of consensus operators.
pub type PeerValidator = Box<dyn Fn(&Peer) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct PeerSetInner {
    peers: HashMap<String, Arc<Peer>>,
    /// Role-scoped remote addresses: one consensus (or ranger) connection
    /// per address.
    cn_addrs: HashSet<String>,
    rn_addrs: HashSet<String>,
    closed: bool,
}

#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<PeerSetInner>,
    validators: RwLock<HashMap<PeerRole, PeerValidator>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_validator(&self, role: PeerRole, validator: PeerValidator) {
        self.validators.write().insert(role, validator);
    }

    pub fn register(&self, peer: Arc<Peer>) -> Result<(), PeerError> {
        if let Some(v) = self.validators.read().get(&peer.role) {
            v(&peer).map_err(PeerError::Rejected)?;
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(PeerError::SetClosed);
        }
        if inner.peers.contains_key(&peer.id) {
            return Err(PeerError::AlreadyRegistered(peer.id.clone()));
        }
        if let Some(addr) = &peer.remote_addr {
            let taken = match peer.role {
                PeerRole::Consensus => !inner.cn_addrs.insert(addr.clone()),
                PeerRole::Ranger => !inner.rn_addrs.insert(addr.clone()),
                _ => false,
            };
            if taken {
                return Err(PeerError::AddressAlreadyRegistered(addr.clone()));
            }
        }
        inner.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<Arc<Peer>, PeerError> {
        let mut inner = self.inner.write();
        let peer = inner.peers.remove(id).ok_or_else(|| PeerError::NotRegistered(id.to_string()))?;
        if let Some(addr) = &peer.remote_addr {
            match peer.role {
                PeerRole::Consensus => {
                    inner.cn_addrs.remove(addr);
                }
                PeerRole::Ranger => {
                    inner.rn_addrs.remove(addr);
                }
                _ => {}
            }
        }
        Ok(peer)
    }

    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn cn_peers(&self) -> Vec<Arc<Peer>> {
        self.peers_with_role(PeerRole::Consensus)
    }

    pub fn rn_peers(&self) -> Vec<Arc<Peer>> {
        self.peers_with_role(PeerRole::Ranger)
    }

    pub fn bridge_peers(&self) -> Vec<Arc<Peer>> {
        self.peers_with_role(PeerRole::Bridge)
    }

    fn peers_with_role(&self, role: PeerRole) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.role == role)
            .cloned()
            .collect()
    }

    /// Peers not yet known to have the block.
    pub fn peers_without_block(&self, hash: &Hash32) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_block(hash))
            .cloned()
            .collect()
    }

    /// Peers not yet known to have the transaction.
    pub fn peers_without_tx(&self, hash: &Hash32) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_tx(hash))
            .cloned()
            .collect()
    }

    /// Highest total difficulty, linear scan.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .max_by_key(|p| p.head().1)
            .cloned()
    }

    /// Disconnect everything and refuse all future registrations.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        for peer in inner.peers.values() {
            peer.disconnect();
        }
        inner.peers.clear();
        inner.cn_addrs.clear();
        inner.rn_addrs.clear();
        inner.closed = true;
    }
}
