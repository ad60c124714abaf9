//! Roster of peers known to the hub. Copy-on-write: readers hold an immutable snapshot.

use std::sync::Arc;

use crate::protocol::PeerIdentity;

/// Online peers in arrival order, self excluded. Never mutated after publication.
pub type RosterSnapshot = Arc<Vec<PeerIdentity>>;

#[derive(Debug, Default)]
pub struct Roster {
    local_name: Option<String>,
    entries: Vec<PeerIdentity>,
    view: RosterSnapshot,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Set the logged-in name; any entry carrying it is purged.
    pub fn set_local_name(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        let before = self.entries.len();
        self.entries.retain(|p| p.display_name != name);
        self.local_name = Some(name);
        self.commit(before != self.entries.len())
    }

    /// Insert or update by connection id. Returns whether the snapshot changed.
    pub fn upsert(&mut self, peer: PeerIdentity) -> bool {
        if self.is_self(&peer) {
            return false;
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|p| p.connection_id == peer.connection_id)
        {
            if *existing == peer {
                return false;
            }
            *existing = peer;
            return self.commit(true);
        }
        // Same name under a new connection id: the peer reconnected.
        self.entries.retain(|p| p.display_name != peer.display_name);
        self.entries.push(peer);
        self.commit(true)
    }

    /// Replace everything with a hub `Users` listing.
    pub fn replace_all(&mut self, peers: impl IntoIterator<Item = PeerIdentity>) -> bool {
        let old = std::mem::take(&mut self.entries);
        for peer in peers {
            if self.is_self(&peer) {
                continue;
            }
            match self
                .entries
                .iter_mut()
                .find(|p| p.connection_id == peer.connection_id || p.display_name == peer.display_name)
            {
                Some(existing) => *existing = peer,
                None => self.entries.push(peer),
            }
        }
        let changed = old != self.entries;
        self.commit(changed)
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<PeerIdentity> {
        let idx = self
            .entries
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        let removed = self.entries.remove(idx);
        self.commit(true);
        Some(removed)
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.entries.is_empty();
        self.entries.clear();
        self.commit(changed)
    }

    /// Online peer with this display name.
    pub fn find_by_name(&self, name: &str) -> Option<&PeerIdentity> {
        self.entries
            .iter()
            .find(|p| p.is_online && p.display_name == name)
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        Arc::clone(&self.view)
    }

    fn is_self(&self, peer: &PeerIdentity) -> bool {
        self.local_name.as_deref() == Some(peer.display_name.as_str())
    }

    fn commit(&mut self, changed: bool) -> bool {
        if changed {
            self.view = Arc::new(
                self.entries
                    .iter()
                    .filter(|p| p.is_online)
                    .cloned()
                    .collect(),
            );
        }
        changed
    }
}
