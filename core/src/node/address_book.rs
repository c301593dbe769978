// Address book — endpoints learned for peers, each with a validity window

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Validity window for addresses we only need for the current session.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct AddressEntry {
    addr: Multiaddr,
    expires_at: Instant,
}

/// Per-peer endpoint store. Entries expire after the TTL they were added with.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<PeerId, Vec<AddressEntry>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record endpoints for a peer. Re-adding an address extends its expiry
    /// if the new TTL outlives the current one.
    pub fn add(&self, peer_id: PeerId, addrs: &[Multiaddr], ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.write();
        let known = entries.entry(peer_id).or_default();

        for addr in addrs {
            match known.iter_mut().find(|entry| &entry.addr == addr) {
                Some(entry) => entry.expires_at = entry.expires_at.max(expires_at),
                None => known.push(AddressEntry {
                    addr: addr.clone(),
                    expires_at,
                }),
            }
        }
    }

    /// Unexpired endpoints for a peer, in insertion order.
    pub fn addresses(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut entries = self.entries.write();

        let Some(known) = entries.get_mut(peer_id) else {
            return Vec::new();
        };
        known.retain(|entry| entry.expires_at > now);

        let addrs = known.iter().map(|entry| entry.addr.clone()).collect();
        if known.is_empty() {
            entries.remove(peer_id);
        }
        addrs
    }

    /// Number of peers with at least one recorded endpoint (expired or not).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
