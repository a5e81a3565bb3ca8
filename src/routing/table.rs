// Intra-zone routing table — proactive map of peers within the zone

use crate::identity::DeviceId;
use std::collections::HashMap;

/// One way of reaching a peer inside the zone.
#[derive(Debug, Clone)]
pub struct RoutingTableEntry {
    pub peer: DeviceId,
    /// Immediate neighbor that relayed the peer's advertisement
    pub next_hop: DeviceId,
    pub hop_count: u8,
    pub expires_at: u64,
    /// Hop sequence from this device to the peer, next hop first
    pub path: Vec<DeviceId>,
}

/// Multimap of zone peers to the known ways of reaching them.
///
/// Entries are refreshed by advertisements and decay after
/// `lifetime_ms` without one.
pub struct RoutingTable {
    entries: HashMap<DeviceId, Vec<RoutingTableEntry>>,
    zone_radius: u8,
    lifetime_ms: u64,
}

impl RoutingTable {
    pub fn new(zone_radius: u8, lifetime_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            zone_radius,
            lifetime_ms,
        }
    }

    /// Record or refresh a way of reaching `peer`.
    ///
    /// `path` runs from this device toward the peer (next hop first,
    /// peer last). Returns false when the entry violates the zone radius.
    pub fn insert(&mut self, peer: DeviceId, path: Vec<DeviceId>, now: u64) -> bool {
        let hop_count = path.len() as u8;
        if hop_count == 0 || hop_count > self.zone_radius {
            return false;
        }
        let next_hop = path[0];
        let expires_at = now + self.lifetime_ms;

        let ways = self.entries.entry(peer).or_default();
        if let Some(existing) = ways
            .iter_mut()
            .find(|e| e.peer == peer && e.next_hop == next_hop)
        {
            existing.expires_at = expires_at;
            existing.hop_count = hop_count;
            existing.path = path;
        } else {
            ways.push(RoutingTableEntry {
                peer,
                next_hop,
                hop_count,
                expires_at,
                path,
            });
        }
        true
    }

    /// Best unexpired entry for a peer: fewest hops, then most recently
    /// refreshed, then lexicographically-smallest next hop.
    pub fn lookup(&self, peer: &DeviceId, now: u64) -> Option<&RoutingTableEntry> {
        self.entries
            .get(peer)?
            .iter()
            .filter(|e| e.expires_at > now)
            .min_by(|a, b| {
                a.hop_count
                    .cmp(&b.hop_count)
                    .then(b.expires_at.cmp(&a.expires_at))
                    .then(a.next_hop.cmp(&b.next_hop))
            })
    }

    pub fn contains(&self, peer: &DeviceId, now: u64) -> bool {
        self.lookup(peer, now).is_some()
    }

    /// Remove expired entries
    pub fn sweep(&mut self, now: u64) {
        self.entries.retain(|_, ways| {
            ways.retain(|e| e.expires_at > now);
            !ways.is_empty()
        });
    }

    /// Remove every entry routed through a failed neighbor
    pub fn invalidate(&mut self, next_hop: &DeviceId) {
        self.entries.retain(|_, ways| {
            ways.retain(|e| e.next_hop != *next_hop);
            !ways.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|ways| ways.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
