// Inter-zone route discovery — request flood, dedup window, pending state

use crate::identity::DeviceId;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Order-preserving LRU set of recently-seen request ids.
///
/// Breaks rebroadcast cycles: a request id that has already passed
/// through this device is never forwarded or answered again while it
/// remains in the window.
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record an id. Returns true when it was not in the window.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// A discovery this device originated and is still waiting on.
#[derive(Debug, Clone)]
pub struct PendingDiscovery {
    pub destination: DeviceId,
    pub started_at: u64,
}

/// Tracks originated discoveries and the request dedup window.
pub struct DiscoveryEngine {
    pending: HashMap<Uuid, PendingDiscovery>,
    window: DedupWindow,
    timeout_ms: u64,
}

impl DiscoveryEngine {
    pub fn new(dedup_window: usize, timeout_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            window: DedupWindow::new(dedup_window),
            timeout_ms,
        }
    }

    /// Start a discovery toward `destination` and return its request id.
    /// The id is marked seen so our own flood cannot loop back.
    pub fn begin(&mut self, destination: DeviceId, now: u64) -> Uuid {
        let request_id = Uuid::new_v4();
        self.window.insert(request_id);
        self.pending.insert(
            request_id,
            PendingDiscovery {
                destination,
                started_at: now,
            },
        );
        request_id
    }

    /// Record an inbound request id. Returns true when it is new.
    pub fn note_seen(&mut self, request_id: Uuid) -> bool {
        self.window.insert(request_id)
    }

    pub fn is_pending_for(&self, destination: &DeviceId) -> bool {
        self.pending.values().any(|p| p.destination == *destination)
    }

    /// Look at the pending discovery an acknowledgement answers,
    /// without claiming it.
    pub fn pending_for(&self, request_id: &Uuid) -> Option<&PendingDiscovery> {
        self.pending.get(request_id)
    }

    /// Claim the pending discovery an acknowledgement answers.
    /// First valid acknowledgement wins; later ones find nothing.
    pub fn take_matching(&mut self, request_id: &Uuid) -> Option<PendingDiscovery> {
        self.pending.remove(request_id)
    }

    /// Drain discoveries that have exceeded the timeout.
    pub fn expired(&mut self, now: u64) -> Vec<PendingDiscovery> {
        let timeout = self.timeout_ms;
        let expired_ids: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.started_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Structural validity of a harvested route: it must start at `origin`,
/// end at `destination`, visit no device twice and respect the length cap.
pub fn route_is_valid(
    route: &[DeviceId],
    origin: &DeviceId,
    destination: &DeviceId,
    max_len: usize,
) -> bool {
    if route.len() < 2 || route.len() > max_len {
        return false;
    }
    if route.first() != Some(origin) || route.last() != Some(destination) {
        return false;
    }
    let unique: HashSet<&DeviceId> = route.iter().collect();
    unique.len() == route.len()
}
