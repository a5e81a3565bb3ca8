// Transport capability — the substrate is the embedder's problem

use crate::identity::DeviceId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Best-effort delivery to immediate neighbors. The core never calls
/// this itself; the embedder shuttles the packets the core returns.
pub trait Transport {
    /// Hand a datagram to every immediate neighbor
    fn broadcast(&self, datagram: &[u8]);
    /// Hand a datagram to one immediate neighbor
    fn send_to(&self, peer: &DeviceId, datagram: &[u8]);
    /// Next queued inbound datagram, with the neighbor it came from
    fn recv(&self) -> Option<(DeviceId, Vec<u8>)>;
}

#[derive(Default)]
struct HubState {
    links: HashSet<(DeviceId, DeviceId)>,
    inboxes: HashMap<DeviceId, VecDeque<(DeviceId, Vec<u8>)>>,
}

impl HubState {
    fn linked(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.links.contains(&(*a, *b))
    }

    fn deliver(&mut self, from: DeviceId, to: DeviceId, datagram: &[u8]) {
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.push_back((from, datagram.to_vec()));
        }
    }
}

/// In-memory broadcast substrate with explicit adjacency, for tests
/// and simulations. Datagrams only reach directly-linked endpoints,
/// which is exactly the guarantee a radio gives.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and get its endpoint
    pub fn endpoint(&self, id: DeviceId) -> LoopbackEndpoint {
        self.state.lock().unwrap().inboxes.entry(id).or_default();
        LoopbackEndpoint {
            id,
            state: self.state.clone(),
        }
    }

    /// Connect two devices symmetrically
    pub fn link(&self, a: DeviceId, b: DeviceId) {
        let mut state = self.state.lock().unwrap();
        state.links.insert((a, b));
        state.links.insert((b, a));
    }

    /// Sever a link, e.g. to simulate a failed hop
    pub fn unlink(&self, a: DeviceId, b: DeviceId) {
        let mut state = self.state.lock().unwrap();
        state.links.remove(&(a, b));
        state.links.remove(&(b, a));
    }
}

pub struct LoopbackEndpoint {
    id: DeviceId,
    state: Arc<Mutex<HubState>>,
}

impl Transport for LoopbackEndpoint {
    fn broadcast(&self, datagram: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let neighbors: Vec<DeviceId> = state
            .links
            .iter()
            .filter(|(from, _)| *from == self.id)
            .map(|(_, to)| *to)
            .collect();
        for neighbor in neighbors {
            state.deliver(self.id, neighbor, datagram);
        }
    }

    fn send_to(&self, peer: &DeviceId, datagram: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.linked(&self.id, peer) {
            state.deliver(self.id, *peer, datagram);
        }
    }

    fn recv(&self) -> Option<(DeviceId, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .inboxes
            .get_mut(&self.id)?
            .pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(n: u8) -> DeviceId {
        let mut bytes = [0u8; 16];
        bytes[0] = n;
        DeviceId::from_bytes(bytes)
    }

    #[test]
    fn test_broadcast_reaches_linked_neighbors_only() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(make_id(1));
        let b = hub.endpoint(make_id(2));
        let c = hub.endpoint(make_id(3));
        hub.link(make_id(1), make_id(2));

        a.broadcast(&[1, 2, 3]);

        assert_eq!(b.recv(), Some((make_id(1), vec![1, 2, 3])));
        assert_eq!(b.recv(), None);
        assert_eq!(c.recv(), None);
    }

    #[test]
    fn test_send_to_requires_link() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(make_id(1));
        let b = hub.endpoint(make_id(2));

        a.send_to(&make_id(2), &[9]);
        assert_eq!(b.recv(), None);

        hub.link(make_id(1), make_id(2));
        a.send_to(&make_id(2), &[9]);
        assert_eq!(b.recv(), Some((make_id(1), vec![9])));
    }

    #[test]
    fn test_unlink_severs_delivery() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(make_id(1));
        let b = hub.endpoint(make_id(2));
        hub.link(make_id(1), make_id(2));
        hub.unlink(make_id(1), make_id(2));

        a.broadcast(&[1]);
        assert_eq!(b.recv(), None);
    }

    #[test]
    fn test_delivery_preserves_order() {
        let hub = LoopbackHub::new();
        let a = hub.endpoint(make_id(1));
        let b = hub.endpoint(make_id(2));
        hub.link(make_id(1), make_id(2));

        a.send_to(&make_id(2), &[1]);
        a.send_to(&make_id(2), &[2]);

        assert_eq!(b.recv().unwrap().1, vec![1]);
        assert_eq!(b.recv().unwrap().1, vec![2]);
    }
}
