// Shared mesh harness: nodes on a loopback hub with per-node clocks
#![allow(dead_code)]

use std::sync::Arc;
use zonemesh_core::{
    CredentialsStore, Datagrams, DeviceId, KeyPair, LoopbackEndpoint, LoopbackHub, ManualClock,
    MeshConfig, MessageTarget, Network, SendFailure, Transport,
};

pub struct TestNode {
    pub network: Network,
    pub endpoint: LoopbackEndpoint,
    pub clock: Arc<ManualClock>,
    pub keys: KeyPair,
}

pub struct TestMesh {
    pub hub: LoopbackHub,
    pub nodes: Vec<TestNode>,
}

impl TestMesh {
    /// Build `count` nodes that all know each other's credentials.
    /// Links start empty; topology is up to the test.
    pub fn new(count: usize) -> Self {
        let hub = LoopbackHub::new();
        let identities: Vec<(DeviceId, KeyPair)> = (0..count)
            .map(|i| {
                let mut bytes = [0u8; 16];
                bytes[0] = (i + 1) as u8;
                (DeviceId::from_bytes(bytes), KeyPair::generate())
            })
            .collect();

        let nodes = identities
            .iter()
            .map(|(id, keys)| {
                let mut credentials = CredentialsStore::new();
                for (other_id, other_keys) in &identities {
                    credentials
                        .insert_self_signed(*other_id, other_keys)
                        .expect("self-signed credential");
                }
                let clock = ManualClock::new();
                let network = Network::new(
                    *id,
                    keys.clone(),
                    credentials,
                    MeshConfig::default(),
                    clock.clone(),
                );
                TestNode {
                    network,
                    endpoint: hub.endpoint(*id),
                    clock,
                    keys: keys.clone(),
                }
            })
            .collect();

        Self { hub, nodes }
    }

    /// A chain: node 0 — node 1 — ... — node count-1
    pub fn line(count: usize) -> Self {
        let mesh = Self::new(count);
        for i in 0..count.saturating_sub(1) {
            mesh.hub.link(mesh.id(i), mesh.id(i + 1));
        }
        mesh
    }

    pub fn id(&self, i: usize) -> DeviceId {
        self.nodes[i].network.device_id()
    }

    /// Put a node's outbound packets on the air
    pub fn transmit(&self, i: usize, packets: Datagrams) {
        for (target, datagram) in packets {
            match target {
                MessageTarget::Broadcast => self.nodes[i].endpoint.broadcast(&datagram),
                MessageTarget::Single(peer) => self.nodes[i].endpoint.send_to(&peer, &datagram),
            }
        }
    }

    /// One delivery round across all nodes. Returns whether any
    /// datagram was processed.
    pub fn pump_once(&mut self) -> bool {
        let mut moved = false;
        for i in 0..self.nodes.len() {
            let mut inbound = Vec::new();
            while let Some((_, datagram)) = self.nodes[i].endpoint.recv() {
                inbound.push(datagram);
            }
            for datagram in inbound {
                moved = true;
                let outputs = self.nodes[i].network.process_datagram(&datagram);
                self.transmit(i, outputs);
            }
        }
        moved
    }

    /// Pump until the air is quiet
    pub fn settle(&mut self) {
        for _ in 0..256 {
            if !self.pump_once() {
                return;
            }
        }
        panic!("mesh traffic failed to settle");
    }

    /// Tick every node, transmit what that produced, and collect each
    /// node's failure notices.
    pub fn tick_all(&mut self) -> Vec<Vec<SendFailure>> {
        let mut failures = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            let output = self.nodes[i].network.tick();
            self.transmit(i, output.packets);
            failures.push(output.failures);
        }
        failures
    }

    /// Advance every node's clock in lockstep
    pub fn advance_all(&self, ms: u64) {
        for node in &self.nodes {
            node.clock.advance(ms);
        }
    }

    /// Let advertisements circulate until routing tables are warm
    pub fn warm_up(&mut self) {
        self.tick_all();
        self.settle();
    }
}
