//! Network dispatcher
//!
//! Classifies inbound datagrams by tag, feeds them to the matching
//! handler, and returns the resulting outbound packets as values — the
//! embedder owns the substrate and does the actual transmitting. The
//! dispatcher also owns the routing state: the intra-zone table fed by
//! advertisements, the inter-zone route cache fed by discovery
//! acknowledgements, and the queues of payloads waiting for either.

use crate::config::MeshConfig;
use crate::identity::{CredentialsStore, DeviceId, KeyPair};
use crate::routing::{route_is_valid, DiscoveryEngine, RouteCache, RoutingTable};
use crate::time::RelTimeProvider;
use crate::wire::{
    self, Advertisement, Datagrams, DeliveryFailure, MessageDatagram, MessageTarget,
    RouteDiscovery, RouteDiscoveryAck, TAG_ADVERTISEMENT, TAG_DELIVERY_FAILURE, TAG_MESSAGE,
    TAG_ROUTE_DISCOVERY, TAG_ROUTE_DISCOVERY_ACK,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MessageSendError {
    /// No credential for the destination; acquire one out of band
    #[error("no public key known for the target device")]
    TargetPublicKeyUnknown,
    /// Discovery exhausted without an acknowledgement
    #[error("target unreachable: route discovery timed out")]
    TargetUnreachable,
}

/// A destination gave up on: discovery timed out and these payloads
/// were dropped from the routing queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub destination: DeviceId,
    pub payloads: Vec<Vec<u8>>,
}

/// Everything a `tick` produced: datagrams to transmit and failure
/// notices for the application layer.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub packets: Datagrams,
    pub failures: Vec<SendFailure>,
}

pub struct Network {
    device_id: DeviceId,
    keys: KeyPair,
    config: MeshConfig,
    clock: Arc<dyn RelTimeProvider>,
    credentials: CredentialsStore,
    routing_table: RoutingTable,
    route_cache: RouteCache,
    discovery: DiscoveryEngine,
    /// Application payloads addressed to this device
    incoming: Vec<Vec<u8>>,
    /// Payloads parked per destination until a route is known
    routing_queue: HashMap<DeviceId, VecDeque<Vec<u8>>>,
    /// Recently-dispatched payloads, kept for delivery-failure requeue
    in_flight: HashMap<DeviceId, VecDeque<Vec<u8>>>,
    next_advert_at: u64,
    parse_failures: u64,
}

impl Network {
    pub fn new(
        device_id: DeviceId,
        keys: KeyPair,
        credentials: CredentialsStore,
        config: MeshConfig,
        clock: Arc<dyn RelTimeProvider>,
    ) -> Self {
        let routing_table = RoutingTable::new(config.zone_radius, config.advert_lifetime_ms);
        let route_cache = RouteCache::new(config.route_lifetime_ms);
        let discovery = DiscoveryEngine::new(config.dedup_window, config.discovery_timeout_ms);
        Self {
            device_id,
            keys,
            config,
            clock,
            credentials,
            routing_table,
            route_cache,
            discovery,
            incoming: Vec::new(),
            routing_queue: HashMap::new(),
            in_flight: HashMap::new(),
            next_advert_at: 0,
            parse_failures: 0,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn credentials(&self) -> &CredentialsStore {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialsStore {
        &mut self.credentials
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn route_cache(&self) -> &RouteCache {
        &self.route_cache
    }

    /// Drain payloads delivered to this device
    pub fn take_incoming(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.incoming)
    }

    /// Frames dropped because they would not parse
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Classify an inbound datagram and run the matching handler.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> Datagrams {
        match wire::tag(datagram) {
            Ok(TAG_ADVERTISEMENT) => self.process_advertisement(datagram),
            Ok(TAG_ROUTE_DISCOVERY) => self.process_route_discovery(datagram),
            Ok(TAG_ROUTE_DISCOVERY_ACK) => self.process_route_discovery_ack(datagram),
            Ok(TAG_DELIVERY_FAILURE) => self.process_delivery_failure(datagram),
            Ok(TAG_MESSAGE) => self.process_message_datagram(datagram),
            Ok(other) => {
                trace!(tag = other, "ignoring datagram with unhandled tag");
                Vec::new()
            }
            Err(_) => {
                self.parse_failures += 1;
                Vec::new()
            }
        }
    }

    fn process_advertisement(&mut self, datagram: &[u8]) -> Datagrams {
        let Ok(adv) = wire::decode::<Advertisement>(datagram) else {
            self.parse_failures += 1;
            return Vec::new();
        };
        let now = self.clock.now_ms();

        if adv.origin == self.device_id || adv.hops.contains(&self.device_id) {
            return Vec::new();
        }
        if adv.hops.is_empty() || adv.hops.len() > self.config.zone_radius as usize {
            return Vec::new();
        }
        if adv.hops[0] != adv.origin {
            return Vec::new();
        }

        let Some(origin_key) = self.credentials.lookup(&adv.origin) else {
            debug!(origin = %adv.origin, "dropping advertisement from unknown origin");
            return Vec::new();
        };
        if !KeyPair::verify_with(origin_key, &Advertisement::signable(&adv.origin), &adv.signature)
        {
            warn!(origin = %adv.origin, "dropping advertisement with bad signature");
            return Vec::new();
        }

        // The path from here back to the origin is the hop list reversed:
        // the last appender is our immediate neighbor.
        let path: Vec<DeviceId> = adv.hops.iter().rev().copied().collect();
        self.routing_table.insert(adv.origin, path, now);

        if adv.ttl > 0 && adv.hops.len() < self.config.zone_radius as usize {
            let mut hops = adv.hops;
            hops.push(self.device_id);
            let rebroadcast = Advertisement {
                origin: adv.origin,
                hops,
                ttl: adv.ttl - 1,
                signature: adv.signature,
            };
            if let Ok(datagram) = wire::encode(TAG_ADVERTISEMENT, &rebroadcast) {
                return vec![(MessageTarget::broadcast(), datagram)];
            }
        }
        Vec::new()
    }

    fn process_route_discovery(&mut self, datagram: &[u8]) -> Datagrams {
        let Ok(discovery) = wire::decode::<RouteDiscovery>(datagram) else {
            self.parse_failures += 1;
            return Vec::new();
        };
        let now = self.clock.now_ms();

        if !self.discovery.note_seen(discovery.request_id) {
            return Vec::new();
        }
        if discovery.origin == self.device_id || discovery.route_so_far.is_empty() {
            return Vec::new();
        }

        // Mid-path nodes may not hold the origin's credential; verify
        // when they do, forward on trust otherwise.
        if let Some(origin_key) = self.credentials.lookup(&discovery.origin) {
            let signable = RouteDiscovery::signable(
                &discovery.request_id,
                &discovery.origin,
                &discovery.destination,
            );
            if !KeyPair::verify_with(origin_key, &signable, &discovery.signature) {
                warn!(origin = %discovery.origin, "dropping route discovery with bad signature");
                return Vec::new();
            }
        }

        if discovery.destination == self.device_id {
            let mut route = discovery.route_so_far.clone();
            route.push(self.device_id);
            return self.dispatch_ack(&discovery, route);
        }

        if let Some(entry) = self.routing_table.lookup(&discovery.destination, now) {
            let mut route = discovery.route_so_far.clone();
            route.push(self.device_id);
            route.extend_from_slice(&entry.path);
            return self.dispatch_ack(&discovery, route);
        }

        let hops_used = discovery.route_so_far.len();
        if discovery.ttl > 0
            && hops_used < self.config.max_route_length
            && !discovery.route_so_far.contains(&self.device_id)
        {
            let mut route_so_far = discovery.route_so_far;
            route_so_far.push(self.device_id);
            let rebroadcast = RouteDiscovery {
                request_id: discovery.request_id,
                origin: discovery.origin,
                destination: discovery.destination,
                route_so_far,
                ttl: discovery.ttl - 1,
                signature: discovery.signature,
            };
            if let Ok(datagram) = wire::encode(TAG_ROUTE_DISCOVERY, &rebroadcast) {
                return vec![(MessageTarget::broadcast(), datagram)];
            }
        }
        Vec::new()
    }

    /// Build an acknowledgement for a harvested route and send it toward
    /// the originator along the reversed request path.
    fn dispatch_ack(&self, discovery: &RouteDiscovery, route: Vec<DeviceId>) -> Datagrams {
        if !route_is_valid(
            &route,
            &discovery.origin,
            &discovery.destination,
            self.config.max_route_length,
        ) {
            trace!(request = %discovery.request_id, "not answering discovery with a degenerate route");
            return Vec::new();
        }

        let Some(pos) = route.iter().position(|h| *h == self.device_id) else {
            return Vec::new();
        };
        if pos == 0 {
            return Vec::new();
        }
        let previous_hop = route[pos - 1];

        let signature = self
            .keys
            .sign(&RouteDiscoveryAck::signable(&discovery.request_id, &route));
        let ack = RouteDiscoveryAck {
            request_id: discovery.request_id,
            route,
            signature,
        };
        match wire::encode(TAG_ROUTE_DISCOVERY_ACK, &ack) {
            Ok(datagram) => vec![(MessageTarget::single(previous_hop), datagram)],
            Err(_) => Vec::new(),
        }
    }

    fn process_route_discovery_ack(&mut self, datagram: &[u8]) -> Datagrams {
        let Ok(ack) = wire::decode::<RouteDiscoveryAck>(datagram) else {
            self.parse_failures += 1;
            return Vec::new();
        };
        let now = self.clock.now_ms();

        if ack.route.first() == Some(&self.device_id) {
            let Some(pending) = self.discovery.pending_for(&ack.request_id) else {
                // Unknown or already-answered request; first valid ack wins
                return Vec::new();
            };
            let destination = pending.destination;
            if !route_is_valid(
                &ack.route,
                &self.device_id,
                &destination,
                self.config.max_route_length,
            ) {
                debug!(request = %ack.request_id, "discarding acknowledgement with invalid route");
                return Vec::new();
            }

            self.discovery.take_matching(&ack.request_id);
            self.route_cache.store(ack.route, now);

            let mut packets = Vec::new();
            if let Some(parked) = self.routing_queue.remove(&destination) {
                for payload in parked {
                    match self.queue_message_to(destination, payload) {
                        Ok(more) => packets.extend(more),
                        Err(e) => warn!(destination = %destination, error = %e, "parked payload undeliverable"),
                    }
                }
            }
            return packets;
        }

        // Not ours: relay toward the originator
        if let Some(pos) = ack.route.iter().position(|h| *h == self.device_id) {
            if pos > 0 {
                return vec![(MessageTarget::single(ack.route[pos - 1]), datagram.to_vec())];
            }
        }
        Vec::new()
    }

    fn process_delivery_failure(&mut self, datagram: &[u8]) -> Datagrams {
        let Ok(failure) = wire::decode::<DeliveryFailure>(datagram) else {
            self.parse_failures += 1;
            return Vec::new();
        };

        debug!(
            destination = %failure.destination,
            broken_hop = %failure.broken_hop,
            "delivery failure: invalidating routes"
        );
        self.route_cache.invalidate(&failure.destination);
        self.route_cache.invalidate_via(&failure.broken_hop);
        self.routing_table.invalidate(&failure.broken_hop);

        let mut packets = Vec::new();
        if let Some(affected) = self.in_flight.remove(&failure.destination) {
            for payload in affected {
                match self.queue_message_to(failure.destination, payload) {
                    Ok(more) => packets.extend(more),
                    Err(e) => {
                        warn!(destination = %failure.destination, error = %e, "could not requeue in-flight payload")
                    }
                }
            }
        }
        packets
    }

    fn process_message_datagram(&mut self, datagram: &[u8]) -> Datagrams {
        let Ok(message) = wire::decode::<MessageDatagram>(datagram) else {
            self.parse_failures += 1;
            return Vec::new();
        };
        let now = self.clock.now_ms();

        if message.destination == self.device_id {
            let Some(source_key) = self.credentials.lookup(&message.source) else {
                debug!(source = %message.source, "dropping message from unknown source");
                return Vec::new();
            };
            let signable =
                MessageDatagram::signable(&message.source, &message.destination, &message.payload);
            if !KeyPair::verify_with(source_key, &signable, &message.signature) {
                warn!(source = %message.source, "dropping message with bad signature");
                return Vec::new();
            }
            self.incoming.push(message.payload);
            return Vec::new();
        }

        // In transit: relay toward the destination
        if let Some(next_hop) = self.next_hop_for(&message.destination, now) {
            return vec![(MessageTarget::single(next_hop), datagram.to_vec())];
        }

        // No viable next hop; report the break, naming ourselves
        let signature = self.keys.sign(&DeliveryFailure::signable(
            &message.destination,
            &self.device_id,
        ));
        let failure = DeliveryFailure {
            destination: message.destination,
            broken_hop: self.device_id,
            signature,
        };
        match wire::encode(TAG_DELIVERY_FAILURE, &failure) {
            Ok(datagram) => vec![(MessageTarget::broadcast(), datagram)],
            Err(_) => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send an application payload to a peer, or park it and start a
    /// route discovery when no route is known yet.
    pub fn queue_message_to(
        &mut self,
        destination: DeviceId,
        payload: Vec<u8>,
    ) -> Result<Datagrams, MessageSendError> {
        if self.credentials.lookup(&destination).is_none() {
            return Err(MessageSendError::TargetPublicKeyUnknown);
        }
        if destination == self.device_id {
            self.incoming.push(payload);
            return Ok(Vec::new());
        }

        let now = self.clock.now_ms();
        if let Some(next_hop) = self.next_hop_for(&destination, now) {
            let signable = MessageDatagram::signable(&self.device_id, &destination, &payload);
            let message = MessageDatagram {
                source: self.device_id,
                destination,
                payload: payload.clone(),
                signature: self.keys.sign(&signable),
            };
            let Ok(datagram) = wire::encode(TAG_MESSAGE, &message) else {
                warn!(destination = %destination, "payload too large to wrap, dropping");
                return Ok(Vec::new());
            };
            self.record_in_flight(destination, payload);
            return Ok(vec![(MessageTarget::single(next_hop), datagram)]);
        }

        self.park(destination, payload);
        if self.discovery.is_pending_for(&destination) {
            return Ok(Vec::new());
        }

        let request_id = self.discovery.begin(destination, now);
        let signature = self.keys.sign(&RouteDiscovery::signable(
            &request_id,
            &self.device_id,
            &destination,
        ));
        let discovery = RouteDiscovery {
            request_id,
            origin: self.device_id,
            destination,
            route_so_far: vec![self.device_id],
            ttl: self.config.max_route_length as u8,
            signature,
        };
        match wire::encode(TAG_ROUTE_DISCOVERY, &discovery) {
            Ok(datagram) => Ok(vec![(MessageTarget::broadcast(), datagram)]),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Periodic work: advertise, sweep expiring state, time out
    /// discoveries and report their parked payloads as unreachable.
    pub fn tick(&mut self) -> TickOutput {
        let now = self.clock.now_ms();
        let mut output = TickOutput::default();

        if now >= self.next_advert_at {
            self.next_advert_at = now + self.config.advert_interval_ms;
            let advert = Advertisement {
                origin: self.device_id,
                hops: vec![self.device_id],
                ttl: self.config.zone_radius.saturating_sub(1),
                signature: self.keys.sign(&Advertisement::signable(&self.device_id)),
            };
            if let Ok(datagram) = wire::encode(TAG_ADVERTISEMENT, &advert) {
                output.packets.push((MessageTarget::broadcast(), datagram));
            }
        }

        self.routing_table.sweep(now);
        self.route_cache.sweep(now);

        for pending in self.discovery.expired(now) {
            let payloads: Vec<Vec<u8>> = self
                .routing_queue
                .remove(&pending.destination)
                .map(|queue| queue.into_iter().collect())
                .unwrap_or_default();
            debug!(
                destination = %pending.destination,
                dropped = payloads.len(),
                "route discovery timed out"
            );
            output.failures.push(SendFailure {
                destination: pending.destination,
                payloads,
            });
        }

        output
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Immediate neighbor to hand a datagram for `destination`:
    /// the zone table directly, or the cached route's next waypoint
    /// resolved through the zone table.
    fn next_hop_for(&self, destination: &DeviceId, now: u64) -> Option<DeviceId> {
        if let Some(entry) = self.routing_table.lookup(destination, now) {
            return Some(entry.next_hop);
        }
        let route = self.route_cache.lookup(destination, now)?;
        let position = route.iter().position(|h| *h == self.device_id)?;
        let next_waypoint = route.get(position + 1)?;
        self.routing_table
            .lookup(next_waypoint, now)
            .map(|entry| entry.next_hop)
    }

    fn park(&mut self, destination: DeviceId, payload: Vec<u8>) {
        let queue = self.routing_queue.entry(destination).or_default();
        queue.push_back(payload);
        if queue.len() > self.config.max_parked_payloads {
            queue.pop_front();
            debug!(destination = %destination, "routing queue full, evicted oldest payload");
        }
    }

    fn record_in_flight(&mut self, destination: DeviceId, payload: Vec<u8>) {
        let queue = self.in_flight.entry(destination).or_default();
        queue.push_back(payload);
        if queue.len() > self.config.max_parked_payloads {
            queue.pop_front();
        }
    }
}
