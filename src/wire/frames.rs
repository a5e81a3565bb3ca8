// Frame bodies for every datagram tag

use crate::identity::DeviceId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TAG_ADVERTISEMENT: u8 = 0x01;
pub const TAG_ROUTE_DISCOVERY: u8 = 0x02;
pub const TAG_ROUTE_DISCOVERY_ACK: u8 = 0x03;
pub const TAG_DELIVERY_FAILURE: u8 = 0x04;
pub const TAG_MESSAGE: u8 = 0x05;
pub const TAG_REGISTRY_HEAD: u8 = 0x10;
pub const TAG_REGISTRY_HASH_REQUEST: u8 = 0x11;
pub const TAG_REGISTRY_HASH_REPLY: u8 = 0x12;
pub const TAG_REGISTRY_ENTRIES: u8 = 0x13;

/// Periodic neighbor announcement, flooded through the local zone.
///
/// `hops` starts as `[origin]` and each rebroadcaster appends itself,
/// so the signature covers the origin only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub origin: DeviceId,
    pub hops: Vec<DeviceId>,
    pub ttl: u8,
    pub signature: Vec<u8>,
}

impl Advertisement {
    /// Bytes covered by the origin's signature
    pub fn signable(origin: &DeviceId) -> Vec<u8> {
        origin.as_bytes().to_vec()
    }
}

/// Route request flooded across zone boundaries.
///
/// `route_so_far` and `ttl` mutate at each hop; the signature covers
/// the immutable prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDiscovery {
    pub request_id: Uuid,
    pub origin: DeviceId,
    pub destination: DeviceId,
    pub route_so_far: Vec<DeviceId>,
    pub ttl: u8,
    pub signature: Vec<u8>,
}

impl RouteDiscovery {
    pub fn signable(request_id: &Uuid, origin: &DeviceId, destination: &DeviceId) -> Vec<u8> {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(request_id.as_bytes());
        buf.extend_from_slice(origin.as_bytes());
        buf.extend_from_slice(destination.as_bytes());
        buf
    }
}

/// Harvested route travelling back toward the discovery originator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDiscoveryAck {
    pub request_id: Uuid,
    pub route: Vec<DeviceId>,
    pub signature: Vec<u8>,
}

impl RouteDiscoveryAck {
    pub fn signable(request_id: &Uuid, route: &[DeviceId]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + route.len() * 16);
        buf.extend_from_slice(request_id.as_bytes());
        for hop in route {
            buf.extend_from_slice(hop.as_bytes());
        }
        buf
    }
}

/// Emitted by a waypoint that could not forward a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub destination: DeviceId,
    pub broken_hop: DeviceId,
    pub signature: Vec<u8>,
}

impl DeliveryFailure {
    pub fn signable(destination: &DeviceId, broken_hop: &DeviceId) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(destination.as_bytes());
        buf.extend_from_slice(broken_hop.as_bytes());
        buf
    }
}

/// An authenticated application payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDatagram {
    pub source: DeviceId,
    pub destination: DeviceId,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MessageDatagram {
    pub fn signable(source: &DeviceId, destination: &DeviceId, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + payload.len());
        buf.extend_from_slice(source.as_bytes());
        buf.extend_from_slice(destination.as_bytes());
        buf.extend_from_slice(payload);
        buf
    }
}

/// Periodic registry head announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHead {
    pub name: String,
    pub head_hash: [u8; 32],
    pub entry_count: u32,
    pub instance_id: Uuid,
}

/// One probe of the binary-search reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHashRequest {
    pub name: String,
    pub request_id: Uuid,
    pub index: u32,
    /// Instance the probe is addressed to; others ignore it
    pub target: Uuid,
}

/// Stateless answer to a hash probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHashReply {
    pub name: String,
    pub request_id: Uuid,
    pub index: u32,
    /// Hash-chain value at `index`, or all zeroes when out of range
    pub hash: [u8; 32],
    pub responder: Uuid,
}

/// Entry transfer from the divergence point onward.
///
/// Entries are individually bincode-serialized so the frame stays
/// agnostic of the registry's value type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntries {
    pub name: String,
    pub starting_index: u32,
    pub entries: Vec<Vec<u8>>,
    pub sender: Uuid,
}
