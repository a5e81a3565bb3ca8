//! Datagram codec — one tag byte followed by a bincode frame body,
//! with size limits to prevent abuse

pub mod frames;

pub use frames::*;

use crate::identity::DeviceId;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Maximum encoded datagram size: 64 KB
/// This prevents memory exhaustion from malicious oversized frames.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// An encoded datagram as handed to / received from the substrate
pub type Datagram = Vec<u8>;
/// An outbound datagram paired with where it should go
pub type DatagramPacket = (MessageTarget, Datagram);
pub type Datagrams = Vec<DatagramPacket>;

/// Where the substrate should deliver an outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    /// All immediate neighbors
    Broadcast,
    /// One immediate neighbor
    Single(DeviceId),
}

impl MessageTarget {
    pub fn broadcast() -> Self {
        Self::Broadcast
    }

    pub fn single(target: DeviceId) -> Self {
        Self::Single(target)
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("datagram too large: {0} bytes (max {MAX_DATAGRAM_SIZE})")]
    Oversized(usize),
    #[error("malformed frame body: {0}")]
    Malformed(String),
}

/// Serialize a frame body under its tag byte
pub fn encode<T: Serialize>(tag: u8, body: &T) -> Result<Datagram, WireError> {
    let mut datagram = vec![tag];
    bincode::serialize_into(&mut datagram, body).map_err(|e| WireError::Malformed(e.to_string()))?;

    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::Oversized(datagram.len()));
    }
    Ok(datagram)
}

/// Read the classification tag without touching the body
pub fn tag(datagram: &[u8]) -> Result<u8, WireError> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::Oversized(datagram.len()));
    }
    datagram.first().copied().ok_or(WireError::Empty)
}

/// Deserialize the frame body following the tag byte
pub fn decode<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, WireError> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(WireError::Oversized(datagram.len()));
    }
    if datagram.is_empty() {
        return Err(WireError::Empty);
    }
    bincode::deserialize(&datagram[1..]).map_err(|e| WireError::Malformed(e.to_string()))
}
