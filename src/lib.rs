// ZoneMesh Core — decentralized mesh communication
//
// "Will this still converge on two radios taped to a fence post?"
//
// Two cooperating cores, no central coordinator:
// - a two-tier routing engine: proactive advertisements inside the
//   zone, reactive route discovery across zones, authenticated
//   message dispatch on top;
// - a replicated signed registry: an append-only log with a
//   deterministic order that converges between replicas through
//   binary-search anti-entropy.
//
// The core is single-threaded and cooperative. It does no I/O of its
// own: time, storage and the broadcast substrate are injected
// capabilities, and every entry point returns the datagrams to
// transmit instead of transmitting them.

pub mod config;
pub mod identity;
pub mod network;
pub mod registry;
pub mod routing;
pub mod storage;
pub mod time;
pub mod transport;
pub mod wire;

pub use config::{MeshConfig, RegistryConfig};
pub use identity::{Attestation, CredentialError, CredentialsStore, DeviceId, KeyPair};
pub use network::{MessageSendError, Network, SendFailure, TickOutput};
pub use registry::{
    EntryKind, Registry, RegistryEntry, RegistryError, RegistryPredicate,
};
pub use storage::{MemoryStorage, SledStorage, StorageBackend};
pub use time::{ManualClock, RelTimeProvider, SystemClock};
pub use transport::{LoopbackEndpoint, LoopbackHub, Transport};
pub use wire::{Datagram, DatagramPacket, Datagrams, MessageTarget, WireError};
