//! Device identity — stable identifiers, signing keys, credential bindings

pub mod credentials;
pub mod keys;

pub use credentials::{Attestation, CredentialError, CredentialsStore};
pub use keys::KeyPair;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 128-bit opaque device identifier, stable for the device's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generate a fresh random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell devices apart in logs
        write!(f, "{}", &hex::encode(self.0.as_bytes())[..8])
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}
