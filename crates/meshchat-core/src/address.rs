//! Addressing and link identity types
//!
//! An [`Address`] is the mesh's truncated destination hash: 16 opaque bytes
//! shown as lowercase hex with no separators.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{ChatError, Result};

/// Address length in bytes
pub const ADDRESS_LEN: usize = 16;

/// Mesh destination address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Create an address from raw bytes
    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive an address by hashing `material` and truncating
    pub fn derive(material: &[u8]) -> Self {
        let digest = Sha256::digest(material);
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(bytes)
    }

    /// Parse from hex, tolerating surrounding whitespace and either case
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let invalid = |reason: String| ChatError::InvalidAddress {
            input: trimmed.to_string(),
            reason,
        };

        let bytes = hex::decode(trimmed).map_err(|e| invalid(e.to_string()))?;
        let bytes: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            invalid(format!("expected {} bytes, got {}", ADDRESS_LEN, b.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Credential recalled from the mesh stack for an address
///
/// Opaque to the chat core; only the mesh stack interprets the key
/// material. Required before an outbound link can be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    address: Address,
    public_key: Vec<u8>,
}

impl PeerIdentity {
    /// Create an identity for `address` carrying opaque key material
    pub fn new(address: Address, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            public_key: public_key.into(),
        }
    }

    /// Address this identity belongs to
    pub fn address(&self) -> Address {
        self.address
    }

    /// Opaque key material
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

/// Handle to a link created by the mesh stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Physical-layer quality sample for a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    /// Received signal strength (dBm)
    pub rssi: Option<f32>,
    /// Signal-to-noise ratio (dB)
    pub snr: Option<f32>,
}

impl LinkQuality {
    /// Whether either measurement is present
    pub fn is_available(&self) -> bool {
        self.rssi.is_some() || self.snr.is_some()
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "RSSI: {rssi} dBm")?,
            None => write!(f, "RSSI: n/a")?,
        }
        match self.snr {
            Some(snr) => write!(f, ", SNR: {snr} dB"),
            None => write!(f, ", SNR: n/a"),
        }
    }
}
