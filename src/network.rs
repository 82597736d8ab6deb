//! CAIP-2 network identifiers for EVM chains.
//!
//! Payment claims name their network as `eip155:<decimal chain id>`, e.g. `eip155:43114` for
//! Avalanche C-Chain. [`Eip155Network`] is the parsed form; it only admits the exact two-part
//! shape with a positive decimal chain id.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// CAIP-2 namespace for EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// An EVM network resolved from a CAIP-2 identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eip155Network {
    chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkParseError {
    #[error("network must be CAIP-2 format eip155:<chain_id>, got {0:?}")]
    Format(String),
    #[error("invalid chain id in network {0:?}")]
    ChainId(String),
}

impl Eip155Network {
    pub fn new(chain_id: u64) -> Self {
        Self { chain_id }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

impl fmt::Display for Eip155Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", EIP155_NAMESPACE, self.chain_id)
    }
}

impl FromStr for Eip155Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split(':').collect();
        let [namespace, reference] = parts.as_slice() else {
            return Err(NetworkParseError::Format(s.to_string()));
        };
        if *namespace != EIP155_NAMESPACE {
            return Err(NetworkParseError::Format(s.to_string()));
        }
        if reference.is_empty() || !reference.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NetworkParseError::ChainId(s.to_string()));
        }
        match reference.parse::<u64>() {
            Ok(chain_id) if chain_id > 0 => Ok(Self { chain_id }),
            _ => Err(NetworkParseError::ChainId(s.to_string())),
        }
    }
}

impl Serialize for Eip155Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eip155Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Eip155Network::from_str(&s).map_err(de::Error::custom)
    }
}
