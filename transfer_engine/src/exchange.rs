//! Typed handshake payload exchanged once between two schedulers.
//!
//! On the wire the payload is a JSON array with one entry per device context,
//! in local context order:
//!
//! ```json
//! [ { "rdma_info": { "qpn": 17, "psn": 4660, "lid_or_gid": { "lid": 3 }, "mtu": 5, "gidx": null },
//!     "mr_info":   { "buffer#0": { "addr": 140031, "rkey": 8800 } } } ]
//! ```
//!
//! Parsing is strict: missing or unknown fields are rejected with
//! [`RdmaError::MalformedExchange`] before anything reaches queue pair setup.
use std::collections::BTreeMap;

use crate::error::Result;
use crate::error::RdmaError;
use crate::ibverbs_primitives::ConnectionDescriptor;

/// What a peer needs to target one of our registrations with a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteMemoryRegion {
    pub addr: u64,
    pub rkey: u32,
}

/// Exchange entry for one device context.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointInfo {
    pub rdma_info: ConnectionDescriptor,
    pub mr_info: BTreeMap<String, RemoteMemoryRegion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ExchangePayload(pub Vec<EndpointInfo>);

impl ExchangePayload {
    pub fn endpoints(&self) -> &[EndpointInfo] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(RdmaError::MalformedExchange)
    }
}
