//! The validated set of locally supported sub-protocols.
//!
//! The [`ProtocolRegistry`] is a thread-safe map from capability to descriptor.
//! Iteration follows canonical capability order, which is the order the list
//! is advertised in and the order offsets are assigned in.

use crate::error::RegistrationError;
use crate::negotiate::BASE_PROTOCOL_LENGTH;
use crate::protocol::Protocol;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tandem_types::{Capability, RecordEntry};
use tracing::info;

/// Thread-safe registry of local protocol descriptors.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Arc<RwLock<BTreeMap<Capability, Arc<Protocol>>>>,
}

impl ProtocolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a protocol.
    pub fn register(&self, protocol: Protocol) -> Result<(), RegistrationError> {
        let cap = protocol.cap();
        if protocol.length == 0 {
            return Err(RegistrationError::ZeroLength(cap));
        }
        if BASE_PROTOCOL_LENGTH.checked_add(protocol.length).is_none() {
            return Err(RegistrationError::CodeSpaceTooLarge(cap));
        }
        if protocol.handler.is_none() {
            return Err(RegistrationError::MissingHandler(cap));
        }

        let mut protocols = self.protocols.write().unwrap_or_else(|e| e.into_inner());
        if protocols.contains_key(&cap) {
            return Err(RegistrationError::Duplicate(cap));
        }
        info!(cap = %cap, length = protocol.length, "Registered protocol");
        protocols.insert(cap, Arc::new(protocol));
        Ok(())
    }

    /// Remove a protocol. Connections that already negotiated it keep running.
    pub fn unregister(&self, cap: &Capability) -> Option<Arc<Protocol>> {
        let mut protocols = self.protocols.write().unwrap_or_else(|e| e.into_inner());
        protocols.remove(cap)
    }

    /// Get a specific protocol.
    pub fn get(&self, cap: &Capability) -> Option<Arc<Protocol>> {
        let protocols = self.protocols.read().unwrap_or_else(|e| e.into_inner());
        protocols.get(cap).cloned()
    }

    /// Canonical capability list, as advertised in the hello handshake.
    pub fn caps(&self) -> Vec<Capability> {
        let protocols = self.protocols.read().unwrap_or_else(|e| e.into_inner());
        protocols.keys().cloned().collect()
    }

    /// All descriptors in canonical order.
    pub fn snapshot(&self) -> Vec<Arc<Protocol>> {
        let protocols = self.protocols.read().unwrap_or_else(|e| e.into_inner());
        protocols.values().cloned().collect()
    }

    /// Node-record entries of every protocol, in canonical protocol order.
    pub fn record_entries(&self) -> Vec<RecordEntry> {
        let protocols = self.protocols.read().unwrap_or_else(|e| e.into_inner());
        protocols
            .values()
            .flat_map(|p| p.attributes.iter().cloned())
            .collect()
    }

    /// Local metadata keyed by `name/version`, for protocols that provide it.
    pub fn node_info(&self) -> Value {
        let protocols = self.snapshot();
        let mut info = Map::new();
        for proto in protocols {
            if let Some(query) = &proto.node_info {
                info.insert(proto.cap().to_string(), query());
            }
        }
        Value::Object(info)
    }

    pub fn len(&self) -> usize {
        let protocols = self.protocols.read().unwrap_or_else(|e| e.into_inner());
        protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
