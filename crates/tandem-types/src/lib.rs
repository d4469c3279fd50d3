//! Core types for the Tandem sub-protocol multiplexer.
//!
//! This crate defines the shared data structures used by the wire runtime and
//! the CLI: capabilities and their canonical ordering, node identities and
//! addresses, node-record entries, and node configuration. It contains no
//! networking logic.

pub mod capability;
pub mod config;
pub mod node;

pub use capability::{canonicalize, Capability, ParseCapabilityError};
pub use config::NodeConfig;
pub use node::{NodeAddr, NodeId, RecordEntry};
