//! Coordination service access
//!
//! A hierarchical key store with session-bound ephemeral nodes. Backs the
//! leader lock and every persisted record.

pub mod client;
pub mod etcd;
pub mod memory;

pub use client::{ConnectionState, CoordinationClient, SessionId};
pub use etcd::EtcdCoordination;
pub use memory::{MemoryCoordination, MemoryEnsemble};
