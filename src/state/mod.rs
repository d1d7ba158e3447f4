//! Durable key → JSON document storage.
//!
//! Every component owns exactly one document. A transition is always
//! load → apply one change → compare-and-swap save, so nothing is carried
//! in memory between hook invocations.

mod file;
mod memory;
mod store;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::{
    Document, Revision, StateStore, StoreError, StoreResult, load_typed, modify_document,
    update_document,
};

/// Document keys, one per owner.
pub mod keys {
    pub const MODE_REGISTRY: &str = "mode-registry";
    pub const CIRCUIT_BREAKER: &str = "circuit-breaker";
    pub const TRUST: &str = "trust";
    pub const RALPH: &str = "ralph";
    pub const PIPELINE: &str = "pipeline";
    pub const AUTOPILOT: &str = "autopilot";
    pub const SWARM: &str = "swarm";
    pub const TEAM: &str = "team";
}
