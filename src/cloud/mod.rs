//! Cloud collaborators: the narrow async interfaces the core needs from
//! the key-value store, log service, compute API and object store.
//!
//! Every component receives these as explicit `Arc<dyn …>` handles bundled
//! in [`Backends`]; nothing holds a process-wide client.

pub mod compute;
pub mod kv;
pub mod logs;
pub mod memory;
pub mod objects;

use std::sync::Arc;

pub use compute::{
    ComputeProvider, Instance, InstanceFilter, InstanceState, LaunchRequest, MachineImage,
    MarketType, SpotPrice,
};
pub use kv::{ConditionalWrite, Item, KeySchema, KeyValueStore};
pub use logs::{CreateMode, InputLogEvent, LogEvent, LogPage, LogService};
pub use objects::{ObjectStore, StoreLocation};

/// Handles to every external service used by one job.
#[derive(Clone)]
pub struct Backends {
    pub kv: Arc<dyn KeyValueStore>,
    pub logs: Arc<dyn LogService>,
    pub compute: Arc<dyn ComputeProvider>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Backends {
    /// Fresh in-memory backends.
    pub fn in_memory() -> (Self, memory::MemoryCloud) {
        let cloud = memory::MemoryCloud::new();
        (cloud.backends(), cloud)
    }
}
