//! In-memory backends for every cloud collaborator.
//!
//! Used by the test suite and by the local simulation mode of the binary.
//! Each backend serialises its operations behind a lock, so conditional
//! writes are atomic the same way a real store's are.

mod compute;
mod kv;
mod logs;
mod objects;

use std::sync::Arc;

pub use compute::MemoryCompute;
pub use kv::MemoryKeyValueStore;
pub use logs::MemoryLogService;
pub use objects::MemoryObjectStore;

use super::Backends;

/// A full set of in-memory backends, with concrete handles kept around so
/// tests and the simulator can drive them directly.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    pub kv: Arc<MemoryKeyValueStore>,
    pub logs: Arc<MemoryLogService>,
    pub compute: Arc<MemoryCompute>,
    pub objects: Arc<MemoryObjectStore>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            kv: self.kv.clone(),
            logs: self.logs.clone(),
            compute: self.compute.clone(),
            objects: self.objects.clone(),
        }
    }
}
