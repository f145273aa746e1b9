//! Shared-memory RC channel publication to other on-board processes: a
//! narrow write-only interface with a versioned snapshot so readers never
//! observe torn updates. Implemented in-process (`Arc<RwLock<RcSnapshot>>`)
//! rather than real cross-process shared memory — actual `/dev/shm`
//! mapping is a concern for the external consumer processes this crate
//! doesn't own, and pulling in a memory-mapping crate for it would add a
//! dependency with no effect on the engine's own behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A versioned, immutable view of the most recently accepted RC payload.
#[derive(Debug, Clone, Default)]
pub struct RcSnapshot {
    pub version: u64,
    pub payload: Vec<u8>,
}

/// Write-only publisher held by the uplink pipeline. Readers (external,
/// out of scope) get a cloned, consistent [`RcSnapshot`] via `snapshot()`.
#[derive(Clone)]
pub struct RcChannelPublisher {
    inner: Arc<RwLock<RcSnapshot>>,
    version: Arc<AtomicU64>,
}

impl RcChannelPublisher {
    pub fn new() -> Self {
        RcChannelPublisher {
            inner: Arc::new(RwLock::new(RcSnapshot::default())),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a newly accepted RC payload. Called by the uplink pipeline
    /// after a successful decode (never on a dropped duplicate).
    pub fn publish(&self, payload: &[u8]) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = self.inner.write().expect("rc snapshot lock poisoned");
        guard.version = version;
        guard.payload.clear();
        guard.payload.extend_from_slice(payload);
    }

    pub fn snapshot(&self) -> RcSnapshot {
        self.inner.read().expect("rc snapshot lock poisoned").clone()
    }
}

impl Default for RcChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}
