//! Cooperative cancellation hub
//!
//! Running tasks register a cancellation token here; the scheduler and the
//! HTTP edge request cancellation through it. The graph driver observes the
//! token between nodes and at I/O suspension points.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registry of cancellation tokens for in-flight runs
#[derive(Default)]
pub struct CancelHub {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run; returns the token the driver should observe
    pub fn register(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id, token.clone());
        token
    }

    /// Deregister after the run settles
    pub fn deregister(&self, task_id: Uuid) {
        self.tokens.remove(&task_id);
    }

    /// Request cancellation; true when a registered run was signalled
    pub fn request_cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a run is currently registered
    pub fn is_registered(&self, task_id: Uuid) -> bool {
        self.tokens.contains_key(&task_id)
    }
}
