use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide switch for mutating management operations (uploads,
/// deletes).  Cloned handles share the same flag, so it can be flipped at
/// runtime by whoever owns the configuration.
#[derive(Debug, Clone)]
pub struct ManagementGate(Arc<AtomicBool>);

impl ManagementGate {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::AcqRel)
    }
}
