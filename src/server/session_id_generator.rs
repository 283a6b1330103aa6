// Logic to generate unique session IDs

use std::sync::atomic::{AtomicU64, Ordering};

/// Session ID generator, shared by every listener and group
pub struct SessionIdGenerator {
    // Next ID
    next_id: AtomicU64,
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        SessionIdGenerator::new()
    }
}

impl SessionIdGenerator {
    /// Creates new SessionIdGenerator
    pub fn new() -> SessionIdGenerator {
        SessionIdGenerator {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates a new unique ID
    pub fn generate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
