//! Single-session admission
//!
//! The backend automation session can serve one submission at a time, so
//! requests are admitted strictly one after another. The permit is a plain
//! async mutex: waiters queue fairly and a dropped guard (including a
//! cancelled handler) releases admission immediately.

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct Admission {
    gate: Mutex<()>,
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of the backend session.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}
