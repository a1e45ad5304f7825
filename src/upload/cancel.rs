use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::file::FileId;

/// Cancellation tokens of the transfers currently running, by file id
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    active: Mutex<HashMap<FileId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FileId, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transfer. `None` when one is already running for `id`.
    pub fn register(&self, id: &FileId) -> Option<CancellationToken> {
        let mut active = self.lock();
        if active.contains_key(id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(id.clone(), token.clone());
        Some(token)
    }

    pub fn release(&self, id: &FileId) {
        self.lock().remove(id);
    }

    /// Cancel the transfer for `id`. Returns whether one was running.
    ///
    /// Idempotent: repeated calls, or calls for unknown ids, do nothing.
    pub fn cancel(&self, id: &FileId) -> bool {
        match self.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let active = self.lock();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub fn is_active(&self, id: &FileId) -> bool {
        self.lock().contains_key(id)
    }
}
