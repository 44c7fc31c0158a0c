//! Generation tokens for invalidating stale asynchronous results.
//!
//! A channel owns one [`Generation`]. Starting work captures the current
//! [`GenerationToken`]; any later `advance` makes that capture stale, and the
//! result must be dropped when it arrives. Nothing is hard-cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GenerationToken(u64);

impl GenerationToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Monotonic counter shared between a channel and the tasks it spawns.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    current: Arc<AtomicU64>,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.current.load(Ordering::SeqCst))
    }

    /// Invalidate everything issued so far and return the new live token.
    pub fn advance(&self) -> GenerationToken {
        GenerationToken(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.current() == token
    }
}
