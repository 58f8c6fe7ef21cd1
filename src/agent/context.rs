//! Context store for the decision policy
//!
//! An ordered, append-only sequence of contextual text blocks injected into
//! the decision policy's memory. Blocks are addressed by opaque handles so a
//! single block can be removed later; the whole store can be cleared in one
//! step when the analysis subject changes (backend/session reset).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Opaque handle to one context block, stable for the block's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(u64);

#[derive(Debug, Default)]
struct Inner {
    blocks: Vec<(ContextHandle, String)>,
    next_id: u64,
}

/// Shared, ordered store of context blocks.
///
/// Cloning shares the same underlying store.
///
/// # Example
/// ```
/// use kernelmux::agent::ContextStore;
///
/// let store = ContextStore::new();
/// let handle = store.add("You are analyzing the flights dataset.");
/// assert_eq!(store.len(), 1);
///
/// store.clear_all();
/// assert!(store.is_empty());
/// store.clear_all(); // idempotent when empty
/// # let _ = handle;
/// ```
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<Mutex<Inner>>,
}

impl ContextStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a block and returns its handle.
    pub fn add(&self, text: &str) -> ContextHandle {
        let mut inner = self.lock();
        inner.next_id += 1;
        let handle = ContextHandle(inner.next_id);
        inner.blocks.push((handle, text.to_string()));
        handle
    }

    /// Removes the block behind `handle`. Returns false if it is not (or no
    /// longer) present.
    pub fn remove(&self, handle: ContextHandle) -> bool {
        let mut inner = self.lock();
        let before = inner.blocks.len();
        inner.blocks.retain(|(h, _)| *h != handle);
        inner.blocks.len() != before
    }

    /// Drops every block. Idempotent when the store is already empty.
    pub fn clear_all(&self) {
        self.lock().blocks.clear();
    }

    /// Number of blocks currently held.
    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Returns true when no blocks are held.
    pub fn is_empty(&self) -> bool {
        self.lock().blocks.is_empty()
    }

    /// Snapshot of the block texts in insertion order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock()
            .blocks
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Renders all blocks into one prompt section, blank-line separated.
    pub fn render(&self) -> String {
        self.snapshot().join("\n\n")
    }
}
