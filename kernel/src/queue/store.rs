// Snapshot Storage Abstraction
//
// Defines the durability contract for a queue's ordered elements.
// The file-backed implementation lives in `adapters::file`.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::Element;

/// Storage failures.
///
/// A missing snapshot is never an error; it reads back as an empty queue.
/// Everything that suggests disk and memory may disagree is fatal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not back up {path:?}: {source}")]
    Backup { path: PathBuf, source: io::Error },

    #[error("could not create {path:?}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("could not open {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("corrupt snapshot {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("could not encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not write snapshot: {0}")]
    Write(#[from] io::Error),
}

impl StoreError {
    /// Whether the process should stop rather than keep serving.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StoreError::Encode(_) | StoreError::Write(_))
    }
}

/// Storage backend for queue snapshots.
///
/// Properties required from implementations:
/// - Full-state writes (the last write wins)
/// - Order preserving
/// - Reading a location that was never written yields an empty list
pub trait SnapshotStore: Send + Sync {
    /// Stable key of this store, typically its location.
    fn id(&self) -> &str;

    /// Replace the stored snapshot with `elements`.
    fn write(&self, elements: &[Element]) -> Result<(), StoreError>;

    /// Load the stored snapshot in order.
    fn read(&self) -> Result<Vec<Element>, StoreError>;
}

/// Volatile store, useful for tests and ephemeral queues that still want
/// snapshot semantics.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    id: String,
    elements: Mutex<Vec<Element>>,
    writes: AtomicUsize,
}

impl InMemorySnapshotStore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Number of snapshots written so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn write(&self, elements: &[Element]) -> Result<(), StoreError> {
        *self.elements.lock().unwrap_or_else(|e| e.into_inner()) = elements.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self) -> Result<Vec<Element>, StoreError> {
        Ok(self
            .elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
