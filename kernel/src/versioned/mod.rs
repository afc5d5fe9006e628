// Versioned Queue
//
// Optimistic concurrency over an ordered queue. Every observable state is
// stamped with a sequence number; positional mutations must present the
// sequence they observed and are rejected when it is stale.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::queue::store::{SnapshotStore, StoreError};
use crate::queue::{Element, OrderedQueue, QueueError};

/// Version stamp of a queue state.
pub type Sequence = u64;

/// A mutation was presented with a sequence that is no longer current.
///
/// Retryable: re-read the queue to obtain `current`, then retry.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq, Serialize)]
#[error("version conflict: attempted {attempted} for current version {current}")]
pub struct VersionError {
    pub current: Sequence,
    pub attempted: Sequence,
}

/// Errors of version-checked operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VersionedError {
    #[error(transparent)]
    Conflict(#[from] VersionError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl VersionedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VersionedError::Conflict(_))
    }

    pub fn as_conflict(&self) -> Option<&VersionError> {
        match self {
            VersionedError::Conflict(conflict) => Some(conflict),
            VersionedError::Queue(_) => None,
        }
    }
}

/// A result paired with the sequence number it was observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamped<T> {
    pub value: T,
    pub sequence: Sequence,
}

#[derive(Debug, Default)]
struct Inner {
    queue: OrderedQueue,
    sequence: Sequence,
}

impl Inner {
    fn check(&self, attempted: Sequence) -> Result<(), VersionError> {
        if attempted != self.sequence {
            warn!(attempted, current = self.sequence, "sequence mismatch");
            return Err(VersionError {
                current: self.sequence,
                attempted,
            });
        }
        Ok(())
    }

    fn stamp<T>(&self, value: T) -> Stamped<T> {
        Stamped {
            value,
            sequence: self.sequence,
        }
    }
}

/// Thread-safe queue for concurrent and asynchronous modification.
///
/// `put` and `take_front` are blind writes. `take`, `remove` and
/// `move_element` require the caller's last observed sequence. Every
/// mutation attempt that reaches the queue bumps the sequence by one, even
/// when the queue rejects it; the one exception is `take_front` on an empty
/// queue. `get` is version-checked like the mutations but never bumps.
pub struct VersionedQueue {
    inner: Mutex<Inner>,
    store: Option<Box<dyn SnapshotStore>>,
}

impl VersionedQueue {
    pub fn new(store: Option<Box<dyn SnapshotStore>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            store,
        }
    }

    /// A queue without persistence.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn with_store<S: SnapshotStore + 'static>(store: S) -> Self {
        Self::new(Some(Box::new(store)))
    }

    pub fn put(&self, element: Element) -> Stamped<Result<usize, QueueError>> {
        let mut inner = self.lock();
        let result = inner.queue.put(element);
        inner.sequence += 1;
        if result.is_ok() {
            self.persist(&inner.queue);
        }
        inner.stamp(result)
    }

    pub fn take_front(&self) -> Stamped<Result<Element, QueueError>> {
        let mut inner = self.lock();
        let result = inner.queue.take_front();
        if result.is_ok() {
            inner.sequence += 1;
            self.persist(&inner.queue);
        }
        inner.stamp(result)
    }

    pub fn take(
        &self,
        position: usize,
        sequence: Sequence,
    ) -> Stamped<Result<Element, VersionedError>> {
        let mut inner = self.lock();
        if let Err(conflict) = inner.check(sequence) {
            return inner.stamp(Err(conflict.into()));
        }
        let result = inner.queue.take(position);
        inner.sequence += 1;
        if result.is_ok() {
            self.persist(&inner.queue);
        }
        inner.stamp(result.map_err(Into::into))
    }

    /// Version-checked read. A stale sequence is rejected so that callers
    /// acting on the element do so against the state they observed.
    pub fn get(
        &self,
        position: usize,
        sequence: Sequence,
    ) -> Stamped<Result<Element, VersionedError>> {
        let inner = self.lock();
        let result = inner
            .check(sequence)
            .map_err(VersionedError::from)
            .and_then(|()| inner.queue.get(position).map_err(Into::into));
        inner.stamp(result)
    }

    pub fn remove(
        &self,
        position: usize,
        sequence: Sequence,
    ) -> Stamped<Result<(), VersionedError>> {
        let mut inner = self.lock();
        if let Err(conflict) = inner.check(sequence) {
            return inner.stamp(Err(conflict.into()));
        }
        let result = inner.queue.remove(position);
        inner.sequence += 1;
        if result.is_ok() {
            self.persist(&inner.queue);
        }
        inner.stamp(result.map_err(Into::into))
    }

    pub fn move_element(
        &self,
        from: usize,
        to: usize,
        sequence: Sequence,
    ) -> Stamped<Result<(), VersionedError>> {
        let mut inner = self.lock();
        if let Err(conflict) = inner.check(sequence) {
            return inner.stamp(Err(conflict.into()));
        }
        let result = inner.queue.move_element(from, to);
        inner.sequence += 1;
        if result.is_ok() {
            self.persist(&inner.queue);
        }
        inner.stamp(result.map_err(Into::into))
    }

    pub fn find(&self, id: &str) -> Stamped<Result<usize, QueueError>> {
        let inner = self.lock();
        inner.stamp(inner.queue.find(id))
    }

    pub fn list(&self) -> Stamped<Vec<Element>> {
        let inner = self.lock();
        inner.stamp(inner.queue.list())
    }

    pub fn size(&self) -> Stamped<usize> {
        let inner = self.lock();
        inner.stamp(inner.queue.size())
    }

    pub fn sequence(&self) -> Sequence {
        self.lock().sequence
    }

    /// Load the stored snapshot and reset the sequence to zero.
    ///
    /// The sequence is not part of the snapshot, so sequences handed out
    /// before a restart may match again after it.
    pub fn recover(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match &self.store {
            Some(store) => {
                let elements = store.read()?;
                inner.queue = OrderedQueue::from_elements(elements);
                info!(store = store.id(), size = inner.queue.size(), "recovered queue");
            }
            None => info!("in-memory queue, nothing to recover"),
        }
        inner.sequence = 0;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation completes before the guard drops, so a poisoned
        // lock still guards a consistent queue.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, queue: &OrderedQueue) {
        let Some(store) = &self.store else {
            return;
        };
        match store.write(queue.elements()) {
            Ok(()) => debug!(store = store.id(), "persisted"),
            Err(err) if err.is_fatal() => {
                error!(store = store.id(), %err, "snapshot storage failed, terminating");
                std::process::exit(1);
            }
            Err(err) => {
                error!(store = store.id(), %err, "snapshot write failed, keeping in-memory state")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file::FileSnapshotStore;
    use crate::queue::store::InMemorySnapshotStore;
    use chrono::Utc;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    fn element(id: impl Into<String>) -> Element {
        Element::new(id, "", Utc::now())
    }

    fn populated(n: usize) -> VersionedQueue {
        let queue = VersionedQueue::in_memory();
        for i in 0..n {
            queue.put(element(i.to_string())).value.unwrap();
        }
        queue
    }

    fn ids(queue: &VersionedQueue) -> Vec<String> {
        queue.list().value.into_iter().map(|e| e.id).collect()
    }

    #[test]
    fn put_increases_sequence() {
        let queue = VersionedQueue::in_memory();
        assert_eq!(queue.sequence(), 0);

        let stamped = queue.put(element("1"));
        assert_eq!(stamped.value, Ok(0));
        assert_eq!(stamped.sequence, 1);
        assert_eq!(queue.sequence(), 1);
    }

    #[test]
    fn duplicate_put_still_bumps_sequence() {
        let queue = populated(1);
        let before = queue.list();

        let stamped = queue.put(element("0"));

        assert!(matches!(stamped.value, Err(QueueError::AlreadyExists { .. })));
        assert_eq!(stamped.sequence, before.sequence + 1);
        assert_eq!(queue.list().value, before.value);
    }

    #[test]
    fn take_front_increases_sequence() {
        let queue = populated(1);
        let stamped = queue.take_front();

        assert_eq!(stamped.value.unwrap().id, "0");
        assert_eq!(stamped.sequence, 2);
    }

    #[test]
    fn empty_take_front_leaves_sequence() {
        let queue = VersionedQueue::in_memory();
        let stamped = queue.take_front();

        assert_eq!(stamped.value, Err(QueueError::Empty));
        assert_eq!(stamped.sequence, 0);
        assert_eq!(queue.sequence(), 0);
    }

    #[test]
    fn take_with_current_sequence_succeeds() {
        let queue = populated(10);
        let seq = queue.sequence();

        let stamped = queue.take(0, seq);
        assert_eq!(stamped.value.unwrap().id, "0");
        assert_eq!(stamped.sequence, seq + 1);

        let again = queue.take(0, stamped.sequence);
        assert_eq!(again.value.unwrap().id, "1");
        assert_eq!(again.sequence, seq + 2);
    }

    #[test]
    fn stale_sequence_is_rejected_without_effect() {
        let queue = populated(10);
        let seq = queue.sequence();
        let before = ids(&queue);

        for stale in [seq + 1, seq - 1] {
            let take = queue.take(0, stale);
            let remove = queue.remove(0, stale);
            let moved = queue.move_element(0, 3, stale);

            let expected = VersionedError::Conflict(VersionError {
                current: seq,
                attempted: stale,
            });
            assert_eq!(take.value, Err(expected.clone()));
            assert_eq!(remove.value, Err(expected.clone()));
            assert_eq!(moved.value, Err(expected));
            assert_eq!(take.sequence, seq);
            assert_eq!(remove.sequence, seq);
            assert_eq!(moved.sequence, seq);
        }

        assert_eq!(queue.sequence(), seq);
        assert_eq!(ids(&queue), before);
    }

    #[test]
    fn conflicts_are_retryable_and_bounds_errors_are_not() {
        let queue = populated(2);
        let seq = queue.sequence();

        let conflict = queue.remove(0, seq + 7).value.unwrap_err();
        assert!(conflict.is_retryable());
        assert_eq!(
            conflict.as_conflict(),
            Some(&VersionError {
                current: seq,
                attempted: seq + 7
            })
        );

        let stamped = queue.remove(5, seq);
        let bounds = stamped.value.unwrap_err();
        assert!(!bounds.is_retryable());
        assert_eq!(
            bounds,
            VersionedError::Queue(QueueError::NoSuchElement { position: 5, size: 2 })
        );
        assert_eq!(stamped.sequence, seq + 1);
    }

    #[test]
    fn remove_and_move_bump_by_one() {
        let queue = populated(10);
        let seq = queue.sequence();

        let removed = queue.remove(1, seq);
        assert_eq!(removed.value, Ok(()));
        assert_eq!(removed.sequence, seq + 1);

        let moved = queue.move_element(3, 0, removed.sequence);
        assert_eq!(moved.value, Ok(()));
        assert_eq!(moved.sequence, seq + 2);

        assert_eq!(ids(&queue), vec!["4", "0", "2", "3", "5", "6", "7", "8", "9"]);
    }

    #[test]
    fn reads_never_change_sequence() {
        let queue = populated(5);
        let seq = queue.sequence();

        for _ in 0..3 {
            assert_eq!(queue.find("3").value, Ok(3));
            assert_eq!(queue.list().sequence, seq);
            assert_eq!(queue.size(), Stamped { value: 5, sequence: seq });
            assert_eq!(queue.get(2, seq).value.unwrap().id, "2");
        }

        assert_eq!(queue.find("nobody").value, Err(QueueError::NotFound("nobody".into())));
        assert_eq!(queue.sequence(), seq);
    }

    #[test]
    fn get_is_version_checked() {
        let queue = populated(3);
        let seq = queue.sequence();

        let stamped = queue.get(0, seq - 1);
        assert!(stamped.value.unwrap_err().is_retryable());
        assert_eq!(stamped.sequence, seq);
    }

    #[test]
    fn racing_removals_admit_exactly_one() {
        let queue = Arc::new(populated(10));
        let seq = queue.sequence();

        let successes: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    s.spawn(move || queue.remove(0, seq).value.is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(successes, 1);
        assert_eq!(queue.size().value, 9);
        assert_eq!(queue.sequence(), seq + 1);
    }

    #[test]
    fn concurrent_blind_writes_serialize() {
        let queue = VersionedQueue::in_memory();

        thread::scope(|s| {
            for t in 0..4 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..25 {
                        queue.put(element(format!("{t}-{i}"))).value.unwrap();
                    }
                });
            }
        });

        assert_eq!(queue.size().value, 100);
        assert_eq!(queue.sequence(), 100);
    }

    #[test]
    fn successful_mutations_are_persisted() {
        let store = Arc::new(InMemorySnapshotStore::new("memory"));
        let queue = VersionedQueue::with_store(SharedStore(Arc::clone(&store)));

        queue.put(element("a"));
        queue.put(element("b"));
        queue.put(element("a"));
        queue.take_front();
        queue.take_front();
        queue.take_front();

        // Two puts and two takes; the duplicate and the empty take write nothing.
        assert_eq!(store.writes(), 4);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn failed_snapshot_write_keeps_mutation() {
        let queue = VersionedQueue::with_store(DiskFull);

        let put = queue.put(element("a"));
        assert_eq!(put.value, Ok(0));
        assert_eq!(put.sequence, 1);
        queue.put(element("b")).value.unwrap();

        let removed = queue.remove(0, 2);
        assert_eq!(removed.value, Ok(()));
        assert_eq!(removed.sequence, 3);

        assert_eq!(ids(&queue), vec!["b"]);
        assert_eq!(queue.list().sequence, 3);
    }

    #[test]
    fn recover_round_trip_resets_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        let queue = VersionedQueue::with_store(FileSnapshotStore::new(&path));
        queue.recover().unwrap();
        for i in 0..100 {
            queue.put(element(i.to_string()));
        }
        let seq = queue.sequence();
        queue.move_element(0, 99, seq).value.unwrap();
        let written = queue.list().value;

        let recovered = VersionedQueue::with_store(FileSnapshotStore::new(&path));
        recovered.recover().unwrap();

        assert_eq!(recovered.list(), Stamped { value: written, sequence: 0 });
    }

    #[test]
    fn recover_without_store_resets_sequence() {
        let queue = populated(3);
        queue.recover().unwrap();

        assert_eq!(queue.sequence(), 0);
        assert_eq!(queue.size().value, 3);
    }

    #[test]
    fn recover_surfaces_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, "garbage").unwrap();

        let queue = VersionedQueue::with_store(FileSnapshotStore::new(&path));
        let err = queue.recover().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    /// Every write fails the way a full disk does.
    struct DiskFull;

    impl SnapshotStore for DiskFull {
        fn id(&self) -> &str {
            "disk-full"
        }

        fn write(&self, _elements: &[Element]) -> Result<(), StoreError> {
            Err(StoreError::Write(io::Error::new(
                io::ErrorKind::Other,
                "no space left on device",
            )))
        }

        fn read(&self) -> Result<Vec<Element>, StoreError> {
            Ok(Vec::new())
        }
    }

    struct SharedStore(Arc<InMemorySnapshotStore>);

    impl SnapshotStore for SharedStore {
        fn id(&self) -> &str {
            self.0.id()
        }

        fn write(&self, elements: &[Element]) -> Result<(), StoreError> {
            self.0.write(elements)
        }

        fn read(&self) -> Result<Vec<Element>, StoreError> {
            self.0.read()
        }
    }
}
