// Ordered Queue
//
// The ordered, duplicate-free collection of waiting participants.
// This module is pure: no locking and no persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod store;

/// One queued participant.
///
/// Elements are never mutated in place; reordering moves the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub metadata: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Element {
    pub fn new(
        id: impl Into<String>,
        metadata: impl Into<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            metadata: metadata.into(),
            enqueued_at,
        }
    }
}

/// Domain errors of the ordered queue. None of these are retryable.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("{id} already queued at position {position} since {since}")]
    AlreadyExists {
        id: String,
        position: usize,
        since: DateTime<Utc>,
    },

    #[error("queue is empty")]
    Empty,

    #[error("no element at position {position} (size {size})")]
    NoSuchElement { position: usize, size: usize },

    #[error("{0} is not in the queue")]
    NotFound(String),
}

#[derive(Debug, Default, Clone)]
pub struct OrderedQueue {
    elements: Vec<Element>,
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    /// Rebuild a queue from a recovered snapshot.
    ///
    /// A snapshot with repeated ids keeps the first occurrence only, so the
    /// uniqueness invariant holds even for hand-edited files.
    pub fn from_elements(elements: Vec<Element>) -> Self {
        let mut queue = Self::new();
        for element in elements {
            if let Err(err) = queue.put(element) {
                debug!(%err, "dropping duplicate element from snapshot");
            }
        }
        queue
    }

    /// Append at the tail and return the new position.
    pub fn put(&mut self, element: Element) -> Result<usize, QueueError> {
        if let Some(position) = self.elements.iter().position(|e| e.id == element.id) {
            return Err(QueueError::AlreadyExists {
                id: element.id,
                position,
                since: self.elements[position].enqueued_at,
            });
        }

        debug!(id = %element.id, "put");
        self.elements.push(element);
        Ok(self.elements.len() - 1)
    }

    pub fn take_front(&mut self) -> Result<Element, QueueError> {
        if self.elements.is_empty() {
            return Err(QueueError::Empty);
        }
        Ok(self.elements.remove(0))
    }

    pub fn take(&mut self, position: usize) -> Result<Element, QueueError> {
        self.check_bounds(position)?;
        Ok(self.elements.remove(position))
    }

    pub fn get(&self, position: usize) -> Result<Element, QueueError> {
        self.check_bounds(position)?;
        Ok(self.elements[position].clone())
    }

    pub fn remove(&mut self, position: usize) -> Result<(), QueueError> {
        self.take(position).map(|_| ())
    }

    /// Relocate the element at `from` so that it lands at index `to`.
    ///
    /// `to` is interpreted after the element has been removed from `from`.
    pub fn move_element(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
        self.check_bounds(from)?;
        self.check_bounds(to)?;
        if from == to {
            return Ok(());
        }

        debug!(from, to, "move");
        let element = self.elements.remove(from);
        self.elements.insert(to, element);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<usize, QueueError> {
        self.elements
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Element> {
        self.elements.clone()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn size(&self) -> usize {
        self.elements.len()
    }

    fn check_bounds(&self, position: usize) -> Result<(), QueueError> {
        if position >= self.elements.len() {
            return Err(QueueError::NoSuchElement {
                position,
                size: self.elements.len(),
            });
        }
        Ok(())
    }
}
