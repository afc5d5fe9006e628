// Queue Service
//
// Request/response facade over a versioned queue, used by command and
// interaction handlers. Identity resolution is delegated to a `UserLookup`
// and only affects what is reported, never queue order.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::queue::store::{SnapshotStore, StoreError};
use crate::queue::{Element, QueueError};
use crate::versioned::{Sequence, Stamped, VersionError, VersionedError, VersionedQueue};

/// A participant as shown to people.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayUser {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("could not resolve {id}: {reason}")]
pub struct LookupError {
    pub id: String,
    pub reason: String,
}

/// Resolves queued identities for display.
pub trait UserLookup: Send + Sync {
    fn lookup(&self, id: &str) -> Result<DisplayUser, LookupError>;
}

/// Displays identities as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityLookup;

impl UserLookup for IdentityLookup {
    fn lookup(&self, id: &str) -> Result<DisplayUser, LookupError> {
        Ok(DisplayUser {
            id: id.to_string(),
            name: id.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResponse {
    pub position: usize,
    pub already_existed: bool,
    pub timestamp: DateTime<Utc>,
    pub sequence: Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DequeueResponse {
    pub element: Option<Element>,
    pub user: Option<DisplayUser>,
    pub sequence: Sequence,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<VersionedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListResponse {
    pub elements: Vec<Element>,
    pub sequence: Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedUser {
    pub user: DisplayUser,
    pub metadata: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsersResponse {
    pub users: Vec<ListedUser>,
    pub sequence: Sequence,
}

/// Outcome of a versioned mutation that did not fail on bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationResponse {
    pub sequence: Sequence,
    pub conflict: Option<VersionError>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub struct QueueService {
    queue: VersionedQueue,
    users: Arc<dyn UserLookup>,
}

impl fmt::Debug for QueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.queue.size();
        f.debug_struct("QueueService")
            .field("size", &size.value)
            .field("sequence", &size.sequence)
            .finish_non_exhaustive()
    }
}

impl QueueService {
    pub fn new(store: Option<Box<dyn SnapshotStore>>, users: Arc<dyn UserLookup>) -> Self {
        Self {
            queue: VersionedQueue::new(store),
            users,
        }
    }

    pub fn in_memory(users: Arc<dyn UserLookup>) -> Self {
        Self::new(None, users)
    }

    pub fn queue(&self) -> &VersionedQueue {
        &self.queue
    }

    pub fn recover(&self) -> Result<(), StoreError> {
        self.queue.recover()
    }

    /// Append `identity` to the queue. A participant already queued is
    /// reported with their position and original timestamp, not an error.
    pub fn enqueue(&self, identity: &str, metadata: &str) -> Result<EnqueueResponse, QueueError> {
        let now = Utc::now();
        let Stamped { value, sequence } = self.queue.put(Element::new(identity, metadata, now));
        match value {
            Ok(position) => {
                info!(identity, position, sequence, "enqueued");
                Ok(EnqueueResponse {
                    position,
                    already_existed: false,
                    timestamp: now,
                    sequence,
                })
            }
            Err(QueueError::AlreadyExists { position, since, .. }) => {
                info!(identity, position, %since, sequence, "already queued");
                Ok(EnqueueResponse {
                    position,
                    already_existed: true,
                    timestamp: since,
                    sequence,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Serve the front of the queue.
    pub fn dequeue_front(&self) -> Result<DequeueResponse, ServiceError> {
        let Stamped { value, sequence } = self.queue.take_front();
        self.served(value.map_err(Into::into), sequence)
    }

    /// Serve the participant at `position` of the state observed at `sequence`.
    pub fn dequeue_at(
        &self,
        position: usize,
        sequence: Sequence,
    ) -> Result<DequeueResponse, ServiceError> {
        let Stamped { value, sequence } = self.queue.take(position, sequence);
        self.served(value, sequence)
    }

    pub fn list_all(&self) -> ListResponse {
        let Stamped { value, sequence } = self.queue.list();
        ListResponse {
            elements: value,
            sequence,
        }
    }

    /// List with identities resolved. Unresolvable entries are skipped.
    pub fn list_users(&self) -> UsersResponse {
        let ListResponse { elements, sequence } = self.list_all();
        let users = elements
            .into_iter()
            .filter_map(|element| match self.users.lookup(&element.id) {
                Ok(user) => Some(ListedUser {
                    user,
                    metadata: element.metadata,
                    enqueued_at: element.enqueued_at,
                }),
                Err(err) => {
                    error!(%err, sequence, "skipping unresolvable participant");
                    None
                }
            })
            .collect();
        UsersResponse { users, sequence }
    }

    pub fn find(&self, identity: &str) -> Stamped<Result<usize, QueueError>> {
        self.queue.find(identity)
    }

    pub fn remove_at(
        &self,
        position: usize,
        sequence: Sequence,
    ) -> Result<MutationResponse, QueueError> {
        let stamped = self.queue.remove(position, sequence);
        info!(position, attempted = sequence, sequence = stamped.sequence, "remove");
        Self::mutation(stamped)
    }

    pub fn move_at(
        &self,
        from: usize,
        to: usize,
        sequence: Sequence,
    ) -> Result<MutationResponse, QueueError> {
        let stamped = self.queue.move_element(from, to, sequence);
        info!(from, to, attempted = sequence, sequence = stamped.sequence, "move");
        Self::mutation(stamped)
    }

    fn mutation(
        stamped: Stamped<Result<(), VersionedError>>,
    ) -> Result<MutationResponse, QueueError> {
        let conflict = match stamped.value {
            Ok(()) => None,
            Err(VersionedError::Conflict(conflict)) => Some(conflict),
            Err(VersionedError::Queue(err)) => return Err(err),
        };
        Ok(MutationResponse {
            sequence: stamped.sequence,
            conflict,
        })
    }

    fn served(
        &self,
        taken: Result<Element, VersionedError>,
        sequence: Sequence,
    ) -> Result<DequeueResponse, ServiceError> {
        let element = match taken {
            Ok(element) => element,
            Err(err) => {
                info!(%err, sequence, "nothing dequeued");
                return Ok(DequeueResponse {
                    element: None,
                    user: None,
                    sequence,
                    error: Some(err),
                });
            }
        };

        match self.users.lookup(&element.id) {
            Ok(user) => {
                info!(id = %element.id, sequence, "dequeued");
                Ok(DequeueResponse {
                    element: Some(element),
                    user: Some(user),
                    sequence,
                    error: None,
                })
            }
            Err(err) => {
                error!(id = %element.id, %err, sequence, "dequeued unresolvable participant");
                // Goes back at the tail; the original timestamp is kept.
                let id = element.id.clone();
                let requeued = self.queue.put(element);
                match requeued.value {
                    Ok(position) => {
                        info!(%id, position, sequence = requeued.sequence, "requeued")
                    }
                    Err(requeue) => {
                        error!(%id, %requeue, sequence = requeued.sequence, "requeue failed")
                    }
                }
                Err(err.into())
            }
        }
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<VersionedError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}
