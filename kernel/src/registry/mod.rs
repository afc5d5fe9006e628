// Queue Registry
//
// Independent queues keyed by tenant (typically a chat channel). The set of
// queues is itself persisted as a single record next to the queue snapshots.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::adapters::file::FileSnapshotStore;
use crate::queue::store::{SnapshotStore, StoreError};
use crate::service::{QueueService, UserLookup};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a queue already exists for {0}")]
    AlreadyExists(String),

    #[error("no queue exists for {0}")]
    NotFound(String),
}

/// Persisted description of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: String,
    /// Channel whose members administer this queue, if any.
    pub admin_channel: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    pub queues: Vec<RegistryEntry>,
}

struct Registered {
    admin_channel: Option<String>,
    service: Arc<QueueService>,
}

pub struct QueueRegistry {
    queues: RwLock<BTreeMap<String, Registered>>,
    store: Option<FileSnapshotStore>,
    users: Arc<dyn UserLookup>,
}

impl QueueRegistry {
    /// A registry persisting to `store`, or purely in memory when `None`.
    ///
    /// Each queue created with persistence stores its snapshot at
    /// `<registry path>-<key>`.
    pub fn new(store: Option<FileSnapshotStore>, users: Arc<dyn UserLookup>) -> Self {
        Self {
            queues: RwLock::new(BTreeMap::new()),
            store,
            users,
        }
    }

    pub fn create(
        &self,
        key: &str,
        admin_channel: Option<String>,
    ) -> Result<Arc<QueueService>, RegistryError> {
        let mut queues = self.write();
        if queues.contains_key(key) {
            return Err(RegistryError::AlreadyExists(key.to_string()));
        }

        let service = Arc::new(self.service_for(key));
        queues.insert(
            key.to_string(),
            Registered {
                admin_channel,
                service: Arc::clone(&service),
            },
        );
        info!(key, "created queue");
        self.persist(&queues);
        Ok(service)
    }

    /// Forget a queue. Its snapshot file is left in place.
    pub fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let mut queues = self.write();
        if queues.remove(key).is_none() {
            return Err(RegistryError::NotFound(key.to_string()));
        }
        info!(key, "deleted queue");
        self.persist(&queues);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<QueueService>> {
        self.read().get(key).map(|r| Arc::clone(&r.service))
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn state(&self) -> RegistryState {
        Self::state_of(&self.read())
    }

    /// Rebuild every registered queue from disk.
    ///
    /// A missing registry record is an empty registry. Any other storage
    /// failure is returned and the registry is left unchanged.
    pub fn recover(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            info!("in-memory registry, nothing to recover");
            return Ok(());
        };

        let state: RegistryState = store.read_record()?;
        let mut recovered = BTreeMap::new();
        for entry in state.queues {
            let service = self.service_for(&entry.key);
            service.recover()?;
            info!(key = %entry.key, admin_channel = ?entry.admin_channel, "recovered queue");
            recovered.insert(
                entry.key,
                Registered {
                    admin_channel: entry.admin_channel,
                    service: Arc::new(service),
                },
            );
        }

        info!(queues = recovered.len(), "recovered registry");
        *self.write() = recovered;
        Ok(())
    }

    fn service_for(&self, key: &str) -> QueueService {
        let store = self
            .store
            .as_ref()
            .map(|s| Box::new(s.derive(key)) as Box<dyn SnapshotStore>);
        QueueService::new(store, Arc::clone(&self.users))
    }

    fn state_of(queues: &BTreeMap<String, Registered>) -> RegistryState {
        RegistryState {
            queues: queues
                .iter()
                .map(|(key, r)| RegistryEntry {
                    key: key.clone(),
                    admin_channel: r.admin_channel.clone(),
                })
                .collect(),
        }
    }

    fn persist(&self, queues: &BTreeMap<String, Registered>) {
        let Some(store) = &self.store else {
            return;
        };
        match store.write_record(&Self::state_of(queues)) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                error!(store = store.id(), %err, "registry storage failed, terminating");
                std::process::exit(1);
            }
            Err(err) => error!(store = store.id(), %err, "registry write failed"),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Registered>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Registered>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }
}
