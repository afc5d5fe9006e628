// File Snapshot Adapter
//
// Persists snapshots to a primary file, rotating the previous primary to a
// `.bak` sibling before every write. Rotation is best effort, not atomic.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::queue::store::{SnapshotStore, StoreError};
use crate::queue::Element;

const BACKUP_SUFFIX: &str = ".bak";

/// Snapshot store backed by a single file.
///
/// Queue snapshots are JSON Lines (one element per line, queue order).
/// Other records, such as the registry state, are a single JSON document.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
    id: String,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path.to_string_lossy().into_owned();
        Self { path, id }
    }

    /// Store for a sub-instance, located at `<this path>-<key>`.
    pub fn derive(&self, key: &str) -> Self {
        Self::new(format!("{}-{}", self.id, key))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut backup = OsString::from(self.path.as_os_str());
        backup.push(BACKUP_SUFFIX);
        PathBuf::from(backup)
    }

    /// Write a single JSON record, rotating the previous one to the backup.
    pub fn write_record<T: Serialize>(&self, record: &T) -> Result<(), StoreError> {
        let mut writer = self.create()?;
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Read a single JSON record. A missing file yields `T::default()`.
    pub fn read_record<T: DeserializeOwned + Default>(&self) -> Result<T, StoreError> {
        let Some(reader) = self.open()? else {
            return Ok(T::default());
        };
        serde_json::from_reader(reader).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn rotate(&self) -> Result<(), StoreError> {
        match fs::rename(&self.path, self.backup_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Backup {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn create(&self) -> Result<BufWriter<File>, StoreError> {
        debug!(path = %self.id, "writing snapshot");
        self.rotate()?;
        let file = File::create(&self.path).map_err(|source| StoreError::Create {
            path: self.path.clone(),
            source,
        })?;
        Ok(BufWriter::new(file))
    }

    fn open(&self) -> Result<Option<BufReader<File>>, StoreError> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.id, "nothing to recover");
                Ok(None)
            }
            Err(source) => Err(StoreError::Open {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn write(&self, elements: &[Element]) -> Result<(), StoreError> {
        let mut writer = self.create()?;
        for element in elements {
            serde_json::to_writer(&mut writer, element)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn read(&self) -> Result<Vec<Element>, StoreError> {
        let Some(reader) = self.open()? else {
            return Ok(Vec::new());
        };
        serde_json::Deserializer::from_reader(reader)
            .into_iter::<Element>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }
}
