use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use pickle_graph::{disassemble, Object};
use tracing::{debug, info};
use crate::archive::{ArchiveError, TorchArchive};
use crate::device::{Device, DeviceError};
use crate::dtype::DTypeError;
use crate::inspect::{find_tensors, TensorRecord};
use crate::remap::{remap_storages, DeviceChange};
use crate::storage::StorageRef;
use crate::trust::TrustedTypes;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    ArchiveError(#[from] ArchiveError),
    #[error("Pickle error: {0}")]
    PickleError(#[from] pickle_graph::Error),
    #[error("Malformed storage reference: {0}")]
    BadStorageError(String),
    #[error("Unsupported persistent id {0}")]
    UnsupportedPersistentId(String),
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error("Bad storage location: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Storage record data/{0} is missing")]
    MissingStorageError(String),
    #[error("Storage {key} holds {actual} bytes but {expected} are referenced")]
    ShortStorageError { key: String, expected: u64, actual: u64 },
    #[error("Storage {key} is referenced with conflicting types {first} and {second}")]
    ConflictingStorageError { key: String, first: String, second: String },
    #[error("Storage {0} is still on {1} after remapping")]
    RemapIncompleteError(String, Device),
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    ArchiveError(#[from] ArchiveError),
    #[error("Cannot move converted checkpoint into place: {0}")]
    PersistError(std::io::Error),
}

/// What a load may reconstruct and where storages should end up.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub trusted: TrustedTypes,
    pub map_location: Device,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            trusted: TrustedTypes::torch_defaults(),
            map_location: Device::CPU,
        }
    }
}

/// A loaded checkpoint whose storages all sit on `map_location`.
pub struct Checkpoint {
    archive: TorchArchive,
    pickle: Vec<u8>,
    root: Object,
    storages: Vec<StorageRef>,
    changes: Vec<DeviceChange>,
}

impl Checkpoint {
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Self, LoadError> {
        let mut archive = TorchArchive::open(path)?;
        let original = archive.read_pickle()?;
        info!(path = %path.display(), bytes = original.len(), "read checkpoint pickle");

        let (pickle, changes) = remap_storages(&original, &options.trusted, &options.map_location)?;
        let unpickled = pickle_graph::load(&disassemble(&pickle)?, &options.trusted)?;

        let mut storages: Vec<StorageRef> = vec![];
        let mut seen: HashMap<String, usize> = HashMap::new();
        for persistent in &unpickled.persistent {
            let storage = StorageRef::from_pid(&persistent.pid)?;
            if storage.device != options.map_location {
                return Err(LoadError::RemapIncompleteError(storage.key, storage.device));
            }
            match seen.get(&storage.key) {
                Some(&i) => {
                    let first = &storages[i];
                    if first.storage_class != storage.storage_class {
                        return Err(LoadError::ConflictingStorageError {
                            key: storage.key,
                            first: first.storage_class.clone(),
                            second: storage.storage_class,
                        });
                    }
                    // views may reference a storage with a smaller count
                    if storage.numel > first.numel {
                        storages[i].numel = storage.numel;
                    }
                }
                None => {
                    seen.insert(storage.key.clone(), storages.len());
                    storages.push(storage);
                }
            }
        }
        for storage in &storages {
            let actual = archive.record_size(&storage.record_name())?
                .ok_or_else(|| LoadError::MissingStorageError(storage.key.clone()))?;
            if actual < storage.byte_len() {
                return Err(LoadError::ShortStorageError { key: storage.key.clone(), expected: storage.byte_len(), actual });
            }
        }
        info!(storages = storages.len(), remapped = changes.len(), protocol = unpickled.protocol, "loaded checkpoint");

        Ok(Self {
            archive,
            pickle,
            root: unpickled.root,
            storages,
            changes,
        })
    }

    pub fn root(&self) -> &Object {
        &self.root
    }

    /// The (possibly rewritten) `data.pkl` stream.
    pub fn pickle(&self) -> &[u8] {
        &self.pickle
    }

    pub fn storages(&self) -> &[StorageRef] {
        &self.storages
    }

    /// Storages whose location was changed during the load.
    pub fn changes(&self) -> &[DeviceChange] {
        &self.changes
    }

    pub fn tensors(&self) -> Vec<TensorRecord> {
        find_tensors(&self.root)
    }

    pub fn storage_bytes(&mut self, key: &str) -> Result<Vec<u8>, LoadError> {
        Ok(self.archive.read_record(&format!("data/{key}"))?)
    }

    /// Writes the checkpoint to `path`, replacing whatever is there.
    ///
    /// The archive goes to a temporary file next to `path` first and is only
    /// renamed over it once complete, so a failed save leaves nothing behind.
    /// A replaced file keeps its permissions.
    pub fn save(&mut self, path: &Path) -> Result<(), SaveError> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut builder = tempfile::Builder::new();
        builder.prefix(".pth-cpu-").suffix(".tmp");
        // created like any new file, so the umask applies
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o666));
        }
        let mut temp = builder.tempfile_in(parent)?;
        let mut writer = self.archive.write_with_pickle(BufWriter::new(temp.as_file_mut()), &self.pickle)?;
        writer.flush()?;
        drop(writer);
        if let Ok(existing) = std::fs::metadata(path) {
            temp.as_file().set_permissions(existing.permissions())?;
        }
        temp.as_file().sync_all()?;
        debug!(temp = %temp.path().display(), "archive written");
        temp.persist(path).map_err(|e| SaveError::PersistError(e.error))?;
        info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }
}
