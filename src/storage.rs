use pickle_graph::Object;
use serde::Serialize;
use crate::device::Device;
use crate::dtype::DType;
use crate::checkpoint::LoadError;

/// A tensor storage as referenced by a persistent id:
/// `("storage", <storage class>, key, location, numel)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageRef {
    pub key: String,
    pub storage_module: String,
    pub storage_class: String,
    pub dtype: DType,
    pub device: Device,
    pub numel: u64,
}

impl StorageRef {
    pub fn from_pid(pid: &Object) -> Result<Self, LoadError> {
        let bad = |reason: &str| LoadError::BadStorageError(format!("{reason} in {pid:?}"));
        let items = match pid.as_tuple() {
            Some(items) if items.first().and_then(|x| x.as_str()) == Some("storage") => items,
            _ => return Err(LoadError::UnsupportedPersistentId(format!("{pid:?}"))),
        };
        let [_, class, key, location, numel] = items else {
            return Err(bad("expected 5 fields"));
        };
        let Object::Global { module, name } = class else {
            return Err(bad("storage class is not a global"));
        };
        let key = key.as_str().ok_or_else(|| bad("storage key is not a string"))?;
        let location = location.as_str().ok_or_else(|| bad("location is not a string"))?;
        let numel = numel.as_int().and_then(|n| u64::try_from(n).ok()).ok_or_else(|| bad("bad element count"))?;
        Ok(Self {
            key: key.to_string(),
            storage_module: module.clone(),
            storage_class: name.clone(),
            dtype: DType::from_storage_class(name)?,
            device: location.parse()?,
            numel,
        })
    }

    /// The persistent id for this storage placed on `device`.
    pub fn to_pid(&self, device: &Device) -> Object {
        Object::Tuple(vec![
            Object::unicode("storage"),
            Object::global(&self.storage_module, &self.storage_class),
            Object::Unicode(self.key.clone()),
            Object::Unicode(device.to_string()),
            Object::Int(self.numel as i64),
        ])
    }

    pub fn byte_len(&self) -> u64 {
        self.numel * self.dtype.size() as u64
    }

    /// Archive record holding the raw data, relative to the archive directory.
    pub fn record_name(&self) -> String {
        format!("data/{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(location: &str) -> Object {
        Object::Tuple(vec![
            Object::unicode("storage"),
            Object::global("torch", "HalfStorage"),
            Object::unicode("3"),
            Object::unicode(location),
            Object::Int(12),
        ])
    }

    #[test]
    fn decodes_and_reencodes_persistent_ids() {
        let storage = StorageRef::from_pid(&pid("cuda:0")).unwrap();
        assert_eq!(storage.key, "3");
        assert_eq!(storage.dtype, DType::F16);
        assert_eq!(storage.device.to_string(), "cuda:0");
        assert_eq!(storage.byte_len(), 24);
        assert_eq!(storage.record_name(), "data/3");
        assert_eq!(storage.to_pid(&Device::CPU), pid("cpu"));
    }

    #[test]
    fn rejects_foreign_and_malformed_ids() {
        assert!(matches!(StorageRef::from_pid(&Object::unicode("0")), Err(LoadError::UnsupportedPersistentId(_))));
        let short = Object::Tuple(vec![Object::unicode("storage"), Object::global("torch", "FloatStorage")]);
        assert!(matches!(StorageRef::from_pid(&short), Err(LoadError::BadStorageError(_))));
        let negative = Object::Tuple(vec![
            Object::unicode("storage"),
            Object::global("torch", "FloatStorage"),
            Object::unicode("0"),
            Object::unicode("cpu"),
            Object::Int(-1),
        ]);
        assert!(matches!(StorageRef::from_pid(&negative), Err(LoadError::BadStorageError(_))));
    }
}
