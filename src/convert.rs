use std::path::{Path, PathBuf};
use serde::Serialize;
use tracing::info;
use crate::checkpoint::{Checkpoint, LoadError, LoadOptions, SaveError};
use crate::device::Device;
use crate::dtype::DType;
use crate::inspect::TensorRecord;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    Validation,
    Deserialization,
    Serialization,
}

impl ErrorKind {
    /// Process exit status for a failure of this kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Validation => 2,
            ErrorKind::Deserialization => 3,
            ErrorKind::Serialization => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Model file {0} does not exist")]
    MissingSource(PathBuf),
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("Failed to load {path}: {source}")]
    LoadError { path: PathBuf, source: LoadError },
    #[error("Failed to save {path}: {source}")]
    SaveError { path: PathBuf, source: SaveError },
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::MissingSource(_) | ConvertError::NotAFile(_) => ErrorKind::Validation,
            ConvertError::LoadError { .. } => ErrorKind::Deserialization,
            ConvertError::SaveError { .. } => ErrorKind::Serialization,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StorageReport {
    pub key: String,
    pub dtype: DType,
    pub numel: u64,
    pub original_device: Device,
    pub device: Device,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub storages: Vec<StorageReport>,
    pub remapped: usize,
    pub tensors: Vec<TensorRecord>,
}

#[derive(Copy, Clone, Debug)]
pub enum Stage<'a> {
    Loading(&'a Path),
    Saving(&'a Path),
}

pub fn convert(source: &Path, destination: &Path, options: &LoadOptions) -> Result<ConversionReport, ConvertError> {
    convert_with_progress(source, destination, options, |_| {})
}

/// Loads `source` with every storage moved to `options.map_location` and
/// writes the result to `destination`. `progress` is told when each phase starts.
pub fn convert_with_progress(
    source: &Path,
    destination: &Path,
    options: &LoadOptions,
    mut progress: impl FnMut(Stage),
) -> Result<ConversionReport, ConvertError> {
    if !source.exists() {
        return Err(ConvertError::MissingSource(source.to_path_buf()));
    }
    if !source.is_file() {
        return Err(ConvertError::NotAFile(source.to_path_buf()));
    }

    progress(Stage::Loading(source));
    let mut checkpoint = Checkpoint::load(source, options)
        .map_err(|source_err| ConvertError::LoadError { path: source.to_path_buf(), source: source_err })?;

    progress(Stage::Saving(destination));
    checkpoint.save(destination)
        .map_err(|e| ConvertError::SaveError { path: destination.to_path_buf(), source: e })?;

    let storages = checkpoint.storages().iter().map(|storage| {
        let original_device = checkpoint.changes().iter()
            .find(|change| change.key == storage.key)
            .map(|change| change.from.clone())
            .unwrap_or_else(|| storage.device.clone());
        StorageReport {
            key: storage.key.clone(),
            dtype: storage.dtype,
            numel: storage.numel,
            original_device,
            device: storage.device.clone(),
        }
    }).collect();
    let report = ConversionReport {
        source: source.to_path_buf(),
        destination: destination.to_path_buf(),
        storages,
        remapped: checkpoint.changes().len(),
        tensors: checkpoint.tensors(),
    };
    info!(source = %source.display(), destination = %destination.display(), remapped = report.remapped, "conversion finished");
    Ok(report)
}
