use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use memmap2::Mmap;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const PICKLE_RECORD: &str = "data.pkl";
/// torch pads record data to this boundary so storages can be memory mapped.
const RECORD_ALIGNMENT: u16 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    ZipError(#[from] ZipError),
    #[error("{0} is a legacy (pre-zip) torch checkpoint, re-save it with a recent torch first")]
    LegacyFormat(PathBuf),
    #[error("{0} is not a torch zip checkpoint")]
    NotAnArchive(PathBuf),
    #[error("No data.pkl record found in archive")]
    MissingPickle,
    #[error("Multiple data.pkl records found: {0} and {1}")]
    AmbiguousPickle(String, String),
    #[error("Archive record {0} not found")]
    MissingRecord(String),
}

/// A `torch.save` zip archive: one top-level directory holding `data.pkl`,
/// the storage blobs under `data/` and a handful of small metadata records.
pub struct TorchArchive {
    zip: ZipArchive<Cursor<Mmap>>,
    prefix: String,
}

impl TorchArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        if !mmap.starts_with(b"PK\x03\x04") {
            // legacy checkpoints start with a pickled magic number
            return Err(if mmap.first() == Some(&0x80) {
                ArchiveError::LegacyFormat(path.to_path_buf())
            } else {
                ArchiveError::NotAnArchive(path.to_path_buf())
            });
        }
        let zip = ZipArchive::new(Cursor::new(mmap))?;
        let mut pickle_name: Option<&str> = None;
        for name in zip.file_names() {
            let is_pickle = match name.strip_suffix(PICKLE_RECORD) {
                Some(dir) => dir.is_empty() || (dir.ends_with('/') && dir.matches('/').count() == 1),
                None => false,
            };
            if is_pickle {
                if let Some(existing) = pickle_name {
                    return Err(ArchiveError::AmbiguousPickle(existing.to_string(), name.to_string()));
                }
                pickle_name = Some(name);
            }
        }
        let prefix = pickle_name.ok_or(ArchiveError::MissingPickle)?
            .strip_suffix(PICKLE_RECORD).unwrap_or_default().to_string();
        Ok(Self {
            zip,
            prefix,
        })
    }

    /// The archive's top-level directory, including the trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Every record in archive order, with full names.
    pub fn record_names(&self) -> Vec<String> {
        (0..self.zip.len())
            .filter_map(|i| self.zip.name_for_index(i).map(|x| x.to_string()))
            .collect()
    }

    fn full_name(&self, record: &str) -> String {
        format!("{}{}", self.prefix, record)
    }

    pub fn record_size(&mut self, record: &str) -> Result<Option<u64>, ArchiveError> {
        let full_name = self.full_name(record);
        match self.zip.by_name(&full_name) {
            Ok(entry) => Ok(Some(entry.size())),
            Err(ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_record(&mut self, record: &str) -> Result<Vec<u8>, ArchiveError> {
        let full_name = self.full_name(record);
        let mut entry = match self.zip.by_name(&full_name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingRecord(full_name)),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn read_pickle(&mut self) -> Result<Vec<u8>, ArchiveError> {
        self.read_record(PICKLE_RECORD)
    }

    /// Copies every record into a new archive, in the same order and under the
    /// same names, replacing the contents of `data.pkl` with `pickle`.
    pub fn write_with_pickle<W: Write + Seek>(&mut self, out: W, pickle: &[u8]) -> Result<W, ArchiveError> {
        let pickle_name = self.full_name(PICKLE_RECORD);
        let mut writer = ZipWriter::new(out);
        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            let name = entry.name().to_string();
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .large_file(entry.size() >= u32::MAX as u64 || (name == pickle_name && pickle.len() >= u32::MAX as usize));
            if entry.is_dir() {
                writer.add_directory(name.as_str(), options)?;
                continue;
            }
            writer.start_file(name.as_str(), options.with_alignment(RECORD_ALIGNMENT))?;
            if name == pickle_name {
                writer.write_all(pickle)?;
            } else {
                std::io::copy(&mut entry, &mut writer)?;
            }
        }
        Ok(writer.finish()?)
    }
}
