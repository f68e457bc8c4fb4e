pub mod archive;
pub mod checkpoint;
pub mod convert;
pub mod device;
pub mod dtype;
pub mod inspect;
pub mod remap;
pub mod storage;
pub mod trust;

pub use checkpoint::{Checkpoint, LoadError, LoadOptions, SaveError};
pub use convert::{convert, convert_with_progress, ConversionReport, ConvertError, ErrorKind, Stage};
pub use device::Device;
pub use dtype::DType;
pub use trust::{Preset, TrustConfig, TrustedTypes};
