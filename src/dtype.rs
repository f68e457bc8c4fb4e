use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DTypeError {
    #[error("Unknown storage class {0}")]
    UnknownStorageClass(String),
}

/// Element type of a serialized storage.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    BF16,
    F16,
    F8E4M3,
    F8E5M2,
    C128,
    C64,
    U64,
    I64,
    U32,
    I32,
    U16,
    I16,
    U8,
    I8,
    BOOL
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::C128 => 16,
            DType::F64 => 8,
            DType::C64 => 8,
            DType::F32 => 4,
            DType::BF16 => 2,
            DType::F16 => 2,
            DType::F8E4M3 => 1,
            DType::F8E5M2 => 1,
            DType::U64 => 8,
            DType::I64 => 8,
            DType::U32 => 4,
            DType::I32 => 4,
            DType::U16 => 2,
            DType::I16 => 2,
            DType::U8 => 1,
            DType::I8 => 1,
            DType::BOOL => 1
        }
    }

    /// Maps a torch storage class name, as referenced from a persistent id, to its element type.
    pub fn from_storage_class(name: &str) -> Result<Self, DTypeError> {
        Ok(match name {
            "DoubleStorage" => DType::F64,
            "FloatStorage" => DType::F32,
            "BFloat16Storage" => DType::BF16,
            "HalfStorage" => DType::F16,
            "Float8_e4m3fnStorage" => DType::F8E4M3,
            "Float8_e5m2Storage" => DType::F8E5M2,
            "ComplexDoubleStorage" => DType::C128,
            "ComplexFloatStorage" => DType::C64,
            "UInt64Storage" => DType::U64,
            "LongStorage" => DType::I64,
            "UInt32Storage" => DType::U32,
            "IntStorage" | "QInt32Storage" => DType::I32,
            "UInt16Storage" => DType::U16,
            "ShortStorage" => DType::I16,
            "ByteStorage" | "UntypedStorage" | "QUInt8Storage" | "QUInt4x2Storage" | "QUInt2x4Storage" => DType::U8,
            "CharStorage" | "QInt8Storage" => DType::I8,
            "BoolStorage" => DType::BOOL,
            _ => Err(DTypeError::UnknownStorageClass(name.to_string()))?
        })
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F64 => write!(f, "Float64"),
            DType::F32 => write!(f, "Float32"),
            DType::BF16 => write!(f, "BFloat16"),
            DType::F16 => write!(f, "Float16"),
            DType::F8E4M3 => write!(f, "Float8E4M3"),
            DType::F8E5M2 => write!(f, "Float8E5M2"),
            DType::C128 => write!(f, "Complex128"),
            DType::C64 => write!(f, "Complex64"),
            DType::I64 => write!(f, "Int64"),
            DType::I32 => write!(f, "Int32"),
            DType::U64 => write!(f, "UInt64"),
            DType::U32 => write!(f, "UInt32"),
            DType::I16 => write!(f, "Int16"),
            DType::U16 => write!(f, "UInt16"),
            DType::U8 => write!(f, "UInt8"),
            DType::I8 => write!(f, "Int8"),
            DType::BOOL => write!(f, "Bool")
        }
    }
}
