use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Serializer};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DeviceError {
    #[error("Empty device string")]
    Empty,
    #[error("Invalid device index in {0:?}")]
    InvalidIndex(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Mps,
    Xpu,
    Meta,
    Other(String),
}

impl DeviceKind {
    fn as_str(&self) -> &str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mps => "mps",
            DeviceKind::Xpu => "xpu",
            DeviceKind::Meta => "meta",
            DeviceKind::Other(name) => name,
        }
    }
}

/// A torch device tag as it appears in a storage location, such as `cpu` or `cuda:1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: Option<u32>,
}

impl Device {
    pub const CPU: Device = Device { kind: DeviceKind::Cpu, index: None };

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::CPU
    }
}

impl FromStr for Device {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeviceError::Empty);
        }
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index.parse::<u32>().map_err(|_| DeviceError::InvalidIndex(s.to_string()))?;
                (kind, Some(index))
            }
            None => (s, None),
        };
        let kind = match kind.to_ascii_lowercase().as_str() {
            "cpu" => DeviceKind::Cpu,
            "cuda" => DeviceKind::Cuda,
            "mps" => DeviceKind::Mps,
            "xpu" => DeviceKind::Xpu,
            "meta" => DeviceKind::Meta,
            other => DeviceKind::Other(other.to_string()),
        };
        Ok(Device { kind, index })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}", self.kind.as_str(), index),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
