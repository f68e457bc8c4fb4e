use std::collections::HashSet;
use std::path::{Path, PathBuf};
use pickle_graph::GlobalPolicy;
use serde::{Deserialize, Serialize};
use crate::dtype::DType;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Invalid trusted global {0:?}, expected module.name or module.*")]
    InvalidEntry(String),
    #[error("Allow-list file {0} read error: {1}")]
    ConfigReadError(PathBuf, std::io::Error),
    #[error("Allow-list file {0} parse error: {1}")]
    ConfigParseError(PathBuf, serde_json::Error),
}

/// Globals accepted by torch's weights-only unpickler.
const TORCH_GLOBALS: &[(&str, &str)] = &[
    ("collections", "OrderedDict"),
    ("collections", "Counter"),
    ("torch._utils", "_rebuild_tensor"),
    ("torch._utils", "_rebuild_tensor_v2"),
    ("torch._utils", "_rebuild_tensor_v3"),
    ("torch._utils", "_rebuild_sparse_tensor"),
    ("torch._utils", "_rebuild_meta_tensor_no_storage"),
    ("torch._utils", "_rebuild_nested_tensor"),
    ("torch._utils", "_rebuild_parameter"),
    ("torch._utils", "_rebuild_parameter_with_state"),
    ("torch._utils", "_rebuild_qtensor"),
    ("torch._utils", "_rebuild_wrapper_subclass"),
    ("torch._tensor", "_rebuild_from_type_v2"),
    ("torch.nn.parameter", "Parameter"),
    ("torch.serialization", "_get_layout"),
    ("torch", "Size"),
    ("torch", "Tensor"),
    ("torch.storage", "UntypedStorage"),
    ("torch", "device"),
    ("_codecs", "encode"),
    ("builtins", "bytearray"),
    ("builtins", "complex"),
    ("torch", "strided"),
    ("torch", "sparse_coo"),
    ("torch", "sparse_csr"),
    ("torch", "sparse_csc"),
    ("torch", "sparse_bsr"),
    ("torch", "sparse_bsc"),
    ("torch", "_mkldnn"),
    ("torch", "contiguous_format"),
    ("torch", "channels_last"),
    ("torch", "channels_last_3d"),
    ("torch", "preserve_format"),
    ("torch", "per_tensor_affine"),
    ("torch", "per_channel_affine"),
    ("torch", "per_channel_affine_float_qparams"),
];

const TORCH_DTYPES: &[&str] = &[
    "float64", "float32", "float16", "bfloat16", "float8_e4m3fn", "float8_e5m2",
    "complex128", "complex64", "complex32", "int64", "int32", "int16", "int8",
    "uint64", "uint32", "uint16", "uint8", "bool", "qint8", "quint8", "qint32",
    "quint4x2", "quint2x4",
];

/// Named groups of extra trusted types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum_macros::Display, strum_macros::EnumString, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Preset {
    /// MACE interatomic potential checkpoints: `ScaleShiftMACE`, its
    /// `LinearNodeEmbeddingBlock` and `builtins.set`. A pickle of a full
    /// MACE module also names `torch.nn.modules.*`, `e3nn.*` and other
    /// mace classes, which need `--allow-global` or an allow-list.
    Mace,
}

impl Preset {
    fn globals(&self) -> &'static [&'static str] {
        match self {
            Preset::Mace => &[
                "builtins.set",
                "mace.modules.models.ScaleShiftMACE",
                "mace.modules.blocks.LinearNodeEmbeddingBlock",
            ],
        }
    }
}

/// On-disk form of an allow-list, read from JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub allow: Vec<String>,
    pub presets: Vec<Preset>,
    pub trust_all: bool,
}

impl TrustConfig {
    pub fn from_file(path: &Path) -> Result<Self, TrustError> {
        let data = std::fs::read_to_string(path).map_err(|e| TrustError::ConfigReadError(path.to_path_buf(), e))?;
        serde_json::from_str(&data).map_err(|e| TrustError::ConfigParseError(path.to_path_buf(), e))
    }
}

/// The set of globals a checkpoint may reference.
#[derive(Clone, Debug, Default)]
pub struct TrustedTypes {
    exact: HashSet<(String, String)>,
    modules: Vec<String>,
    trust_all: bool,
}

impl TrustedTypes {
    /// Nothing but the torch tensor machinery.
    pub fn torch_defaults() -> Self {
        let mut out = Self::default();
        for (module, name) in TORCH_GLOBALS {
            out.exact.insert((module.to_string(), name.to_string()));
        }
        for dtype in TORCH_DTYPES {
            out.exact.insert(("torch".to_string(), dtype.to_string()));
        }
        out
    }

    pub fn from_config(config: &TrustConfig) -> Result<Self, TrustError> {
        let mut out = Self::torch_defaults();
        out.merge(config)?;
        Ok(out)
    }

    pub fn merge(&mut self, config: &TrustConfig) -> Result<(), TrustError> {
        for preset in &config.presets {
            self.add_preset(*preset);
        }
        for entry in &config.allow {
            self.allow(entry)?;
        }
        self.trust_all |= config.trust_all;
        Ok(())
    }

    /// Trusts `module.name`, or every name under `module.*`.
    pub fn allow(&mut self, entry: &str) -> Result<(), TrustError> {
        let invalid = || TrustError::InvalidEntry(entry.to_string());
        let (module, name) = entry.trim().rsplit_once('.').ok_or_else(invalid)?;
        if module.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        if name == "*" {
            self.modules.push(module.to_string());
        } else {
            self.exact.insert((module.to_string(), name.to_string()));
        }
        Ok(())
    }

    pub fn add_preset(&mut self, preset: Preset) {
        for entry in preset.globals() {
            if let Some((module, name)) = entry.rsplit_once('.') {
                self.exact.insert((module.to_string(), name.to_string()));
            }
        }
    }

    pub fn set_trust_all(&mut self, trust_all: bool) {
        self.trust_all = trust_all;
    }

    pub fn trusts_all(&self) -> bool {
        self.trust_all
    }
}

impl GlobalPolicy for TrustedTypes {
    fn permits(&self, module: &str, name: &str) -> bool {
        if self.trust_all || self.exact.contains(&(module.to_string(), name.to_string())) {
            return true;
        }
        if module == "torch" && name.ends_with("Storage") && DType::from_storage_class(name).is_ok() {
            return true;
        }
        self.modules.iter().any(|prefix| {
            module == prefix || (module.starts_with(prefix.as_str()) && module[prefix.len()..].starts_with('.'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torch_defaults_cover_tensor_rebuilds_only() {
        let trusted = TrustedTypes::torch_defaults();
        assert!(trusted.permits("torch._utils", "_rebuild_tensor_v2"));
        assert!(trusted.permits("torch", "FloatStorage"));
        assert!(trusted.permits("torch", "bfloat16"));
        assert!(!trusted.permits("torch", "NotAStorage"));
        assert!(!trusted.permits("builtins", "set"));
        assert!(!trusted.permits("os", "system"));
    }

    #[test]
    fn mace_preset_adds_its_model_classes() {
        let mut trusted = TrustedTypes::torch_defaults();
        trusted.add_preset(Preset::Mace);
        assert!(trusted.permits("builtins", "set"));
        assert!(trusted.permits("mace.modules.models", "ScaleShiftMACE"));
        assert!(!trusted.permits("mace.modules.models", "MACE"));
    }

    #[test]
    fn module_wildcards_match_submodules_only_on_boundaries() {
        let mut trusted = TrustedTypes::default();
        trusted.allow("e3nn.*").unwrap();
        assert!(trusted.permits("e3nn", "o3"));
        assert!(trusted.permits("e3nn.o3._irreps", "Irreps"));
        assert!(!trusted.permits("e3nnx", "Thing"));
        assert!(matches!(trusted.allow("nodot"), Err(TrustError::InvalidEntry(_))));
        assert!(matches!(trusted.allow(".name"), Err(TrustError::InvalidEntry(_))));
    }

    #[test]
    fn config_json_merges_presets_entries_and_flag() {
        let config: TrustConfig = serde_json::from_str(r#"{"allow": ["my.pkg.Block"], "presets": ["mace"]}"#).unwrap();
        let trusted = TrustedTypes::from_config(&config).unwrap();
        assert!(trusted.permits("my.pkg", "Block"));
        assert!(trusted.permits("mace.modules.blocks", "LinearNodeEmbeddingBlock"));
        assert!(!trusted.trusts_all());
        let config: TrustConfig = serde_json::from_str(r#"{"trust_all": true}"#).unwrap();
        assert!(TrustedTypes::from_config(&config).unwrap().permits("os", "system"));
    }

    #[test]
    fn preset_names_parse() {
        assert_eq!("mace".parse::<Preset>().unwrap(), Preset::Mace);
        assert_eq!(Preset::Mace.to_string(), "mace");
    }
}
