use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nanochat_engine::Dtype;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::error::PipelineError;

/// Extension shared by every artifact in the registry
pub const ARTIFACT_EXTENSION: &str = "gten";

const DOWNLOAD_BASE_URL: &str = "https://huggingface.co/iangitonga/gten/resolve/main";

/// Model family
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelName {
    Minicpm,
    Zephyr,
    Tinyllama,
}

/// Weight format of an artifact
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum ModelFormat {
    #[serde(rename = "fp16")]
    #[strum(serialize = "fp16")]
    Fp16,
    #[serde(rename = "q8")]
    #[strum(serialize = "q8")]
    Q8,
    #[serde(rename = "q4")]
    #[strum(serialize = "q4")]
    Q4,
}

impl ModelFormat {
    /// Data type the engine should load the weights as
    pub fn dtype(self) -> Dtype {
        match self {
            ModelFormat::Fp16 => Dtype::Float16,
            ModelFormat::Q8 => Dtype::Qint8,
            ModelFormat::Q4 => Dtype::Qint4,
        }
    }
}

/// Identifies one downloadable artifact: a (name, format) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelKey {
    pub name: ModelName,
    pub format: ModelFormat,
}

impl ModelKey {
    pub const fn new(name: ModelName, format: ModelFormat) -> Self {
        Self { name, format }
    }

    /// File name used in both the temp and the final namespace
    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}.{}", self.name, self.format, ARTIFACT_EXTENSION)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.format)
    }
}

impl FromStr for ModelKey {
    type Err = PipelineError;

    /// Parses `"<name>.<format>"`, e.g. `"zephyr.q8"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || PipelineError::UnknownModel(s.to_string());
        let (name, format) = s.split_once('.').ok_or_else(unknown)?;
        Ok(Self {
            name: name.parse().map_err(|_| unknown())?,
            format: format.parse().map_err(|_| unknown())?,
        })
    }
}

/// Static information about a model available for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalogEntry {
    pub key: ModelKey,
    /// Canonical download URL (answers with a redirect payload)
    pub url: String,
    /// Tokenizer shipped with the application
    pub tokenizer_path: PathBuf,
    /// Human-readable size, e.g. "4-bit (1.5GB)"
    pub display_size: String,
    /// SHA-256 checksum (hex string), when published
    pub sha256: Option<String>,
}

/// Immutable registry of every artifact the application knows about.
///
/// Built once at startup; each key maps to exactly one URL and one
/// tokenizer path for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelCatalogEntry>,
}

impl ModelRegistry {
    pub fn new(entries: Vec<ModelCatalogEntry>) -> Self {
        Self { entries }
    }

    /// Hardcoded catalog of the gten chat models
    pub fn builtin(tokenizer_dir: &Path) -> Self {
        let mut entries = Vec::new();
        for name in ModelName::iter() {
            for format in ModelFormat::iter() {
                let key = ModelKey::new(name, format);
                entries.push(ModelCatalogEntry {
                    key,
                    url: format!("{}/{}", DOWNLOAD_BASE_URL, key.artifact_file_name()),
                    tokenizer_path: tokenizer_dir.join(format!("{}_tokenizer.bin", name)),
                    display_size: display_size(name, format).to_string(),
                    sha256: None,
                });
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[ModelCatalogEntry] {
        &self.entries
    }

    /// Check if a key exists in the catalog
    pub fn contains(&self, key: &ModelKey) -> bool {
        self.entries.iter().any(|e| e.key == *key)
    }

    pub fn get(&self, key: &ModelKey) -> Result<&ModelCatalogEntry, PipelineError> {
        self.entries
            .iter()
            .find(|e| e.key == *key)
            .ok_or_else(|| PipelineError::UnknownModel(key.to_string()))
    }
}

fn display_size(name: ModelName, format: ModelFormat) -> &'static str {
    match (name, format) {
        (ModelName::Minicpm, ModelFormat::Fp16) => "FP-16 (5.5GB)",
        (ModelName::Minicpm, ModelFormat::Q8) => "8-bit (2.9GB)",
        (ModelName::Minicpm, ModelFormat::Q4) => "4-bit (1.5GB)",
        (ModelName::Zephyr, ModelFormat::Fp16) => "FP-16 (3.3GB)",
        (ModelName::Zephyr, ModelFormat::Q8) => "8-bit (1.8GB)",
        (ModelName::Zephyr, ModelFormat::Q4) => "4-bit (0.9GB)",
        (ModelName::Tinyllama, ModelFormat::Fp16) => "FP-16 (2.2GB)",
        (ModelName::Tinyllama, ModelFormat::Q8) => "8-bit (1.2GB)",
        (ModelName::Tinyllama, ModelFormat::Q4) => "4-bit (0.6GB)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_every_key() {
        let registry = ModelRegistry::builtin(Path::new("/opt/nanochat/tokenizers"));
        assert_eq!(registry.entries().len(), 9);

        for name in ModelName::iter() {
            for format in ModelFormat::iter() {
                assert!(registry.contains(&ModelKey::new(name, format)));
            }
        }
    }

    #[test]
    fn test_registry_entry_layout() {
        let registry = ModelRegistry::builtin(Path::new("/opt/nanochat/tokenizers"));
        let entry = registry
            .get(&ModelKey::new(ModelName::Minicpm, ModelFormat::Q4))
            .unwrap();

        assert_eq!(
            entry.url,
            "https://huggingface.co/iangitonga/gten/resolve/main/minicpm.q4.gten"
        );
        assert_eq!(
            entry.tokenizer_path,
            PathBuf::from("/opt/nanochat/tokenizers/minicpm_tokenizer.bin")
        );
        assert_eq!(entry.display_size, "4-bit (1.5GB)");
        assert_eq!(entry.sha256, None);
    }

    #[test]
    fn test_model_key_parse() {
        let test_cases = vec![
            ("zephyr.fp16", Some(ModelKey::new(ModelName::Zephyr, ModelFormat::Fp16))),
            ("tinyllama.q8", Some(ModelKey::new(ModelName::Tinyllama, ModelFormat::Q8))),
            ("minicpm", None),
            ("minicpm.q2", None),
            ("llama.q4", None),
        ];

        for (text, expected) in test_cases {
            assert_eq!(text.parse::<ModelKey>().ok(), expected, "parsing {}", text);
        }
    }

    #[test]
    fn test_model_key_names() {
        let key = ModelKey::new(ModelName::Zephyr, ModelFormat::Q8);
        assert_eq!(key.to_string(), "zephyr.q8");
        assert_eq!(key.artifact_file_name(), "zephyr.q8.gten");
        assert_eq!(key.format.dtype(), Dtype::Qint8);
    }

    #[test]
    fn test_unknown_key_in_custom_registry() {
        let registry = ModelRegistry::new(vec![]);
        let result = registry.get(&ModelKey::new(ModelName::Zephyr, ModelFormat::Q4));
        assert_eq!(
            result.unwrap_err(),
            PipelineError::UnknownModel("zephyr.q4".to_string())
        );
    }
}
