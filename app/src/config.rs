use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::models::{ModelFormat, ModelKey, ModelName};

/// Directory under the cache root that holds everything nanochat writes
const CACHE_DIR_NAME: &str = "nanochatllms";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write config store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

// ===== Pipeline Configuration =====

/// Pipeline configuration (stored locally)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Root of the model cache: `models/` and `temp/` live underneath
    pub cache_root: PathBuf,
    /// Directory holding `<name>_tokenizer.bin` files
    pub tokenizer_dir: PathBuf,
    /// Context size handed to the engine at load time
    pub n_ctx: u32,
    /// Length of the text preceding the real URL in a redirect payload
    pub redirect_prefix_len: usize,
    /// Minimum delay between two progress events of one download
    pub progress_interval_ms: u64,
    /// Capacity of the coordinator's command channel
    pub command_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            tokenizer_dir: PathBuf::from("assets").join("tokenizers"),
            n_ctx: 800,
            redirect_prefix_len: 22,
            progress_interval_ms: 100,
            command_buffer: 32,
        }
    }
}

impl PipelineConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl ConfigKey<PipelineConfig> {
    pub const PIPELINE: Self = Self::new("pipelineConfig");
}

/// `~/.cache/nanochatllms`, or a directory under the system temp dir when
/// no home directory can be determined.
pub fn default_cache_root() -> PathBuf {
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(".cache").join(CACHE_DIR_NAME),
        None => {
            warn!("No home directory found, caching models under the temp dir");
            std::env::temp_dir().join(CACHE_DIR_NAME)
        }
    }
}

// ===== Chat Preferences =====

/// Model selection remembered between sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatPreferences {
    pub selected_model: ModelName,
    pub selected_format: ModelFormat,
}

impl Default for ChatPreferences {
    fn default() -> Self {
        Self {
            selected_model: ModelName::Minicpm,
            selected_format: ModelFormat::Q4,
        }
    }
}

impl ChatPreferences {
    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.selected_model, self.selected_format)
    }
}

impl ConfigKey<ChatPreferences> {
    pub const CHAT: Self = Self::new("chatPreferences");
}

// ===== Type-Safe Config Store =====

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;

    /// Stored value, or the type's default when absent or unreadable
    fn get_or_default<T: DeserializeOwned + Default>(&self, key: &ConfigKey<T>) -> T {
        self.get(key).unwrap_or_default()
    }
}

/// Config store persisted as a single JSON object on disk.
///
/// Every write rewrites the file through a sibling temp file and a rename,
/// so a crash never leaves a truncated store behind.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<HashMap<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config store {:?} not found, starting empty", path);
                HashMap::new()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &HashMap<String, serde_json::Value>) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let text = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, text).map_err(write_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(write_err)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        let data = self.data.lock();
        let value = data.get(key.key_name())?.clone();
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring unreadable config '{}': {}", key.key_name(), e);
                None
            }
        }
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        let mut data = self.data.lock();
        data.insert(key.key_name().to_string(), val);
        self.save(&data)
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        let mut data = self.data.lock();
        data.remove(key.key_name());
        self.save(&data)
    }
}
