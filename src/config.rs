use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_MODEL_NAME: &str = "all-MiniLM-L6-v2";
const DEFAULT_MODEL_DIR: &str = "models/all-MiniLM-L6-v2";
const DEFAULT_DIMENSIONS: usize = 384;
const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 128;
const DEFAULT_INTRA_THREADS: usize = 1;
const DEFAULT_PROGRESS_INTERVAL: usize = 100;
const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    NotUtf8(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    Invalid(String),
}

/// Embedding model settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, also used to identify compatible caches
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Directory holding `model.onnx` and `vocab.txt`
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,

    /// Output vector dimension
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Token sequence length fed to the model, sentinels included
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,

    /// ONNX Runtime intra-op threads
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            dir: default_model_dir(),
            dimensions: DEFAULT_DIMENSIONS,
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MODEL_DIR)
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_max_sequence_length() -> usize {
    DEFAULT_MAX_SEQUENCE_LENGTH
}

fn default_intra_threads() -> usize {
    DEFAULT_INTRA_THREADS
}

/// Index build and search settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Verses between progress notifications
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Results returned when `-k` is not given
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            default_top_k: DEFAULT_TOP_K,
        }
    }
}

fn default_progress_interval() -> usize {
    DEFAULT_PROGRESS_INTERVAL
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default = "default_bibles_dir")]
    pub bibles_dir: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            index: IndexConfig::default(),
            bibles_dir: default_bibles_dir(),
            cache_dir: default_cache_dir(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_bibles_dir() -> PathBuf {
    PathBuf::from("bibles")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;

        if model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.name must not be empty".into()));
        }

        if model.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "model.dimensions must be greater than 0".into(),
            ));
        }

        // [CLS] and [SEP] always take two positions
        if model.max_sequence_length < 3 {
            return Err(ConfigError::Invalid(format!(
                "model.max_sequence_length must be at least 3, got {}",
                model.max_sequence_length
            )));
        }

        if model.intra_threads == 0 {
            return Err(ConfigError::Invalid(
                "model.intra_threads must be greater than 0".into(),
            ));
        }

        if self.index.progress_interval == 0 {
            return Err(ConfigError::Invalid(
                "index.progress_interval must be greater than 0".into(),
            ));
        }

        if self.index.default_top_k == 0 {
            return Err(ConfigError::Invalid(
                "index.default_top_k must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base_path = base_path.as_ref();
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            log::info!("Creating default config in {}", base_path.display());
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case new keys were filled in with defaults
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn model_dir(&self) -> PathBuf {
        self.resolve(&self.model.dir)
    }

    pub fn bibles_dir(&self) -> PathBuf {
        self.resolve(&self.bibles_dir)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.cache_dir)
    }

    /// Relative paths are taken relative to the base directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

/// `VERSO_BASE_PATH`, or `~/.local/share/verso`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("VERSO_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = homedir::my_home()?
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".local/share/verso"))
}
