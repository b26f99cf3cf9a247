//! Runtime settings, layered from defaults, an optional TOML file and
//! `DIGITS_*` environment variables

use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "digits.toml";

/// Prefix of the environment variables that override the file
pub const ENV_PREFIX: &str = "DIGITS";

/// Name of the debug preview written into the static directory
pub const DEBUG_IMAGE_NAME: &str = "debug_image.png";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// Trained weights shared between `train` and the server
    pub model_path: PathBuf,

    /// The built client bundle
    pub static_dir: PathBuf,

    /// Directory holding the raw MNIST IDX files
    pub mnist_dir: PathBuf,

    /// Train a fresh model at startup if `model_path` does not exist
    pub train_if_missing: bool,

    /// Write the normalized input to `<static_dir>/debug_image.png`
    pub debug_image: bool,

    pub log_level: String,
    pub max_payload_bytes: usize,
    pub training: TrainingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,

    /// Epochs without validation loss improvement before stopping
    pub patience: usize,
    pub history_path: PathBuf,

    /// PNG chart of accuracy and loss per epoch
    pub plot_path: PathBuf,
}

impl Settings {
    /// Load settings. `path` is an explicit config file which must exist;
    /// without it `digits.toml` is read if present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Like `load`, reading overrides from `<prefix>_*` variables. Nested
    /// keys use `__`, e.g. `DIGITS_TRAINING__EPOCHS`
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = Self::builder()?
            .add_source(file)
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 5000)?
            .set_default("model_path", "digit_model.ot")?
            .set_default("static_dir", "client/dist")?
            .set_default("mnist_dir", "data/mnist")?
            .set_default("train_if_missing", true)?
            .set_default("debug_image", true)?
            .set_default("log_level", "info")?
            .set_default("max_payload_bytes", 4 * 1024 * 1024)?
            .set_default("training.epochs", 10)?
            .set_default("training.batch_size", 128)?
            .set_default("training.learning_rate", 1e-3)?
            .set_default("training.patience", 3)?
            .set_default("training.history_path", "training_history.json")?
            .set_default("training.plot_path", "training_history.png")?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.max_payload_bytes == 0 {
            bail!("max_payload_bytes must be non-zero");
        }
        let t = &self.training;
        if t.epochs == 0 {
            bail!("training.epochs must be at least 1");
        }
        if t.batch_size == 0 {
            bail!("training.batch_size must be at least 1");
        }
        if !(t.learning_rate > 0.0) {
            bail!("training.learning_rate must be positive");
        }
        Ok(())
    }

    /// Address the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn debug_image_path(&self) -> PathBuf {
        self.static_dir.join(DEBUG_IMAGE_NAME)
    }
}
