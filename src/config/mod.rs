use crate::models::BridgeConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// File name of the bridge configuration inside the config directory
pub const CONFIG_FILE_NAME: &str = "bridge.yaml";

/// Prefix of environment overrides, e.g. `OOTR_BRIDGE__WORKER__INTERPRETER`
pub const ENV_PREFIX: &str = "OOTR_BRIDGE";

/// Loads and saves `bridge.yaml`.
///
/// Loading layers built-in defaults, the YAML file and environment overrides
/// (in that order); command-line flags are applied on top by the binary.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager, creating the directory when missing.
    ///
    /// # Arguments
    /// * `config_dir` - Directory holding `bridge.yaml`
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
        })
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    /// Load the layered configuration.
    ///
    /// # Returns
    /// The merged BridgeConfig; defaults when neither file nor environment set anything
    pub fn load(&self) -> Result<BridgeConfig> {
        if !self.config_path.exists() {
            tracing::warn!("Config file not found at {}, using defaults", self.config_path);
        }

        let layered = config::Config::builder()
            .add_source(config::File::new(self.config_path.as_str(), config::FileFormat::Yaml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let config: BridgeConfig = layered
            .try_deserialize()
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        tracing::info!("Loaded config from {}", self.config_path);
        Ok(config)
    }

    /// Load only the YAML file, without environment overrides
    pub fn load_file(&self) -> Result<BridgeConfig> {
        if !self.config_path.exists() {
            return Ok(BridgeConfig::default());
        }

        let file_contents = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse config: {}", self.config_path))
    }

    /// Save the configuration file.
    ///
    /// # Arguments
    /// * `config` - The BridgeConfig to save
    pub fn save(&self, config: &BridgeConfig) -> Result<()> {
        let yaml_string = serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write config: {}", self.config_path))?;

        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    /// Write a default `bridge.yaml` when none exists yet
    pub fn ensure_default(&self) -> Result<()> {
        if self.config_path.exists() {
            return Ok(());
        }
        self.save(&BridgeConfig::default())
    }
}
