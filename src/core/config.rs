//! Configuration management

use clap::Parser;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of the environment variables read by [`Config::load`], e.g. `SFX__SERVER__PORT`
pub const ENV_PREFIX: &str = "SFX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server configuration: {0}")]
    InvalidServer(String),

    #[error("Invalid plugin configuration: {0}")]
    InvalidPlugin(String),

    #[error("Invalid event bus configuration: {0}")]
    InvalidEventBus(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub plugins: PluginConfig,
    pub event_bus: EventBusConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(CliArgs::parse())
    }

    /// Same as [`Config::load`] with already parsed command-line arguments
    pub fn load_with(cli_args: CliArgs) -> Result<Self, ConfigError> {
        // 1. Defaults (lowest priority)
        let mut builder = with_defaults(ConfigBuilder::builder())?;

        // 2. Config file if specified
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // 3. Environment variables, e.g. SFX__PLUGINS__PLUGIN_DIR=/opt/sfx/plugins
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI arguments (highest priority)
        if let Some(host) = &cli_args.host {
            builder = builder.set_override("server.host", host.clone())?;
        }
        if let Some(port) = cli_args.port {
            builder = builder.set_override("server.port", port)?;
        }
        if cli_args.no_server {
            builder = builder.set_override("server.enabled", false)?;
        }
        if let Some(plugin_dir) = &cli_args.plugin_dir {
            builder = builder.set_override("plugins.plugin_dir", plugin_dir.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path, missing keys taking their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(ConfigBuilder::builder())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.plugins.validate()?;
        self.event_bus.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

fn with_defaults(builder: Builder<DefaultState>) -> Result<Builder<DefaultState>, ConfigError> {
    Ok(builder
        .set_default("server.enabled", true)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8090)?
        .set_default("plugins.plugin_dir", "./plugins")?
        .set_default("plugins.retain_unpacked_on_stop", true)?
        .set_default("event_bus.max_concurrent_deliveries", 64)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")?
        .set_default("logging.max_file_size", 10485760)? // 10 MB
        .set_default("logging.max_backups", 5)?)
}

/// Command-line arguments for configuration override
#[derive(Debug, Default, Parser)]
#[command(name = "sfx-plugin-host")]
#[command(about = "Plugin host with versioned archives and an in-process event bus", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Admin server host address
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Admin server port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Do not start the admin HTTP server
    #[arg(long)]
    pub no_server: bool,

    /// Plugin directory path
    #[arg(long, value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidServer("host cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidServer("port must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Directory scanned for `.sfx-plugin` archives
    pub plugin_dir: PathBuf,
    /// Where archives are unpacked, `<plugin_dir>/.unpacked` when unset
    #[serde(default)]
    pub unpack_dir: Option<PathBuf>,
    /// Keep unpacked directories on stop for a faster restart
    pub retain_unpacked_on_stop: bool,
}

impl PluginConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugin_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPlugin("plugin_dir cannot be empty".to_string()));
        }

        if let Some(unpack_dir) = &self.unpack_dir {
            if unpack_dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidPlugin("unpack_dir cannot be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Resolved unpack root
    pub fn unpack_root(&self) -> PathBuf {
        self.unpack_dir
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join(".unpacked"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Upper bound of actor deliveries running at the same time
    pub max_concurrent_deliveries: usize,
}

impl EventBusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_deliveries == 0 {
            return Err(ConfigError::InvalidEventBus(
                "max_concurrent_deliveries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub max_file_size: usize, // bytes
    pub max_backups: usize,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidLogging("max_file_size must be greater than 0".to_string()));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::InvalidLogging("max_backups must be greater than 0".to_string()));
        }

        Ok(())
    }
}
