//! Configuration initialization and hierarchy management
//!
//! Precedence, lowest first: defaults, TOML file, `REFRAME_*` environment
//! variables, command-line flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::model::ContainerKind;
use crate::domain::rules::Preset;
use crate::domain::settings::{
    AudioSettings, ChannelLayout, DEFAULT_AUDIO_BIT_RATE, DEFAULT_AUDIO_CHANNELS,
    DEFAULT_AUDIO_SAMPLE_RATE,
};
use crate::error::{ExportError, ExportResult};
use crate::ports::ConfigPort;
use crate::utils::logging::{LogFormat, LogLevel, LoggingConfig};

/// Config file picked up from the working directory when none is named
pub const DEFAULT_CONFIG_FILE: &str = "reframe.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub export: ExportSection,
    pub audio: AudioSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    pub preset: String,
    pub container: String,
    pub network_optimized: bool,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            preset: Preset::default().name().to_string(),
            container: ContainerKind::default().to_string(),
            network_optimized: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub bit_rate: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            bit_rate: DEFAULT_AUDIO_BIT_RATE,
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            channels: DEFAULT_AUDIO_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.to_string(),
            format: LogFormat::Pretty.to_string(),
        }
    }
}

impl AppConfig {
    pub fn preset(&self) -> ExportResult<Preset> {
        self.export.preset.parse()
    }

    pub fn container(&self) -> ExportResult<ContainerKind> {
        self.export.container.parse()
    }

    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            channels: self.audio.channels,
            sample_rate: self.audio.sample_rate,
            bit_rate: self.audio.bit_rate,
            channel_layout: ChannelLayout::for_channels(self.audio.channels),
            ..AudioSettings::default()
        }
    }

    pub fn logging_config(&self) -> ExportResult<LoggingConfig> {
        Ok(LoggingConfig {
            level: self.logging.level.parse()?,
            format: self.logging.format.parse()?,
            ..LoggingConfig::default()
        })
    }

    /// Reject unknown names and zero audio parameters
    pub fn validate(&self) -> ExportResult<()> {
        self.preset()?;
        self.container()?;
        self.logging_config()?;
        self.audio_settings().validate()
    }

    /// Apply `REFRAME_*` overrides read through `lookup`; returns how many applied
    pub fn apply_environment<F>(&mut self, lookup: F) -> ExportResult<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = 0;
        if let Some(value) = lookup("REFRAME_PRESET") {
            self.export.preset = value;
            applied += 1;
        }
        if let Some(value) = lookup("REFRAME_CONTAINER") {
            self.export.container = value;
            applied += 1;
        }
        if let Some(value) = lookup("REFRAME_NETWORK_OPTIMIZED") {
            self.export.network_optimized = parse_bool("REFRAME_NETWORK_OPTIMIZED", &value)?;
            applied += 1;
        }
        if let Some(value) = lookup("REFRAME_AUDIO_BITRATE") {
            self.audio.bit_rate = value.trim().parse().map_err(|_| {
                ExportError::configuration(format!("Invalid REFRAME_AUDIO_BITRATE: {}", value))
            })?;
            applied += 1;
        }
        if let Some(value) = lookup("REFRAME_LOG_LEVEL") {
            self.logging.level = value;
            applied += 1;
        }
        if let Some(value) = lookup("REFRAME_LOG_FORMAT") {
            self.logging.format = value;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply command-line overrides; returns how many applied
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> usize {
        let mut applied = 0;
        if let Some(preset) = &overrides.preset {
            self.export.preset = preset.clone();
            applied += 1;
        }
        if let Some(container) = &overrides.container {
            self.export.container = container.clone();
            applied += 1;
        }
        if overrides.network_optimized {
            self.export.network_optimized = true;
            applied += 1;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
            applied += 1;
        }
        if let Some(format) = &overrides.log_format {
            self.logging.format = format.clone();
            applied += 1;
        }
        applied
    }
}

fn parse_bool(name: &str, value: &str) -> ExportResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ExportError::configuration(format!(
            "Invalid boolean value for {}: {}",
            name, value
        ))),
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub preset: Option<String>,
    pub container: Option<String>,
    pub network_optimized: bool,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

/// Pick the config file: an explicit path must exist, otherwise
/// `REFRAME_CONFIG`, then `./reframe.toml` if present
fn locate_config_file<F>(explicit: Option<&Path>, lookup: &F) -> ExportResult<Option<PathBuf>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ExportError::configuration(format!(
                "Config file does not exist: {}",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }
    if let Some(path) = lookup("REFRAME_CONFIG") {
        return Ok(Some(PathBuf::from(path)));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.exists().then_some(local))
}

/// Build the effective configuration from all layers
pub async fn initialize_configuration_hierarchy(
    config_port: &dyn ConfigPort,
    explicit_file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> ExportResult<AppConfig> {
    initialize_with_environment(config_port, explicit_file, overrides, |name| {
        std::env::var(name).ok()
    })
    .await
}

pub async fn initialize_with_environment<F>(
    config_port: &dyn ConfigPort,
    explicit_file: Option<&Path>,
    overrides: &ConfigOverrides,
    lookup: F,
) -> ExportResult<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match locate_config_file(explicit_file, &lookup)? {
        Some(path) => {
            info!(path = %path.display(), "loading configuration file");
            config_port.load_config(&path).await?
        }
        None => {
            debug!("no configuration file, using defaults");
            AppConfig::default()
        }
    };

    let env_overrides = config.apply_environment(&lookup)?;
    if env_overrides > 0 {
        debug!(count = env_overrides, "applied environment overrides");
    }
    let cli_overrides = config.apply_overrides(overrides);
    if cli_overrides > 0 {
        debug!(count = cli_overrides, "applied command-line overrides");
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::toml_config::TomlConfigAdapter;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preset().unwrap(), Preset::P720);
        assert_eq!(config.container().unwrap(), ContainerKind::Mp4);
        assert_eq!(config.audio_settings(), AudioSettings::default());
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = AppConfig::default();
        let applied = config
            .apply_environment(env(&[
                ("REFRAME_PRESET", "1080p"),
                ("REFRAME_NETWORK_OPTIMIZED", "yes"),
                ("REFRAME_AUDIO_BITRATE", "96000"),
            ]))
            .unwrap();
        assert_eq!(applied, 3);
        assert_eq!(config.preset().unwrap(), Preset::P1080);
        assert!(config.export.network_optimized);
        assert_eq!(config.audio.bit_rate, 96_000);
    }

    #[test]
    fn test_invalid_environment_boolean() {
        let mut config = AppConfig::default();
        let result = config.apply_environment(env(&[("REFRAME_NETWORK_OPTIMIZED", "maybe")]));
        assert!(matches!(result, Err(ExportError::Configuration { .. })));
    }

    #[test]
    fn test_validation_rejects_unknown_names_and_zero_channels() {
        let mut config = AppConfig::default();
        config.export.preset = "8k".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.export.container = "avi".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.channels = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_hierarchy_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reframe.toml");
        std::fs::write(
            &path,
            "[export]\npreset = \"480p\"\ncontainer = \"mov\"\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let overrides = ConfigOverrides {
            preset: Some("360p".to_string()),
            ..ConfigOverrides::default()
        };
        let config = initialize_with_environment(
            &TomlConfigAdapter::new(),
            Some(&path),
            &overrides,
            env(&[("REFRAME_CONTAINER", "m4v"), ("REFRAME_PRESET", "540p")]),
        )
        .await
        .unwrap();

        // CLI beats env, env beats file, file beats defaults
        assert_eq!(config.preset().unwrap(), Preset::P360);
        assert_eq!(config.container().unwrap(), ContainerKind::M4v);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.audio.sample_rate, DEFAULT_AUDIO_SAMPLE_RATE);
    }

    #[tokio::test]
    async fn test_missing_explicit_file_is_an_error() {
        let result = initialize_with_environment(
            &TomlConfigAdapter::new(),
            Some(Path::new("/nonexistent/reframe.toml")),
            &ConfigOverrides::default(),
            env(&[]),
        )
        .await;
        assert!(matches!(result, Err(ExportError::Configuration { .. })));
    }
}
