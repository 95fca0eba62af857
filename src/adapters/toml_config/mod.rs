// TOML config adapter - Configuration files in TOML

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::config_initialization::AppConfig;
use crate::error::{ExportError, ExportResult};
use crate::ports::ConfigPort;

/// TOML configuration adapter
#[derive(Debug, Clone, Default)]
pub struct TomlConfigAdapter;

impl TomlConfigAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Parse a configuration document; missing sections and keys take defaults
    pub fn parse(content: &str) -> ExportResult<AppConfig> {
        toml::from_str(content)
            .map_err(|e| ExportError::configuration(format!("Failed to parse TOML config: {}", e)))
    }

    pub fn serialize(config: &AppConfig) -> ExportResult<String> {
        toml::to_string_pretty(config).map_err(|e| {
            ExportError::configuration(format!("Failed to serialize TOML config: {}", e))
        })
    }
}

#[async_trait]
impl ConfigPort for TomlConfigAdapter {
    async fn load_config(&self, path: &Path) -> ExportResult<AppConfig> {
        if !path.exists() {
            return Err(ExportError::configuration(format!(
                "Config file does not exist: {}",
                path.display()
            )));
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExportError::configuration(format!("Failed to read config file: {}", e)))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    async fn save_config(&self, config: &AppConfig, path: &Path) -> ExportResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = Self::serialize(config)?;
        tokio::fs::write(path, content).await?;
        info!(path = %path.display(), "saved configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_document_takes_defaults() {
        let config = TomlConfigAdapter::parse("[audio]\nchannels = 1\n").unwrap();
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.export, AppConfig::default().export);
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        let result = TomlConfigAdapter::parse("[export\npreset = ");
        assert!(matches!(result, Err(ExportError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("reframe.toml");
        let mut config = AppConfig::default();
        config.export.preset = "1080p".to_string();
        config.export.network_optimized = true;

        let adapter = TomlConfigAdapter::new();
        adapter.save_config(&config, &path).await.unwrap();
        assert_eq!(adapter.load_config(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reframe.toml");
        std::fs::write(&path, "[export]\ncontainer = \"avi\"\n").unwrap();
        assert!(TomlConfigAdapter::new().load_config(&path).await.is_err());
    }
}
