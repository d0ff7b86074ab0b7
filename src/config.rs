use std::path::Path;

use crate::announce::AnnounceConfig;
use crate::convert::ConvertConfig;
use crate::error::ConfigError;

/// Top-level tool configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub convert: ConvertConfig,
    pub announce: AnnounceConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!("config file '{}' not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.convert.validate()?;
        self.announce.validate()?;
        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&AppConfig::default())
            .map_err(|e| ConfigError::Validation(format!("default config does not serialize: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[convert.export]
opset = 13
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.convert.export.opset, 13);
        // Other fields should be defaults
        assert_eq!(config.convert.class_count, 20);
        assert_eq!(config.convert.export.input_name, "input");
        assert!(config.convert.export.fold_batch_norm);
        assert_eq!(config.announce.rate, 150);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let default = AppConfig::default();
        assert_eq!(config.convert.class_count, default.convert.class_count);
        assert_eq!(config.convert.export.opset, default.convert.export.opset);
        assert_eq!(config.announce.program, default.announce.program);
        assert!(config.convert.checkpoint.strip_module_prefix);
    }

    #[test]
    fn test_validation_rejects_zero_classes() {
        let mut config = AppConfig::default();
        config.convert.class_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_opset_out_of_range() {
        let mut config = AppConfig::default();
        config.convert.export.opset = 8;
        assert!(config.validate().is_err());
        config.convert.export.opset = 22;
        assert!(config.validate().is_err());
        config.convert.export.opset = 21;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_small_image() {
        let mut config = AppConfig::default();
        config.convert.export.image_size = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_same_io_names() {
        let mut config = AppConfig::default();
        config.convert.export.output_name = "input".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_label_count_mismatch() {
        let mut config = AppConfig::default();
        config.convert.class_count = 2;
        config.convert.labels = Some(vec!["Good".into()]);
        assert!(config.validate().is_err());
        config.convert.labels = Some(vec!["Good".into(), "Bad".into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_rate() {
        let mut config = AppConfig::default();
        config.announce.rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_extension() {
        let mut config = AppConfig::default();
        config.announce.extension = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_config.toml")).unwrap();
        assert_eq!(config.convert.class_count, 20);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[convert]
class_count = 5

[convert.checkpoint]
top_level_key = "state_dict"

[announce]
rate = 120
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.convert.class_count, 5);
        assert_eq!(
            config.convert.checkpoint.top_level_key.as_deref(),
            Some("state_dict")
        );
        assert_eq!(config.announce.rate, 120);
        // Others are defaults
        assert_eq!(config.convert.export.opset, 11);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[convert.export]\nopset = 7\n").unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[convert\nclass_count = ").unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml().unwrap();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
    }
}
