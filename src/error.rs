use std::path::PathBuf;

/// Errors that can occur while converting a checkpoint to ONNX.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("checkpoint not found: {0}")]
    MissingCheckpoint(PathBuf),

    #[error("unsupported checkpoint format: {0} (expected .pth, .pt or .mpk)")]
    UnsupportedFormat(PathBuf),

    #[error("checkpoint {path} does not match the network: {details}")]
    WeightMismatch { path: PathBuf, details: String },

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("export reported success but {0} was not created")]
    Verification(PathBuf),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while tracing or serializing the ONNX graph.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("unsupported opset version {0} (supported: 9..=21)")]
    UnsupportedOpset(i64),

    #[error("graph tracing failed: {0}")]
    Trace(String),

    #[error("failed to read tensor {name}: {message}")]
    TensorData { name: String, message: String },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a valid ONNX model: {message}")]
    Decode { path: PathBuf, message: String },
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Errors that can occur while generating announcement clips.
#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to run speech synthesizer '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("speech synthesis failed for {path}: {message}")]
    Synthesis { path: PathBuf, message: String },

    #[error("failed to write manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint_display() {
        let err = ConvertError::MissingCheckpoint(PathBuf::from("best_model.pth"));
        assert_eq!(err.to_string(), "checkpoint not found: best_model.pth");
    }

    #[test]
    fn test_weight_mismatch_display() {
        let err = ConvertError::WeightMismatch {
            path: PathBuf::from("best_model.pth"),
            details: "fc.weight: expected [5, 512], found [20, 512]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "checkpoint best_model.pth does not match the network: \
             fc.weight: expected [5, 512], found [20, 512]"
        );
    }

    #[test]
    fn test_export_error_converts() {
        let err: ConvertError = ExportError::UnsupportedOpset(7).into();
        assert_eq!(
            err.to_string(),
            "export failed: unsupported opset version 7 (supported: 9..=21)"
        );
    }

    #[test]
    fn test_decode_error_display() {
        let err = ExportError::Decode {
            path: PathBuf::from("model.onnx"),
            message: "buffer underflow".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "model.onnx is not a valid ONNX model: buffer underflow"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("convert.class_count must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: convert.class_count must be > 0"
        );
    }
}
