use std::fs;
use std::path::{Path, PathBuf};

use burn::backend::NdArray;
use burn::prelude::*;
use burn::tensor::Distribution;

use crate::checkpoint::{load_checkpoint, CheckpointConfig, CheckpointFormat};
use crate::error::{ConfigError, ConvertError};
use crate::labels::{labels_for, DEFAULT_CLASS_COUNT};
use crate::model::{ResNetConfig, IMAGENET_CLASSES, IN_CHANNELS};
use crate::onnx::{build_model, write_model, ExportConfig, MAX_OPSET, MIN_OPSET};

/// CPU backend used for conversion. It carries no autodiff, so batch norm
/// always runs on its running statistics.
pub type ConvertBackend = NdArray<f32>;

/// Conversion settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Output width of the classifier head the checkpoint was trained with.
    pub class_count: usize,
    /// Class names embedded in the artifact metadata, in output order.
    pub labels: Option<Vec<String>>,
    pub export: ExportConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        ConvertConfig {
            class_count: DEFAULT_CLASS_COUNT,
            labels: None,
            export: ExportConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ConvertConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.class_count == 0 {
            return Err(ConfigError::Validation(
                "convert.class_count must be > 0".into(),
            ));
        }
        if let Some(labels) = &self.labels {
            if labels.len() != self.class_count {
                return Err(ConfigError::Validation(format!(
                    "convert.labels has {} entries but class_count is {}",
                    labels.len(),
                    self.class_count
                )));
            }
        }
        let export = &self.export;
        if !(MIN_OPSET..=MAX_OPSET).contains(&export.opset) {
            return Err(ConfigError::Validation(format!(
                "convert.export.opset must be in [{MIN_OPSET}, {MAX_OPSET}]"
            )));
        }
        if export.image_size < 32 {
            return Err(ConfigError::Validation(
                "convert.export.image_size must be >= 32".into(),
            ));
        }
        if export.input_name.is_empty() || export.output_name.is_empty() {
            return Err(ConfigError::Validation(
                "convert.export input and output names must not be empty".into(),
            ));
        }
        if export.input_name == export.output_name {
            return Err(ConfigError::Validation(
                "convert.export.input_name must differ from output_name".into(),
            ));
        }
        if export.batch_axis_name.is_empty() {
            return Err(ConfigError::Validation(
                "convert.export.batch_axis_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a successful conversion.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub bytes: u64,
    pub class_count: usize,
    pub opset: i64,
    pub parameter_count: usize,
    pub node_count: usize,
}

impl ConversionReport {
    pub fn size_mb(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Convert the checkpoint at `checkpoint_path` into an ONNX model at
/// `output_path` using the CPU backend.
pub fn convert(
    checkpoint_path: &Path,
    output_path: &Path,
    config: &ConvertConfig,
) -> Result<ConversionReport, ConvertError> {
    convert_on::<ConvertBackend>(checkpoint_path, output_path, config, &Default::default())
}

/// Convert on an explicit backend and device.
pub fn convert_on<B: Backend>(
    checkpoint_path: &Path,
    output_path: &Path,
    config: &ConvertConfig,
    device: &B::Device,
) -> Result<ConversionReport, ConvertError> {
    if !checkpoint_path.is_file() {
        return Err(ConvertError::MissingCheckpoint(checkpoint_path.to_path_buf()));
    }
    let format = CheckpointFormat::detect(checkpoint_path)
        .ok_or_else(|| ConvertError::UnsupportedFormat(checkpoint_path.to_path_buf()))?;
    config.validate()?;

    tracing::info!("Loading ResNet18 model architecture...");
    let skeleton = ResNetConfig::new(IMAGENET_CLASSES)
        .init::<B>(device)
        .with_classifier(config.class_count, device);
    tracing::info!("Modified final layer for {} classes", config.class_count);

    tracing::info!("Loading weights from {}...", checkpoint_path.display());
    let network = load_checkpoint(skeleton, checkpoint_path, format, &config.checkpoint, device)?;
    tracing::info!("Weights loaded successfully");

    let size = config.export.image_size;
    let sample = Tensor::<B, 4>::random([1, IN_CHANNELS, size, size], Distribution::Default, device);

    tracing::info!(
        opset = config.export.opset,
        "Exporting model to ONNX format: {}...",
        output_path.display()
    );
    let metadata = artifact_metadata(checkpoint_path, config);
    let model = build_model(&network, sample, &config.export, &metadata)?;
    let node_count = model.graph.as_ref().map_or(0, |g| g.node.len());
    write_model(&model, output_path)?;

    let bytes = match fs::metadata(output_path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(ConvertError::Verification(output_path.to_path_buf())),
    };

    let report = ConversionReport {
        output: output_path.to_path_buf(),
        bytes,
        class_count: config.class_count,
        opset: config.export.opset,
        parameter_count: network.parameter_count(),
        node_count,
    };
    tracing::info!(
        nodes = report.node_count,
        parameters = report.parameter_count,
        "ONNX model written ({:.2} MB)",
        report.size_mb()
    );
    Ok(report)
}

fn artifact_metadata(checkpoint_path: &Path, config: &ConvertConfig) -> Vec<(String, String)> {
    let mut metadata = vec![("class_count".to_string(), config.class_count.to_string())];
    if let Some(name) = checkpoint_path.file_name() {
        metadata.push((
            "source_checkpoint".to_string(),
            name.to_string_lossy().into_owned(),
        ));
    }
    if let Some(labels) = labels_for(config.class_count, config.labels.as_deref()) {
        metadata.push(("labels".to_string(), labels.join(",")));
    }
    metadata
}
