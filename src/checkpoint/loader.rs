use std::collections::BTreeMap;
use std::path::Path;

use burn::prelude::*;
use burn::record::{DefaultRecorder, FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use super::inspect::stored_shapes;
use crate::error::ConvertError;
use crate::model::{ResNet, ResNetRecord};

/// Options for reading PyTorch checkpoints.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Key the state dict is nested under, e.g. `state_dict` or `model`.
    pub top_level_key: Option<String>,
    /// Strip the `module.` prefix that `nn.DataParallel` adds to every key.
    pub strip_module_prefix: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            top_level_key: None,
            strip_module_prefix: true,
        }
    }
}

/// On-disk encodings a checkpoint can come in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `torch.save(model.state_dict())` output.
    PyTorch,
    /// burn named MessagePack record.
    BurnMpk,
}

impl CheckpointFormat {
    /// Detect the format from the file extension.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pth" | "pt" => Some(CheckpointFormat::PyTorch),
            "mpk" => Some(CheckpointFormat::BurnMpk),
            _ => None,
        }
    }
}

/// Load the checkpoint at `path` into `skeleton`.
///
/// The file's parameter names and shapes are checked against the skeleton
/// before any weights are decoded. Fails with [`ConvertError::WeightMismatch`]
/// when a parameter is missing, unexpected or differently shaped, or when the
/// file cannot be decoded as this architecture.
pub fn load_checkpoint<B: Backend>(
    skeleton: ResNet<B>,
    path: &Path,
    format: CheckpointFormat,
    config: &CheckpointConfig,
    device: &B::Device,
) -> Result<ResNet<B>, ConvertError> {
    let expected = skeleton.parameter_shapes();
    let stored = stored_shapes(path, format, config)?;
    let mismatches = compare_shapes(&expected, &stored);
    if !mismatches.is_empty() {
        return Err(ConvertError::WeightMismatch {
            path: path.to_path_buf(),
            details: mismatches.join("; "),
        });
    }

    let record: ResNetRecord<B> = match format {
        CheckpointFormat::PyTorch => <PyTorchFileRecorder<FullPrecisionSettings> as Recorder<B>>::load(
            &PyTorchFileRecorder::default(),
            pytorch_load_args(path, config),
            device,
        ),
        CheckpointFormat::BurnMpk => <DefaultRecorder as Recorder<B>>::load(
            &DefaultRecorder::default(),
            path.to_path_buf(),
            device,
        ),
    }
    .map_err(|e| ConvertError::WeightMismatch {
        path: path.to_path_buf(),
        details: e.to_string(),
    })?;

    tracing::debug!(parameters = expected.len(), ?format, "checkpoint applied");
    Ok(skeleton.load_record(record))
}

/// Map torchvision key names onto the module tree.
fn pytorch_load_args(path: &Path, config: &CheckpointConfig) -> LoadArgs {
    let mut args = LoadArgs::new(path.to_path_buf());
    if let Some(key) = &config.top_level_key {
        args = args.with_top_level_key(key);
    }
    if config.strip_module_prefix {
        args = args.with_key_remap("^module\\.(.+)", "$1");
    }
    args
        // layerN.i.downsample.0.* -> layerN.i.downsample.conv.*
        .with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
        .with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2")
        // layerN.i.* -> layerN.blocks.i.*
        .with_key_remap("(layer[1-4])\\.([0-9]+)\\.(.+)", "$1.blocks.$2.$3")
}

/// Describe every parameter whose shape differs between the two maps.
pub fn compare_shapes(
    expected: &BTreeMap<String, Vec<usize>>,
    found: &BTreeMap<String, Vec<usize>>,
) -> Vec<String> {
    let mut mismatches = Vec::new();
    for (name, dims) in expected {
        match found.get(name) {
            Some(found_dims) if found_dims == dims => {}
            Some(found_dims) => mismatches.push(format!(
                "{name}: expected {dims:?}, found {found_dims:?}"
            )),
            None => mismatches.push(format!("{name}: missing from checkpoint")),
        }
    }
    for name in found.keys().filter(|name| !expected.contains_key(*name)) {
        mismatches.push(format!("{name}: unexpected parameter"));
    }
    mismatches
}
