use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use prost::Message;

use crate::error::ExportError;
use crate::model::ResNet;
use crate::onnx::proto::{
    Dim, GraphProto, ModelProto, OperatorSetIdProto, StringStringEntryProto, ValueInfoProto,
};
use crate::onnx::tracer::{GraphTracer, Trace, TracedValue};

/// Oldest and newest opsets the emitted operators are valid for.
pub const MIN_OPSET: i64 = 9;
pub const MAX_OPSET: i64 = 21;

/// How the traced graph is declared and serialized.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub opset: i64,
    pub input_name: String,
    pub output_name: String,
    /// Symbolic name of the leading (batch) axis on input and output.
    pub batch_axis_name: String,
    /// Height and width of the sample input.
    pub image_size: usize,
    /// Fold every batch norm into the convolution before it.
    pub fold_batch_norm: bool,
    /// Also run the network on the sample input and check the traced output shape.
    pub verify_forward: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            opset: 11,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            batch_axis_name: "batch_size".to_string(),
            image_size: 224,
            fold_batch_norm: true,
            verify_forward: false,
        }
    }
}

/// ONNX IR version that first shipped with `opset`.
pub fn ir_version_for_opset(opset: i64) -> Result<i64, ExportError> {
    let ir = match opset {
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        21 => 10,
        other => return Err(ExportError::UnsupportedOpset(other)),
    };
    Ok(ir)
}

/// Trace `network` with `sample` and assemble the model with its parameters
/// embedded.
///
/// Only the sample's shape is recorded; its values never reach the artifact.
pub fn build_model<B: Backend>(
    network: &ResNet<B>,
    sample: Tensor<B, 4>,
    config: &ExportConfig,
    metadata: &[(String, String)],
) -> Result<ModelProto, ExportError> {
    let ir_version = ir_version_for_opset(config.opset)?;
    let input = TracedValue {
        name: config.input_name.clone(),
        dims: sample.dims().to_vec(),
    };
    let [_, channels, height, width] = sample.dims();

    let mut tracer = GraphTracer::new(config.fold_batch_norm);
    let output = network.trace(&mut tracer, "", input)?;
    tracer.rename_value(&output.name, &config.output_name);

    if config.verify_forward {
        let produced = network.forward(sample).dims().to_vec();
        if produced != output.dims {
            return Err(ExportError::Trace(format!(
                "traced output {:?} differs from forward output {produced:?}",
                output.dims
            )));
        }
    }

    let batch = Dim::Dynamic(config.batch_axis_name.clone());
    let graph_input = ValueInfoProto::tensor(
        &config.input_name,
        &[batch.clone(), Dim::Fixed(channels), Dim::Fixed(height), Dim::Fixed(width)],
    );
    let output_dims: Vec<Dim> = std::iter::once(batch)
        .chain(output.dims[1..].iter().map(|&d| Dim::Fixed(d)))
        .collect();
    let graph_output = ValueInfoProto::tensor(&config.output_name, &output_dims);

    let (node, initializer) = tracer.into_parts();
    tracing::debug!(
        nodes = node.len(),
        initializers = initializer.len(),
        "graph traced"
    );

    Ok(ModelProto {
        ir_version,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        model_version: 1,
        graph: Some(GraphProto {
            node,
            name: "resnet18".to_string(),
            initializer,
            input: vec![graph_input],
            output: vec![graph_output],
            ..Default::default()
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: config.opset,
        }],
        metadata_props: metadata
            .iter()
            .map(|(key, value)| StringStringEntryProto {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        ..Default::default()
    })
}

/// Encode `model` and place it at `path`.
///
/// Bytes go to a sibling `.tmp` file that is renamed into place, so a failed
/// write never leaves a truncated artifact behind.
pub fn write_model(model: &ModelProto, path: &Path) -> Result<(), ExportError> {
    let tmp = tmp_path(path);
    let bytes = model.encode_to_vec();

    if let Err(source) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(ExportError::Io { path: tmp, source });
    }
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        ExportError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Read an artifact back.
pub fn read_model(path: &Path) -> Result<ModelProto, ExportError> {
    let bytes = fs::read(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ModelProto::decode(bytes.as_slice()).map_err(|e| ExportError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResNetConfig;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ir_version_for_opset() {
        assert_eq!(ir_version_for_opset(11).unwrap(), 6);
        assert_eq!(ir_version_for_opset(12).unwrap(), 7);
        assert_eq!(ir_version_for_opset(17).unwrap(), 8);
        assert_eq!(ir_version_for_opset(21).unwrap(), 10);
        assert!(matches!(
            ir_version_for_opset(8),
            Err(ExportError::UnsupportedOpset(8))
        ));
        assert!(ir_version_for_opset(22).is_err());
    }

    #[test]
    fn test_build_model_declares_dynamic_batch() {
        let device = Default::default();
        let network = ResNetConfig::new(5).init::<TestBackend>(&device);
        let sample = Tensor::random([1, 3, 224, 224], Distribution::Default, &device);
        let config = ExportConfig::default();

        let model = build_model(&network, sample, &config, &[]).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(model.ir_version, 6);
        assert_eq!(model.opset_import[0].version, 11);
        assert_eq!(
            graph.input[0].dims().unwrap(),
            vec![
                Dim::Dynamic("batch_size".into()),
                Dim::Fixed(3),
                Dim::Fixed(224),
                Dim::Fixed(224)
            ]
        );
        assert_eq!(
            graph.output[0].dims().unwrap(),
            vec![Dim::Dynamic("batch_size".into()), Dim::Fixed(5)]
        );
        let last = graph.node.last().unwrap();
        assert_eq!(last.op_type, "Gemm");
        assert_eq!(last.output, vec!["output".to_string()]);
        assert_eq!(graph.node[0].input[0], "input");
    }

    #[test]
    fn test_verify_forward_on_small_input() {
        let device = Default::default();
        let network = ResNetConfig::new(20).init::<TestBackend>(&device);
        let sample = Tensor::random([1, 3, 32, 32], Distribution::Default, &device);
        let config = ExportConfig {
            image_size: 32,
            verify_forward: true,
            ..Default::default()
        };

        let model = build_model(&network, sample, &config, &[]).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.input[0].dims().unwrap()[2], Dim::Fixed(32));
    }

    #[test]
    fn test_metadata_props() {
        let device = Default::default();
        let network = ResNetConfig::new(2).init::<TestBackend>(&device);
        let sample = Tensor::zeros([1, 3, 64, 64], &device);
        let metadata = vec![("labels".to_string(), "a,b".to_string())];

        let model = build_model(&network, sample, &ExportConfig::default(), &metadata).unwrap();
        assert_eq!(model.metadata_props.len(), 1);
        assert_eq!(model.metadata_props[0].key, "labels");
        assert_eq!(model.metadata_props[0].value, "a,b");
    }

    #[test]
    fn test_write_and_read_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let model = ModelProto {
            ir_version: 6,
            producer_name: "test".to_string(),
            ..Default::default()
        };

        write_model(&model, &path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("model.onnx.tmp").exists());
        assert_eq!(read_model(&path).unwrap(), model);
    }

    #[test]
    fn test_read_model_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        fs::write(&path, b"\xff\xff\xff\xff").unwrap();

        match read_model(&path).unwrap_err() {
            ExportError::Decode { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected Decode, got: {other}"),
        }
    }

    #[test]
    fn test_write_model_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.onnx");

        let err = write_model(&ModelProto::default(), &path).unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
        assert!(!path.exists());
    }
}
