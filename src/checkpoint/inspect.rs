//! Parameter names and shapes as stored in a checkpoint file, read without
//! decoding the file into a network.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use burn_store::pytorch::PytorchReader;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

use super::loader::{CheckpointConfig, CheckpointFormat};
use crate::error::ConvertError;

/// Parameter shapes keyed by torchvision names, linear weights as `[out, in]`.
pub type ShapeMap = BTreeMap<String, Vec<usize>>;

/// Every parameter the file at `path` holds.
pub fn stored_shapes(
    path: &Path,
    format: CheckpointFormat,
    config: &CheckpointConfig,
) -> Result<ShapeMap, ConvertError> {
    match format {
        CheckpointFormat::PyTorch => pytorch_shapes(path, config),
        CheckpointFormat::BurnMpk => mpk_shapes(path),
    }
}

fn pytorch_shapes(path: &Path, config: &CheckpointConfig) -> Result<ShapeMap, ConvertError> {
    let reader = match &config.top_level_key {
        Some(key) => PytorchReader::with_top_level_key(path, key),
        None => PytorchReader::new(path),
    }
    .map_err(|e| undecodable(path, e))?;

    Ok(reader
        .tensors()
        .iter()
        .filter_map(|(key, snapshot)| {
            state_dict_key(key, config.strip_module_prefix).map(|key| (key, snapshot.shape.clone()))
        })
        .collect())
}

/// The network's name for a state-dict key, or `None` for batch-norm
/// bookkeeping buffers that carry no weights.
pub fn state_dict_key(key: &str, strip_module_prefix: bool) -> Option<String> {
    if key.ends_with(".num_batches_tracked") {
        return None;
    }
    let key = match key.strip_prefix("module.") {
        Some(rest) if strip_module_prefix => rest,
        _ => key,
    };
    Some(key.to_string())
}

fn mpk_shapes(path: &Path) -> Result<ShapeMap, ConvertError> {
    let bytes = fs::read(path).map_err(|e| undecodable(path, e))?;
    let record: RecordNode = rmp_serde::from_slice(&bytes).map_err(|e| undecodable(path, e))?;
    let item = record
        .field("item")
        .ok_or_else(|| undecodable(path, "no record item"))?;

    let mut shapes = ShapeMap::new();
    collect_params(item, &mut Vec::new(), &mut shapes);
    Ok(shapes)
}

fn undecodable(path: &Path, error: impl fmt::Display) -> ConvertError {
    ConvertError::WeightMismatch {
        path: path.to_path_buf(),
        details: format!("cannot read parameters: {error}"),
    }
}

fn collect_params(node: &RecordNode, path: &mut Vec<String>, shapes: &mut ShapeMap) {
    if let Some(shape) = param_shape(node) {
        let (name, shape) = torchvision_param(path, shape);
        shapes.insert(name, shape);
        return;
    }
    match node {
        RecordNode::Map(fields) => {
            for (key, child) in fields {
                path.push(key.clone());
                collect_params(child, path, shapes);
                path.pop();
            }
        }
        RecordNode::Seq(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(i.to_string());
                collect_params(child, path, shapes);
                path.pop();
            }
        }
        RecordNode::Uint(_) | RecordNode::Leaf => {}
    }
}

/// Shape of a serialized `Param`, which is `{ id, param: { bytes, shape, dtype } }`.
fn param_shape(node: &RecordNode) -> Option<Vec<usize>> {
    let RecordNode::Seq(dims) = node.field("param")?.field("shape")? else {
        return None;
    };
    dims.iter()
        .map(|dim| match dim {
            RecordNode::Uint(d) => usize::try_from(*d).ok(),
            _ => None,
        })
        .collect()
}

/// Map a burn module path onto the torchvision state-dict name.
fn torchvision_param(path: &[String], mut shape: Vec<usize>) -> (String, Vec<usize>) {
    let mut parts = Vec::with_capacity(path.len());
    let mut prev: Option<&str> = None;
    for segment in path {
        let renamed = match (prev, segment.as_str()) {
            (Some(p), "blocks") if p.starts_with("layer") => None,
            (Some("downsample"), "conv") => Some("0"),
            (Some("downsample"), "bn") => Some("1"),
            (_, "gamma") => Some("weight"),
            (_, "beta") => Some("bias"),
            (_, other) => Some(other),
        };
        parts.extend(renamed);
        prev = Some(segment.as_str());
    }
    // burn keeps linear weights as [in, out].
    if shape.len() == 2 && path.last().map(String::as_str) == Some("weight") {
        shape.reverse();
    }
    (parts.join("."), shape)
}

/// Structure of a MessagePack record with tensor bytes skipped.
#[derive(Debug)]
enum RecordNode {
    Map(Vec<(String, RecordNode)>),
    Seq(Vec<RecordNode>),
    Uint(u64),
    Leaf,
}

impl RecordNode {
    fn field(&self, name: &str) -> Option<&RecordNode> {
        match self {
            RecordNode::Map(fields) => fields.iter().find(|(key, _)| key == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RecordNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RecordNodeVisitor)
    }
}

struct RecordNodeVisitor;

impl<'de> Visitor<'de> for RecordNodeVisitor {
    type Value = RecordNode;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a burn record")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RecordNode, E> {
        Ok(u64::try_from(v).map_or(RecordNode::Leaf, RecordNode::Uint))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RecordNode, E> {
        Ok(RecordNode::Uint(v))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_unit<E: de::Error>(self) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_none<E: de::Error>(self) -> Result<RecordNode, E> {
        Ok(RecordNode::Leaf)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<RecordNode, D::Error> {
        RecordNode::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RecordNode, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(RecordNode::Seq(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RecordNode, A::Error> {
        let mut fields = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, RecordNode>()? {
            fields.push((key, value));
        }
        Ok(RecordNode::Map(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResNet, ResNetConfig};
    use burn::backend::NdArray;
    use burn::module::Module;
    use burn::record::DefaultRecorder;
    use std::path::PathBuf;

    type TestBackend = NdArray<f32>;

    fn save_network(dir: &Path, num_classes: usize) -> (PathBuf, ResNet<TestBackend>) {
        let device = Default::default();
        let path = dir.join("network.mpk");
        let network = ResNetConfig::new(num_classes).init::<TestBackend>(&device);
        network
            .clone()
            .save_file(path.clone(), &DefaultRecorder::default())
            .unwrap();
        (path, network)
    }

    #[test]
    fn test_mpk_shapes_match_network_names() {
        let dir = tempfile::tempdir().unwrap();
        let (path, network) = save_network(dir.path(), 20);

        let shapes = stored_shapes(&path, CheckpointFormat::BurnMpk, &CheckpointConfig::default())
            .unwrap();
        assert_eq!(shapes, network.parameter_shapes());
        assert_eq!(shapes["fc.weight"], vec![20, 512]);
        assert_eq!(shapes["layer2.0.downsample.0.weight"], vec![128, 64, 1, 1]);
        assert_eq!(shapes["layer2.0.downsample.1.running_var"], vec![128]);
        assert_eq!(shapes["bn1.weight"], vec![64]);
    }

    #[test]
    fn test_mpk_shapes_reject_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.mpk");
        fs::write(&path, b"\xc1\xc1\xc1").unwrap();

        let err = stored_shapes(&path, CheckpointFormat::BurnMpk, &CheckpointConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConvertError::WeightMismatch { .. }));
    }

    #[test]
    fn test_pytorch_shapes_reject_non_pickle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.pth");
        fs::write(&path, b"definitely not a zip archive").unwrap();

        let err = stored_shapes(&path, CheckpointFormat::PyTorch, &CheckpointConfig::default())
            .unwrap_err();
        match err {
            ConvertError::WeightMismatch { details, .. } => {
                assert!(details.starts_with("cannot read parameters"))
            }
            other => panic!("expected WeightMismatch, got: {other}"),
        }
    }

    #[test]
    fn test_state_dict_key() {
        assert_eq!(
            state_dict_key("module.layer1.0.conv1.weight", true).as_deref(),
            Some("layer1.0.conv1.weight")
        );
        assert_eq!(
            state_dict_key("module.fc.bias", false).as_deref(),
            Some("module.fc.bias")
        );
        assert_eq!(state_dict_key("bn1.num_batches_tracked", true), None);
        assert_eq!(state_dict_key("fc.weight", true).as_deref(), Some("fc.weight"));
    }

    #[test]
    fn test_torchvision_param_names() {
        let path = |s: &str| s.split('.').map(String::from).collect::<Vec<_>>();

        assert_eq!(
            torchvision_param(&path("layer3.blocks.1.bn2.gamma"), vec![256]),
            ("layer3.1.bn2.weight".to_string(), vec![256])
        );
        assert_eq!(
            torchvision_param(&path("layer4.blocks.0.downsample.bn.beta"), vec![512]),
            ("layer4.0.downsample.1.bias".to_string(), vec![512])
        );
        assert_eq!(
            torchvision_param(&path("fc.weight"), vec![512, 7]),
            ("fc.weight".to_string(), vec![7, 512])
        );
        assert_eq!(
            torchvision_param(&path("conv1.weight"), vec![64, 3, 7, 7]),
            ("conv1.weight".to_string(), vec![64, 3, 7, 7])
        );
    }
}
