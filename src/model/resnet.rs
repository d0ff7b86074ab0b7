use std::collections::BTreeMap;

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

use super::block::{BasicBlock, ResidualLayer};

/// Width of the ImageNet head the architecture ships with.
pub const IMAGENET_CLASSES: usize = 1000;

/// Input color channels.
pub const IN_CHANNELS: usize = 3;

/// Features entering the classifier head.
pub const FEATURE_WIDTH: usize = 512;

const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];
const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];

/// 18-layer residual image classifier.
///
/// ```text
/// Input:   [batch, 3, H, W]
/// Stem:    conv1 7x7/2 -> bn1 -> relu -> maxpool 3x3/2
/// layer1:  2 x BasicBlock(64)
/// layer2:  2 x BasicBlock(128), first strided /2
/// layer3:  2 x BasicBlock(256), first strided /2
/// layer4:  2 x BasicBlock(512), first strided /2
/// Head:    global average pool -> flatten -> fc 512 -> num_classes
/// ```
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub layer1: ResidualLayer<B>,
    pub layer2: ResidualLayer<B>,
    pub layer3: ResidualLayer<B>,
    pub layer4: ResidualLayer<B>,
    pub fc: Linear<B>,
    relu: Relu,
    maxpool: MaxPool2d,
    avgpool: AdaptiveAvgPool2d,
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Output width of the classifier head.
    pub num_classes: usize,
}

impl ResNetConfig {
    /// Build the skeleton with freshly initialized parameters.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let [w1, w2, w3, w4] = STAGE_WIDTHS;
        let [n1, n2, n3, n4] = RESNET18_BLOCKS;

        ResNet {
            conv1: Conv2dConfig::new([IN_CHANNELS, w1], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(w1).init(device),
            layer1: ResidualLayer::new(n1, w1, w1, 1, device),
            layer2: ResidualLayer::new(n2, w1, w2, 2, device),
            layer3: ResidualLayer::new(n3, w2, w3, 2, device),
            layer4: ResidualLayer::new(n4, w3, w4, 2, device),
            fc: LinearConfig::new(FEATURE_WIDTH, self.num_classes).init(device),
            relu: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }
}

impl<B: Backend> ResNet<B> {
    /// Replace the classifier head with a fresh layer of `num_classes` outputs,
    /// keeping the head's input width.
    pub fn with_classifier(mut self, num_classes: usize, device: &B::Device) -> Self {
        let [d_input, _] = self.fc.weight.val().dims();
        self.fc = LinearConfig::new(d_input, num_classes).init(device);
        self
    }

    /// Output width of the classifier head.
    pub fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }

    /// Residual stages in execution order.
    pub fn layers(&self) -> [(&'static str, &ResidualLayer<B>); 4] {
        [
            ("layer1", &self.layer1),
            ("layer2", &self.layer2),
            ("layer3", &self.layer3),
            ("layer4", &self.layer4),
        ]
    }

    /// Forward pass: input [batch, 3, H, W] -> logits [batch, num_classes].
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.maxpool.forward(x);
        let x = self
            .layers()
            .into_iter()
            .fold(x, |x, (_, layer)| layer.forward(x));
        let x = self.avgpool.forward(x);
        let x: Tensor<B, 2> = x.flatten(1, 3);
        self.fc.forward(x)
    }

    /// Parameter shapes keyed by their torchvision names.
    ///
    /// Linear weights are reported as `[out, in]` so that shapes read the same
    /// way they do in the checkpoint being loaded.
    pub fn parameter_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        let mut shapes = BTreeMap::new();
        conv_shapes(&mut shapes, "conv1", &self.conv1);
        bn_shapes(&mut shapes, "bn1", &self.bn1);

        for (layer_name, layer) in self.layers() {
            for (i, block) in layer.blocks.iter().enumerate() {
                let prefix = format!("{layer_name}.{i}");
                block_shapes(&mut shapes, &prefix, block);
            }
        }

        let [d_input, d_output] = self.fc.weight.val().dims();
        shapes.insert("fc.weight".to_string(), vec![d_output, d_input]);
        if let Some(bias) = &self.fc.bias {
            shapes.insert("fc.bias".to_string(), bias.val().dims().to_vec());
        }
        shapes
    }

    /// Total number of scalar values held by the network, running statistics included.
    pub fn parameter_count(&self) -> usize {
        self.parameter_shapes()
            .values()
            .map(|dims| dims.iter().product::<usize>())
            .sum()
    }
}

fn block_shapes<B: Backend>(
    shapes: &mut BTreeMap<String, Vec<usize>>,
    prefix: &str,
    block: &BasicBlock<B>,
) {
    conv_shapes(shapes, &format!("{prefix}.conv1"), &block.conv1);
    bn_shapes(shapes, &format!("{prefix}.bn1"), &block.bn1);
    conv_shapes(shapes, &format!("{prefix}.conv2"), &block.conv2);
    bn_shapes(shapes, &format!("{prefix}.bn2"), &block.bn2);
    if let Some(downsample) = &block.downsample {
        conv_shapes(shapes, &format!("{prefix}.downsample.0"), &downsample.conv);
        bn_shapes(shapes, &format!("{prefix}.downsample.1"), &downsample.bn);
    }
}

fn conv_shapes<B: Backend>(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, conv: &Conv2d<B>) {
    shapes.insert(format!("{prefix}.weight"), conv.weight.val().dims().to_vec());
    if let Some(bias) = &conv.bias {
        shapes.insert(format!("{prefix}.bias"), bias.val().dims().to_vec());
    }
}

fn bn_shapes<B: Backend>(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, bn: &BatchNorm<B>) {
    shapes.insert(format!("{prefix}.weight"), bn.gamma.val().dims().to_vec());
    shapes.insert(format!("{prefix}.bias"), bn.beta.val().dims().to_vec());
    shapes.insert(
        format!("{prefix}.running_mean"),
        bn.running_mean.value().dims().to_vec(),
    );
    shapes.insert(
        format!("{prefix}.running_var"),
        bn.running_var.value().dims().to_vec(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_imagenet_head_width() {
        let device = Default::default();
        let network = ResNetConfig::new(IMAGENET_CLASSES).init::<TestBackend>(&device);
        assert_eq!(network.num_classes(), 1000);
    }

    #[test]
    fn test_with_classifier_replaces_head() {
        let device = Default::default();
        let network = ResNetConfig::new(IMAGENET_CLASSES)
            .init::<TestBackend>(&device)
            .with_classifier(20, &device);

        assert_eq!(network.num_classes(), 20);
        let shapes = network.parameter_shapes();
        assert_eq!(shapes["fc.weight"], vec![20, 512]);
        assert_eq!(shapes["fc.bias"], vec![20]);
    }

    #[test]
    fn test_parameter_names_follow_torchvision() {
        let device = Default::default();
        let network = ResNetConfig::new(20).init::<TestBackend>(&device);
        let shapes = network.parameter_shapes();

        assert_eq!(shapes["conv1.weight"], vec![64, 3, 7, 7]);
        assert_eq!(shapes["bn1.running_var"], vec![64]);
        assert_eq!(shapes["layer1.0.conv1.weight"], vec![64, 64, 3, 3]);
        assert_eq!(shapes["layer2.0.downsample.0.weight"], vec![128, 64, 1, 1]);
        assert_eq!(shapes["layer4.1.bn2.bias"], vec![512]);
        assert!(!shapes.contains_key("layer1.0.downsample.0.weight"));
        assert!(!shapes.contains_key("conv1.bias"));
        // 1 stem conv + 1 stem bn (4) + 8 blocks x (2 conv + 2 bn x 4) + 3 downsamples x 5 + fc (2)
        assert_eq!(shapes.len(), 1 + 4 + 8 * 10 + 3 * 5 + 2);
    }

    #[test]
    fn test_parameter_count_matches_resnet18() {
        let device = Default::default();
        let network = ResNetConfig::new(IMAGENET_CLASSES).init::<TestBackend>(&device);
        // 11_689_512 learnable values plus 9_600 running statistics.
        assert_eq!(network.parameter_count(), 11_689_512 + 9_600);
    }

    #[test]
    fn test_forward_output_shape() {
        let device = Default::default();
        let network = ResNetConfig::new(5).init::<TestBackend>(&device);

        let input = Tensor::zeros([2, 3, 32, 32], &device);
        let output = network.forward(input);
        assert_eq!(output.dims(), [2, 5]);
    }
}
