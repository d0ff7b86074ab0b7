use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// 1x1 strided projection applied to the shortcut when a block changes
/// width or resolution.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(0, 0))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

/// Two 3x3 convolutions with a residual shortcut.
///
/// ```text
/// x ─ conv1(3x3, stride) ─ bn1 ─ relu ─ conv2(3x3) ─ bn2 ─┐
///  └──────────── downsample (optional) ───────────────── (+) ─ relu
/// ```
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub downsample: Option<Downsample<B>>,
    relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        BasicBlock {
            conv1: conv3x3(in_channels, out_channels, stride, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, 1, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));
        self.relu.forward(x + identity)
    }
}

/// A stage of residual blocks sharing one output width.
#[derive(Module, Debug)]
pub struct ResidualLayer<B: Backend> {
    pub blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> ResidualLayer<B> {
    /// Build `num_blocks` blocks; only the first one changes width or stride.
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| {
                if i == 0 {
                    BasicBlock::new(in_channels, out_channels, stride, device)
                } else {
                    BasicBlock::new(out_channels, out_channels, 1, device)
                }
            })
            .collect();
        ResidualLayer { blocks }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_block_without_downsample_keeps_shape() {
        let device = Default::default();
        let block = BasicBlock::<TestBackend>::new(8, 8, 1, &device);
        assert!(block.downsample.is_none());

        let output = block.forward(Tensor::zeros([2, 8, 6, 6], &device));
        assert_eq!(output.dims(), [2, 8, 6, 6]);
    }

    #[test]
    fn test_strided_block_downsamples() {
        let device = Default::default();
        let block = BasicBlock::<TestBackend>::new(8, 16, 2, &device);
        assert!(block.downsample.is_some());

        let output = block.forward(Tensor::zeros([1, 8, 6, 6], &device));
        assert_eq!(output.dims(), [1, 16, 3, 3]);
    }

    #[test]
    fn test_layer_only_first_block_projects() {
        let device = Default::default();
        let layer = ResidualLayer::<TestBackend>::new(2, 8, 16, 2, &device);
        assert_eq!(layer.blocks.len(), 2);
        assert!(layer.blocks[0].downsample.is_some());
        assert!(layer.blocks[1].downsample.is_none());
    }
}
