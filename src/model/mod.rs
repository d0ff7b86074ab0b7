mod block;
mod resnet;

pub use block::{BasicBlock, Downsample, ResidualLayer};
pub use resnet::{ResNet, ResNetConfig, ResNetRecord, FEATURE_WIDTH, IMAGENET_CLASSES, IN_CHANNELS};
