//! ResNet-18 (basic blocks) and ResNet-50 (bottleneck blocks) with group
//! normalization in place of batch normalization.

use crate::{ClassifierInit, ImageClassifier};
use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct ResNet18Config {
    pub widths: [usize; 4],
    pub blocks_per_stage: usize,
    pub norm_groups: usize,
}

impl Default for ResNet18Config {
    fn default() -> Self {
        Self {
            widths: [64, 128, 256, 512],
            blocks_per_stage: 2,
            norm_groups: 32,
        }
    }
}

fn conv3x3<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1x1<B: Backend>(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_ch, out_ch], [1, 1])
        .with_stride([stride, stride])
        .with_bias(false)
        .init(device)
}

fn group_norm<B: Backend>(groups: usize, channels: usize, device: &B::Device) -> GroupNorm<B> {
    // Groups must divide the channel count.
    let mut g = groups.clamp(1, channels);
    while channels % g != 0 {
        g -= 1;
    }
    GroupNormConfig::new(g, channels).init(device)
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: GroupNorm<B>,
    conv2: Conv2d<B>,
    norm2: GroupNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, groups: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_ch != out_ch).then(|| Downsample {
            conv: conv1x1(in_ch, out_ch, stride, device),
            norm: group_norm(groups, out_ch, device),
        });
        Self {
            conv1: conv3x3(in_ch, out_ch, stride, device),
            norm1: group_norm(groups, out_ch, device),
            conv2: conv3x3(out_ch, out_ch, 1, device),
            norm2: group_norm(groups, out_ch, device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.norm.forward(ds.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.norm1.forward(self.conv1.forward(x)));
        let out = self.norm2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

/// 1x1 reduce, 3x3, 1x1 expand; the stride sits on the 3x3 conv.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    norm1: GroupNorm<B>,
    conv2: Conv2d<B>,
    norm2: GroupNorm<B>,
    conv3: Conv2d<B>,
    norm3: GroupNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(
        in_ch: usize,
        width: usize,
        expansion: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let out_ch = width * expansion;
        let downsample = (stride != 1 || in_ch != out_ch).then(|| Downsample {
            conv: conv1x1(in_ch, out_ch, stride, device),
            norm: group_norm(groups, out_ch, device),
        });
        Self {
            conv1: conv1x1(in_ch, width, 1, device),
            norm1: group_norm(groups, width, device),
            conv2: conv3x3(width, width, stride, device),
            norm2: group_norm(groups, width, device),
            conv3: conv1x1(width, out_ch, 1, device),
            norm3: group_norm(groups, out_ch, device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.norm.forward(ds.conv.forward(x.clone())),
            None => x.clone(),
        };
        let out = relu(self.norm1.forward(self.conv1.forward(x)));
        let out = relu(self.norm2.forward(self.conv2.forward(out)));
        let out = self.norm3.forward(self.conv3.forward(out));
        relu(out + identity)
    }
}

/// Stem shared by both depths: 7x7 stride-2 conv, norm, ReLU, 3x3 max pool.
fn stem<B: Backend>(in_ch: usize, out_ch: usize, groups: usize, device: &B::Device) -> (Conv2d<B>, GroupNorm<B>, MaxPool2d) {
    let conv = Conv2dConfig::new([in_ch, out_ch], [7, 7])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(3, 3))
        .with_bias(false)
        .init(device);
    let pool = MaxPool2dConfig::new([3, 3])
        .with_strides([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init();
    (conv, group_norm(groups, out_ch, device), pool)
}

#[derive(Module, Debug)]
pub struct ResNet18<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: GroupNorm<B>,
    stem_pool: MaxPool2d,
    blocks: Vec<BasicBlock<B>>,
    global_pool: AdaptiveAvgPool2d,
    head: nn::Linear<B>,
    embedding_dim: usize,
    num_classes: usize,
}

impl<B: Backend> ResNet18<B> {
    pub fn new(cfg: ResNet18Config, input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        let [w0, ..] = cfg.widths;
        let (stem, stem_norm, stem_pool) = stem(input_shape[0], w0, cfg.norm_groups, device);

        let mut blocks = Vec::new();
        let mut in_ch = w0;
        for (stage, &width) in cfg.widths.iter().enumerate() {
            for b in 0..cfg.blocks_per_stage.max(1) {
                let stride = if stage > 0 && b == 0 { 2 } else { 1 };
                blocks.push(BasicBlock::new(in_ch, width, stride, cfg.norm_groups, device));
                in_ch = width;
            }
        }

        Self {
            stem,
            stem_norm,
            stem_pool,
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: nn::LinearConfig::new(in_ch, num_classes).init(device),
            embedding_dim: in_ch,
            num_classes,
        }
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet18<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        x = self.stem_pool.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.global_pool.forward(x).flatten::<2>(1, 3)
    }

    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(embeddings)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl<B: Backend> ClassifierInit<B> for ResNet18<B> {
    fn init(input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        Self::new(ResNet18Config::default(), input_shape, num_classes, device)
    }

    fn with_fresh_head(self, num_classes: usize, device: &B::Device) -> Self {
        Self {
            head: nn::LinearConfig::new(self.embedding_dim, num_classes).init(device),
            num_classes,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResNet50Config {
    pub widths: [usize; 4],
    pub blocks_per_stage: [usize; 4],
    /// Output channels of a bottleneck are `width * expansion`.
    pub expansion: usize,
    pub norm_groups: usize,
}

impl Default for ResNet50Config {
    fn default() -> Self {
        Self {
            widths: [64, 128, 256, 512],
            blocks_per_stage: [3, 4, 6, 3],
            expansion: 4,
            norm_groups: 32,
        }
    }
}

impl ResNet50Config {
    pub fn embedding_dim(&self) -> usize {
        self.widths[3] * self.expansion
    }
}

#[derive(Module, Debug)]
pub struct ResNet50<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: GroupNorm<B>,
    stem_pool: MaxPool2d,
    blocks: Vec<Bottleneck<B>>,
    global_pool: AdaptiveAvgPool2d,
    head: nn::Linear<B>,
    embedding_dim: usize,
    num_classes: usize,
}

impl<B: Backend> ResNet50<B> {
    pub fn new(cfg: ResNet50Config, input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        let [w0, ..] = cfg.widths;
        let (stem, stem_norm, stem_pool) = stem(input_shape[0], w0, cfg.norm_groups, device);
        let expansion = cfg.expansion.max(1);

        let mut blocks = Vec::new();
        let mut in_ch = w0;
        for (stage, (&width, &count)) in cfg.widths.iter().zip(&cfg.blocks_per_stage).enumerate() {
            for b in 0..count.max(1) {
                let stride = if stage > 0 && b == 0 { 2 } else { 1 };
                blocks.push(Bottleneck::new(in_ch, width, expansion, stride, cfg.norm_groups, device));
                in_ch = width * expansion;
            }
        }

        Self {
            stem,
            stem_norm,
            stem_pool,
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: nn::LinearConfig::new(in_ch, num_classes).init(device),
            embedding_dim: in_ch,
            num_classes,
        }
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet50<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        x = self.stem_pool.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.global_pool.forward(x).flatten::<2>(1, 3)
    }

    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(embeddings)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl<B: Backend> ClassifierInit<B> for ResNet50<B> {
    fn init(input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        Self::new(ResNet50Config::default(), input_shape, num_classes, device)
    }

    fn with_fresh_head(self, num_classes: usize, device: &B::Device) -> Self {
        Self {
            head: nn::LinearConfig::new(self.embedding_dim, num_classes).init(device),
            num_classes,
            ..self
        }
    }
}
