//! Two-stage convolutional classifier for small inputs.
//!
//! Shapes:
//! - Input images: `[B, C, H, W]` with `H, W >= 4`
//! - Embeddings: `[B, channels.1]`

use crate::{ClassifierInit, ImageClassifier};
use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone, Copy)]
pub struct SmallCnnConfig {
    pub channels: (usize, usize),
}

impl Default for SmallCnnConfig {
    fn default() -> Self {
        Self { channels: (32, 64) }
    }
}

#[derive(Module, Debug)]
pub struct SmallCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    head: nn::Linear<B>,
    embedding_dim: usize,
    num_classes: usize,
}

impl<B: Backend> SmallCnn<B> {
    pub fn new(cfg: SmallCnnConfig, input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        let (c1, c2) = cfg.channels;
        let conv1 = Conv2dConfig::new([input_shape[0], c1], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let conv2 = Conv2dConfig::new([c1, c2], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        let global_pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let head = nn::LinearConfig::new(c2, num_classes).init(device);
        Self {
            conv1,
            conv2,
            pool,
            global_pool,
            head,
            embedding_dim: c2,
            num_classes,
        }
    }
}

impl<B: Backend> ImageClassifier<B> for SmallCnn<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(relu(self.conv1.forward(images)));
        let x = self.pool.forward(relu(self.conv2.forward(x)));
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

impl<B: Backend> ClassifierInit<B> for SmallCnn<B> {
    fn init(input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        Self::new(SmallCnnConfig::default(), input_shape, num_classes, device)
    }

    fn with_fresh_head(self, num_classes: usize, device: &B::Device) -> Self {
        Self {
            head: nn::LinearConfig::new(self.embedding_dim, num_classes).init(device),
            num_classes,
            ..self
        }
    }
}
