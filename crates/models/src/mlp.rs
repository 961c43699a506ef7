use crate::{ClassifierInit, ImageClassifier};
use burn::module::Module;
use burn::nn;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct MlpConfig {
    pub hidden: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self { hidden: 128 }
    }
}

#[derive(Debug, Module)]
pub struct Mlp<B: Backend> {
    linear1: nn::Linear<B>,
    linear2: nn::Linear<B>,
    head: nn::Linear<B>,
    hidden: usize,
    num_classes: usize,
}

impl<B: Backend> Mlp<B> {
    pub fn new(cfg: MlpConfig, input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        let input_dim: usize = input_shape.iter().product();
        let linear1 = nn::LinearConfig::new(input_dim, cfg.hidden).init(device);
        let linear2 = nn::LinearConfig::new(cfg.hidden, cfg.hidden).init(device);
        let head = nn::LinearConfig::new(cfg.hidden, num_classes).init(device);
        Self {
            linear1,
            linear2,
            head,
            hidden: cfg.hidden,
            num_classes,
        }
    }
}

impl<B: Backend> ImageClassifier<B> for Mlp<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = images.flatten::<2>(1, 3);
        let x = relu(self.linear1.forward(x));
        relu(self.linear2.forward(x))
    }

    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(embeddings)
    }

    fn embedding_dim(&self) -> usize {
        self.hidden
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl<B: Backend> ClassifierInit<B> for Mlp<B> {
    fn init(input_shape: [usize; 3], num_classes: usize, device: &B::Device) -> Self {
        Self::new(MlpConfig::default(), input_shape, num_classes, device)
    }

    fn with_fresh_head(self, num_classes: usize, device: &B::Device) -> Self {
        Self {
            head: nn::LinearConfig::new(self.hidden, num_classes).init(device),
            num_classes,
            ..self
        }
    }
}
