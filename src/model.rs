use burn::{
    nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::{log_softmax, sigmoid},
    train::ClassificationOutput,
};

use crate::dataset::{HEIGHT, NUM_SUBJECTS, WIDTH};

/// Number of input features of a flattened face image.
pub const IN_FEATURES: usize = HEIGHT * WIDTH;

/// Classifier of flattened face images.
pub trait FaceClassifier<B: Backend> {
    /// Name of the model, used to name its checkpoint.
    fn name(&self) -> &'static str;

    /// Log-probabilities `[batch_size, num_classes]` of images `[batch_size, in_features]`.
    fn log_probs(&self, images: Tensor<B, 2>) -> Tensor<B, 2>;

    fn forward_classification(
        &self,
        images: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.log_probs(images);
        // Log-softmax is idempotent, so the cross entropy of log-probabilities is their NLL.
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

#[derive(Config, Debug)]
pub struct SoftmaxRegressionConfig {
    #[config(default = "IN_FEATURES")]
    pub in_features: usize,
    #[config(default = "NUM_SUBJECTS")]
    pub num_classes: usize,
}

/// Softmax regression classifier.
///
/// A generalization of logistic regression to more than two classes, here one class per
/// subject. It can be seen as a neural network without hidden layer.
#[derive(Module, Debug)]
pub struct SoftmaxRegression<B: Backend> {
    regression: Linear<B>,
}

impl SoftmaxRegressionConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SoftmaxRegression<B> {
        SoftmaxRegression {
            regression: LinearConfig::new(self.in_features, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> SoftmaxRegression<B> {
    /// # Shapes
    ///   - Images [batch_size, in_features]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        log_softmax(self.regression.forward(images), 1)
    }
}

impl<B: Backend> FaceClassifier<B> for SoftmaxRegression<B> {
    fn name(&self) -> &'static str {
        "softmaxregression"
    }

    fn log_probs(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

#[derive(Config, Debug)]
pub struct MlpConfig {
    #[config(default = "IN_FEATURES")]
    pub in_features: usize,
    #[config(default = 3000)]
    pub hidden_size: usize,
    #[config(default = "NUM_SUBJECTS")]
    pub num_classes: usize,
}

/// Multilayer perceptron with one hidden layer of sigmoid units and a softmax output layer.
///
/// The hidden layer maps the images to a space where the subjects are separable by the output
/// softmax regression.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    hidden: Linear<B>,
    prediction: Linear<B>,
}

impl MlpConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            hidden: LinearConfig::new(self.in_features, self.hidden_size).init(device),
            prediction: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> Mlp<B> {
    /// # Shapes
    ///   - Images [batch_size, in_features]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.hidden.forward(images);
        let x = sigmoid(x);
        let x = self.prediction.forward(x);

        log_softmax(x, 1)
    }
}

impl<B: Backend> FaceClassifier<B> for Mlp<B> {
    fn name(&self) -> &'static str {
        "mlp"
    }

    fn log_probs(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray;

    fn assert_log_probs(output: Tensor<TestBackend, 2>, batch_size: usize, num_classes: usize) {
        assert_eq!(output.dims(), [batch_size, num_classes]);

        let probs = output.exp().into_data().to_vec::<f32>().unwrap();
        for row in probs.chunks(num_classes) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "probabilities sum to {sum}");
        }
    }

    #[test]
    fn default_configs_match_the_images() {
        let config = SoftmaxRegressionConfig::new();
        assert_eq!(config.in_features, 112 * 92);
        assert_eq!(config.num_classes, 40);

        let config = MlpConfig::new();
        assert_eq!(config.hidden_size, 3000);
    }

    #[test]
    fn softmax_regression_outputs_log_probabilities() {
        let device = Default::default();
        let model = SoftmaxRegressionConfig::new()
            .with_in_features(6)
            .with_num_classes(4)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 2>::random(
            [3, 6],
            burn::tensor::Distribution::Default,
            &device,
        );

        assert_log_probs(model.forward(images), 3, 4);
    }

    #[test]
    fn mlp_outputs_log_probabilities() {
        let device = Default::default();
        let model = MlpConfig::new()
            .with_in_features(6)
            .with_hidden_size(5)
            .with_num_classes(4)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 2>::ones([2, 6], &device);

        assert_log_probs(model.forward(images), 2, 4);
    }

    #[test]
    fn forward_classification_computes_a_loss() {
        let device = Default::default();
        let model = SoftmaxRegressionConfig::new()
            .with_in_features(6)
            .with_num_classes(3)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 2>::ones([2, 6], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 2], &device);
        let output = model.forward_classification(images, targets);

        let loss = output.loss.into_scalar().elem::<f32>();
        assert!(loss.is_finite() && loss > 0.0);
        assert_eq!(output.output.dims(), [2, 3]);
    }
}
