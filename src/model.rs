//! The convolutional digit classifier

use crate::normalize::MnistImage;
use tch::{nn, nn::ModuleT, Tensor};

/// Number of output classes, one per digit
pub const NUM_CLASSES: i64 = 10;

/// Dropout probability before the output layer, applied only while training
pub const DROPOUT: f64 = 0.5;

/// Three 3x3 convolutions with max pooling, a dense hidden layer and a
/// 10-way output. Produces logits.
#[derive(Debug)]
pub struct Net {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Net {
    pub fn new(vs: &nn::Path) -> Net {
        let conv1 = nn::conv2d(vs / "conv1", 1, 32, 3, Default::default());
        let conv2 = nn::conv2d(vs / "conv2", 32, 64, 3, Default::default());
        let conv3 = nn::conv2d(vs / "conv3", 64, 64, 3, Default::default());
        // 28 -> 26 -> 13 -> 11 -> 5 -> 3
        let fc1 = nn::linear(vs / "fc1", 3 * 3 * 64, 64, Default::default());
        let fc2 = nn::linear(vs / "fc2", 64, NUM_CLASSES, Default::default());
        Net {
            conv1,
            conv2,
            conv3,
            fc1,
            fc2,
        }
    }
}

impl ModuleT for Net {
    /// # Shapes
    ///   - Input [batch_size, 784] or [batch_size, 1, 28, 28]
    ///   - Output [batch_size, 10]
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let side = MnistImage::WIDTH as i64;
        xs.view([-1, 1, side, side])
            .apply(&self.conv1)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv2)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv3)
            .relu()
            .flat_view()
            .apply(&self.fc1)
            .relu()
            .dropout(DROPOUT, train)
            .apply(&self.fc2)
    }
}
