//! Loading the trained model and running inference on normalized digits

use crate::config::Settings;
use crate::model::{Net, NUM_CLASSES};
use crate::normalize::MnistImage;
use crate::train;
use crate::util::DEVICE;
use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tch::{nn, nn::ModuleT, no_grad, Device, Kind, Tensor};
use tracing::{info, warn};

/// A 10-way class prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// The most likely digit
    pub digit: usize,

    /// Probability of `digit`
    pub confidence: f32,

    /// Probability of every digit, indexed by digit
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Build from a softmax distribution. Ties go to the lowest digit.
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != NUM_CLASSES as usize {
            bail!(
                "expected {NUM_CLASSES} class probabilities, got {}",
                probabilities.len()
            );
        }
        if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0) {
            bail!("class probabilities must be finite and non-negative: {probabilities:?}");
        }

        let (digit, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, probabilities[0]), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });

        Ok(Prediction {
            digit,
            confidence,
            probabilities,
        })
    }
}

/// Anything that maps a batch of normalized digits to class distributions.
/// Shared read-only between all requests.
pub trait Classifier: Send + Sync {
    fn classify(&self, images: &[MnistImage]) -> Result<Vec<Prediction>>;
}

/// The CNN from `model`, backed by libtorch
pub struct TorchClassifier {
    vs: nn::VarStore,
    net: Net,
}

impl TorchClassifier {
    /// Load trained weights from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut classifier = Self::untrained(*DEVICE);
        classifier
            .vs
            .load(path.as_ref())
            .map_err(|e| anyhow!("failed to load model {}: {e}", path.as_ref().display()))?;
        classifier.vs.freeze();
        Ok(classifier)
    }

    /// A randomly initialized network on `device`
    pub fn untrained(device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let net = Net::new(&vs.root());
        TorchClassifier { vs, net }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }
}

impl Classifier for TorchClassifier {
    fn classify(&self, images: &[MnistImage]) -> Result<Vec<Prediction>> {
        if images.is_empty() {
            return Ok(vec![]);
        }

        let flat: Vec<f32> = images
            .iter()
            .flat_map(|img| img.pixels().iter().copied())
            .collect();
        let xs = Tensor::from_slice(&flat)
            .view([images.len() as i64, MnistImage::LEN as i64])
            .to_device(self.device());

        let output = no_grad(|| self.net.forward_t(&xs, false))
            .softmax(-1, Some(Kind::Float))
            .to_device(Device::Cpu)
            .flatten(0, -1);
        let probabilities = Vec::<f32>::try_from(&output)?;

        probabilities
            .chunks(NUM_CLASSES as usize)
            .map(|p| Prediction::from_probabilities(p.to_vec()))
            .collect()
    }
}

/// Load the model at `settings.model_path`, training and saving it first if
/// it does not exist and `train_if_missing` is set
pub fn load_or_train(settings: &Settings) -> Result<Arc<dyn Classifier>> {
    let path = &settings.model_path;
    if !path.exists() {
        if !settings.train_if_missing {
            bail!(
                "model {} does not exist and train_if_missing is off; run `train` first",
                path.display()
            );
        }
        warn!("model {} not found, training a new one", path.display());
        train::train_and_save(settings)?;
    }

    let classifier = TorchClassifier::load(path)?;
    info!(
        "loaded model {} on {:?}",
        path.display(),
        classifier.device()
    );
    Ok(Arc::new(classifier))
}
