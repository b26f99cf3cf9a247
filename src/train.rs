//! Offline training of the digit classifier on MNIST

use crate::config::{Settings, TrainingSettings};
use crate::model::Net;
use crate::util::DEVICE;
use anyhow::{anyhow, Context, Result};
use plotters::prelude::{
    BitMapBackend, ChartBuilder, IntoDrawingArea, LineSeries, BLUE, RED, WHITE,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tch::data::Iter2;
use tch::nn::{self, ModuleT, OptimizerConfig};
use tch::vision::dataset::Dataset;
use tch::{no_grad, Device, Kind, Tensor};
use tracing::{debug, info, warn};

/// Batch size used when evaluating, independent of the training batch size
const EVAL_BATCH_SIZE: i64 = 1024;

/// Size of the history chart: accuracy on the left, loss on the right
pub const PLOT_SIZE: (u32, u32) = (1200, 400);

/// Loss and accuracy over one pass of a split
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train: Metrics,
    pub validation: Metrics,
}

/// What happened during training, written next to the model
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub epochs: Vec<EpochStats>,

    /// The epoch whose weights were kept
    pub best_epoch: usize,

    /// Accuracy of the kept weights on the test split
    pub test_accuracy: f64,
}

/// Train a fresh network on `data`. Stops early once the validation loss has
/// not improved for `patience` epochs and returns the best weights seen.
pub fn train(
    config: &TrainingSettings,
    data: &Dataset,
    device: Device,
) -> Result<(nn::VarStore, History)> {
    let mut vs = nn::VarStore::new(device);
    let net = Net::new(&vs.root());
    let mut opt = nn::Adam::default().build(&vs, config.learning_rate)?;

    let mut best = nn::VarStore::new(device);
    let _ = Net::new(&best.root());
    best.copy(&vs)?;

    let mut epochs = Vec::with_capacity(config.epochs);
    let mut best_epoch = 0;
    let mut best_loss = f64::INFINITY;
    let mut stale = 0;

    for epoch in 1..=config.epochs {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;

        let mut batches = data.train_iter(config.batch_size as i64);
        batches.return_smaller_last_batch();
        for (xs, ys) in batches.shuffle().to_device(device) {
            let logits = net.forward_t(&xs, true);
            let loss = logits.cross_entropy_for_logits(&ys);
            opt.backward_step(&loss);

            let n = ys.size()[0];
            loss_sum += loss.double_value(&[]) * n as f64;
            correct += count_correct(&logits, &ys);
            seen += n;
        }
        if seen == 0 {
            return Err(anyhow!("training split is empty"));
        }

        let train = Metrics {
            loss: loss_sum / seen as f64,
            accuracy: correct as f64 / seen as f64,
        };
        let validation = evaluate(&net, &data.test_images, &data.test_labels, device);
        info!(
            "epoch {epoch}/{}: loss {:.4} acc {:.4} val_loss {:.4} val_acc {:.4}",
            config.epochs, train.loss, train.accuracy, validation.loss, validation.accuracy
        );
        epochs.push(EpochStats {
            epoch,
            train,
            validation,
        });

        if validation.loss < best_loss {
            best_loss = validation.loss;
            best_epoch = epoch;
            best.copy(&vs)?;
            stale = 0;
        } else {
            stale += 1;
            if stale >= config.patience {
                info!("no improvement for {stale} epochs, stopping early");
                break;
            }
        }
    }

    vs.copy(&best)?;
    let test_accuracy = evaluate(&net, &data.test_images, &data.test_labels, device).accuracy;
    debug!("restored weights from epoch {best_epoch}");

    Ok((
        vs,
        History {
            epochs,
            best_epoch,
            test_accuracy,
        },
    ))
}

/// Load MNIST from `settings.mnist_dir`, train, then write the model and the
/// training history
pub fn train_and_save(settings: &Settings) -> Result<History> {
    let data = tch::vision::mnist::load_dir(&settings.mnist_dir).with_context(|| {
        format!(
            "failed to load MNIST from {}",
            settings.mnist_dir.display()
        )
    })?;
    info!(
        "loaded MNIST: {} train / {} test images",
        data.train_images.size()[0],
        data.test_images.size()[0]
    );

    let (vs, history) = train(&settings.training, &data, *DEVICE)?;
    info!("accuracy: {:.2}%", history.test_accuracy * 100.0);

    let path = &settings.model_path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    vs.save(path)
        .with_context(|| format!("failed to save model to {}", path.display()))?;
    info!("model saved to {}", path.display());

    let history_path = &settings.training.history_path;
    if let Some(dir) = history_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(history_path, serde_json::to_vec_pretty(&history)?)?;
    info!("training history saved to {}", history_path.display());

    let plot_path = &settings.training.plot_path;
    match plot_history(&history, plot_path) {
        Ok(()) => info!("training plot saved to {}", plot_path.display()),
        Err(e) => warn!("{e:#}"),
    }

    Ok(history)
}

/// Draw accuracy (left) and loss (right) per epoch into a PNG. Training is
/// blue, validation red.
pub fn plot_history(history: &History, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    draw_history(history, path)
        .map_err(|e| anyhow!("failed to plot training history to {}: {e}", path.display()))
}

fn draw_history(
    history: &History,
    path: &Path,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let (left, right) = root.split_horizontally(PLOT_SIZE.0 / 2);

    let epochs = history.epochs.len().max(1) as f64;
    let x_range = 0.5..epochs + 0.5;
    let max_loss = history
        .epochs
        .iter()
        .flat_map(|e| [e.train.loss, e.validation.loss])
        .filter(|l| l.is_finite())
        .fold(f64::EPSILON, f64::max);

    let panels = [
        (&left, 1.0, (|m: &Metrics| m.accuracy) as fn(&Metrics) -> f64),
        (&right, max_loss * 1.1, |m: &Metrics| m.loss),
    ];
    for (area, top, value) in panels {
        let mut chart = ChartBuilder::on(area)
            .margin(20)
            .build_cartesian_2d(x_range.clone(), 0.0..top)?;
        chart.draw_series(LineSeries::new(
            history.epochs.iter().map(|e| (e.epoch as f64, value(&e.train))),
            &BLUE,
        ))?;
        chart.draw_series(LineSeries::new(
            history
                .epochs
                .iter()
                .map(|e| (e.epoch as f64, value(&e.validation))),
            &RED,
        ))?;
    }

    root.present()?;
    Ok(())
}

/// Mean loss and accuracy of `net` over a whole split
pub fn evaluate(net: &Net, images: &Tensor, labels: &Tensor, device: Device) -> Metrics {
    no_grad(|| {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;

        let mut batches = Iter2::new(images, labels, EVAL_BATCH_SIZE);
        batches.return_smaller_last_batch();
        for (xs, ys) in batches.to_device(device) {
            let logits = net.forward_t(&xs, false);
            let n = ys.size()[0];
            loss_sum += logits.cross_entropy_for_logits(&ys).double_value(&[]) * n as f64;
            correct += count_correct(&logits, &ys);
            seen += n;
        }

        match seen {
            0 => Metrics {
                loss: 0.0,
                accuracy: 0.0,
            },
            _ => Metrics {
                loss: loss_sum / seen as f64,
                accuracy: correct as f64 / seen as f64,
            },
        }
    })
}

fn count_correct(logits: &Tensor, labels: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// A toy two-class problem: a bright left half is a 0, a bright right
    /// half is a 1
    fn toy_samples(n: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
        (0..n)
            .map(|i| {
                let label = (i % 2) as u8;
                let image = (0..28 * 28)
                    .map(|p| {
                        let left = p % 28 < 14;
                        if left == (label == 0) {
                            255
                        } else {
                            0
                        }
                    })
                    .collect();
                (image, label)
            })
            .unzip()
    }

    fn toy_dataset(n: usize) -> Dataset {
        let (images, labels) = toy_samples(n);
        let flat: Vec<u8> = images.concat();
        let images = Tensor::from_slice(&flat)
            .view([n as i64, 784])
            .to_kind(Kind::Float)
            / 255.;
        let labels = Tensor::from_slice(&labels).to_kind(Kind::Int64);
        Dataset {
            train_images: images.shallow_clone(),
            train_labels: labels.shallow_clone(),
            test_images: images,
            test_labels: labels,
            labels: 10,
        }
    }

    fn write_idx(path: &Path, magic: u32, dims: &[u32], data: &[u8]) {
        let mut file = fs::File::create(path).unwrap();
        file.write_all(&magic.to_be_bytes()).unwrap();
        for d in dims {
            file.write_all(&d.to_be_bytes()).unwrap();
        }
        file.write_all(data).unwrap();
    }

    /// Write a toy dataset in the raw MNIST IDX layout
    pub(crate) fn write_toy_mnist(dir: &Path, n: usize) {
        let (images, labels) = toy_samples(n);
        let images = images.concat();
        for split in ["train", "t10k"] {
            write_idx(
                &dir.join(format!("{split}-images-idx3-ubyte")),
                2051,
                &[n as u32, 28, 28],
                &images,
            );
            write_idx(
                &dir.join(format!("{split}-labels-idx1-ubyte")),
                2049,
                &[n as u32],
                &labels,
            );
        }
    }

    pub(crate) fn toy_settings(root: &Path) -> Settings {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "model_path = {:?}\nmnist_dir = {:?}\nstatic_dir = {:?}\n\n[training]\nepochs = 3\nbatch_size = 8\nlearning_rate = 0.01\nhistory_path = {:?}\nplot_path = {:?}\n",
            root.join("models/digit_model.ot"),
            root.join("mnist"),
            root.join("static"),
            root.join("history.json"),
            root.join("plots/history.png"),
        )
        .unwrap();
        Settings::load(Some(file.path())).unwrap()
    }

    #[test]
    fn test_train_toy() {
        tch::manual_seed(0);
        let settings = toy_settings(Path::new("/tmp"));
        let data = toy_dataset(64);

        let (_, history) = train(&settings.training, &data, Device::Cpu).unwrap();
        assert!(!history.epochs.is_empty());
        assert!(history.epochs.len() <= 3);
        assert!((1..=history.epochs.len()).contains(&history.best_epoch));
        for stats in &history.epochs {
            assert!((0.0..=1.0).contains(&stats.train.accuracy));
            assert!((0.0..=1.0).contains(&stats.validation.accuracy));
            assert!(stats.train.loss.is_finite());
        }
        assert!(history.test_accuracy > 0.5, "{history:?}");
    }

    #[test]
    fn test_train_and_save() {
        tch::manual_seed(0);
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("mnist")).unwrap();
        write_toy_mnist(&dir.path().join("mnist"), 32);
        let settings = toy_settings(dir.path());

        let history = train_and_save(&settings).unwrap();
        assert!(settings.model_path.exists());

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&settings.training.history_path).unwrap()).unwrap();
        assert_eq!(written["best_epoch"], history.best_epoch);
        assert_eq!(
            written["epochs"].as_array().unwrap().len(),
            history.epochs.len()
        );

        let plot = image::open(&settings.training.plot_path).unwrap();
        assert_eq!((plot.width(), plot.height()), PLOT_SIZE);
    }

    #[test]
    fn test_plot_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.png");
        let metrics = |loss, accuracy| Metrics { loss, accuracy };
        let history = History {
            epochs: vec![
                EpochStats {
                    epoch: 1,
                    train: metrics(0.9, 0.6),
                    validation: metrics(0.7, 0.7),
                },
                EpochStats {
                    epoch: 2,
                    train: metrics(0.4, 0.85),
                    validation: metrics(0.5, 0.8),
                },
            ],
            best_epoch: 2,
            test_accuracy: 0.8,
        };

        plot_history(&history, &path).unwrap();
        let plot = image::open(&path).unwrap().to_rgb8();
        assert_eq!(plot.dimensions(), PLOT_SIZE);
        // something besides the white background was drawn
        assert!(plot.pixels().any(|p| p.0 != [255, 255, 255]));
    }

    #[test]
    fn test_missing_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let settings = toy_settings(dir.path());
        let err = train_and_save(&settings).unwrap_err();
        assert!(err.to_string().contains("failed to load MNIST"));
    }

    #[test]
    fn test_evaluate_empty() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = Net::new(&vs.root());
        let images = Tensor::zeros([0, 784], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros([0], (Kind::Int64, Device::Cpu));
        let metrics = evaluate(&net, &images, &labels, Device::Cpu);
        assert_eq!(metrics.accuracy, 0.0);
    }
}
