use crate::optim::choose_optimizer;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};
use rand::prelude::*;
use serde::Deserialize;

/// Number of classes, one per input dimension: the label is "which dimension
/// holds the maximum".
pub const CLASS_COUNT: usize = 5;

/// What to apply to the logits before the cross-entropy.
///
/// `Sigmoid` squashes the logits first, so the loss sees activations rather
/// than the raw logits it nominally expects. That pairing is how the task is
/// defined (and what existing checkpoints were trained with), so it stays the
/// default; `Identity` feeds the logits straight through for the conventional
/// formulation. The choice is explicit config, never silently rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Sigmoid,
    Identity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub train_samples: usize,
    pub input_size: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub activation: Activation,
    pub checkpoint_path: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 20,
            train_samples: 5000,
            input_size: 5,
            learning_rate: 1e-3,
            optimizer: "adam".to_string(),
            activation: Activation::Sigmoid,
            checkpoint_path: "max_picker.safetensors".to_string(),
        }
    }
}

/// Linear projection to [`CLASS_COUNT`] logits plus the configured activation.
pub struct MaxPicker {
    linear: Linear,
    activation: Activation,
}

impl MaxPicker {
    pub fn new(input_size: usize, activation: Activation, vb: VarBuilder) -> Result<Self> {
        let linear = linear(input_size, CLASS_COUNT, vb.pp("linear"))?;
        Ok(Self { linear, activation })
    }

    /// Activated class scores, shape `(batch, CLASS_COUNT)`.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.linear.forward(x)?;
        match self.activation {
            Activation::Sigmoid => ops::sigmoid(&logits),
            Activation::Identity => Ok(logits),
        }
    }

    /// Cross-entropy of the activated scores against a one-hot target.
    pub fn loss(&self, x: &Tensor, target: &Tensor) -> Result<Tensor> {
        let pred = self.predict(x)?;
        soft_cross_entropy(&pred, target)
    }
}

/// Cross-entropy against a one-hot (or soft) target distribution:
/// `mean(-sum(target * log_softmax(pred)))`.
pub fn soft_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let logp = ops::log_softmax(pred, D::Minus1)?;
    target.mul(&logp)?.sum(D::Minus1)?.neg()?.mean_all()
}

/// One-hot label at the index of the maximum component.
pub fn label_for(x: &[f32]) -> Vec<f32> {
    let mut y = vec![0f32; x.len()];
    let mut max_idx = 0usize;
    for (i, v) in x.iter().enumerate() {
        if *v > x[max_idx] {
            max_idx = i;
        }
    }
    if !y.is_empty() {
        y[max_idx] = 1.0;
    }
    y
}

/// A random vector in `[0, 1)^input_size` and its one-hot argmax label.
pub fn build_sample(input_size: usize, rng: &mut impl Rng) -> (Vec<f32>, Vec<f32>) {
    let x: Vec<f32> = (0..input_size).map(|_| rng.gen::<f32>()).collect();
    let y = label_for(&x);
    (x, y)
}

pub fn build_dataset(
    total: usize,
    input_size: usize,
    rng: &mut impl Rng,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut xs = Vec::with_capacity(total * input_size);
    let mut ys = Vec::with_capacity(total * input_size);
    for _ in 0..total {
        let (mut x, mut y) = build_sample(input_size, rng);
        xs.append(&mut x);
        ys.append(&mut y);
    }
    let x = Tensor::from_vec(xs, (total, input_size), device)?;
    let y = Tensor::from_vec(ys, (total, input_size), device)?;
    Ok((x, y))
}

/// Accuracy over a fresh 100-sample held-out set: exact argmax match,
/// `correct / (correct + wrong)`.
pub fn evaluate(
    model: &MaxPicker,
    input_size: usize,
    device: &Device,
    rng: &mut impl Rng,
) -> Result<f32> {
    let (x, y) = build_dataset(100, input_size, rng, device)?;
    let pred_idx = model.predict(&x)?.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let true_idx = y.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let correct = pred_idx
        .iter()
        .zip(true_idx.iter())
        .filter(|(p, t)| p == t)
        .count();
    let wrong = pred_idx.len() - correct;
    Ok(correct as f32 / (correct + wrong) as f32)
}

/// Epoch/batch training driver. Returns the `(accuracy, mean batch loss)` log
/// per epoch and saves the final weights to `cfg.checkpoint_path`.
pub fn training_loop(cfg: &TrainConfig) -> anyhow::Result<Vec<(f32, f32)>> {
    let device = Device::cuda_if_available(0)?;
    let mut rng = rand::thread_rng();

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = MaxPicker::new(cfg.input_size, cfg.activation, vb)?;
    let mut optim = choose_optimizer(&cfg.optimizer, cfg.learning_rate, varmap.all_vars())?;

    let (train_x, train_y) = build_dataset(cfg.train_samples, cfg.input_size, &mut rng, &device)?;

    let mut log = Vec::with_capacity(cfg.epochs);
    for epoch in 0..cfg.epochs {
        let mut watch_loss = Vec::new();
        for batch_idx in 0..cfg.train_samples / cfg.batch_size {
            let x = train_x.narrow(0, batch_idx * cfg.batch_size, cfg.batch_size)?;
            let y = train_y.narrow(0, batch_idx * cfg.batch_size, cfg.batch_size)?;
            let loss = model.loss(&x, &y)?;
            optim.backward_step(&loss)?;
            watch_loss.push(loss.to_scalar::<f32>()?);
        }
        let mean_loss = watch_loss.iter().sum::<f32>() / watch_loss.len().max(1) as f32;
        let acc = evaluate(&model, cfg.input_size, &device, &mut rng)?;
        println!(
            "epoch {}: mean loss {:.6}, accuracy {:.4}",
            epoch + 1,
            mean_loss,
            acc
        );
        log.push((acc, mean_loss));
    }

    varmap.save(&cfg.checkpoint_path)?;
    Ok(log)
}

/// Rebuild the model, load a checkpoint and predict caller-supplied vectors.
pub fn predict_file(cfg: &TrainConfig, inputs: &[Vec<f32>]) -> anyhow::Result<Vec<Vec<f32>>> {
    let device = Device::cuda_if_available(0)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = MaxPicker::new(cfg.input_size, cfg.activation, vb)?;
    varmap.load(&cfg.checkpoint_path)?;

    let flat: Vec<f32> = inputs.iter().flatten().copied().collect();
    let x = Tensor::from_vec(flat, (inputs.len(), cfg.input_size), &device)?;
    let pred = model.predict(&x)?;
    Ok(pred.to_vec2::<f32>()?)
}
