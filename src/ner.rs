use crate::crf::Crf;
use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE as BERT_DTYPE};
use serde::Deserialize;
use std::path::Path;

/// Label value excluded from the loss (padding / non-annotated positions).
pub const IGNORE_LABEL: i64 = -1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NerConfig {
    pub model_path: String,
    pub schema_path: String,
    pub train_data_path: String,
    pub valid_data_path: String,
    pub vocab_path: String,
    pub max_length: usize,
    pub epoch: usize,
    pub batch_size: usize,
    pub optimizer: String,
    pub learning_rate: f64,
    pub use_crf: bool,
    pub class_num: usize,
    pub bert_path: String,
}

impl Default for NerConfig {
    fn default() -> Self {
        Self {
            model_path: "model_output".to_string(),
            schema_path: "ner_data/schema.json".to_string(),
            train_data_path: "ner_data/train".to_string(),
            valid_data_path: "ner_data/test".to_string(),
            vocab_path: "chars.txt".to_string(),
            max_length: 100,
            epoch: 20,
            batch_size: 16,
            optimizer: "adam".to_string(),
            learning_rate: 2e-5,
            use_crf: false,
            class_num: 9,
            bert_path: "pretrain_models/bert-base-chinese".to_string(),
        }
    }
}

impl NerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Labeling strategy. The CRF layer is a first-class variant: when requested
/// it is always constructed, there is no half-enabled state.
pub enum Decoding {
    Plain,
    Crf(Crf),
}

/// Inference result, tagged by the decoding strategy that produced it.
pub enum NerOutput {
    /// Per-token class logits, `(batch, seq_len, class_num)`.
    Logits(Tensor),
    /// Viterbi-decoded tag paths, one per sequence.
    Paths(Vec<Vec<usize>>),
}

/// Pretrained BERT encoder plus a linear tag projection.
pub struct NerTagger {
    encoder: BertModel,
    classify: Linear,
    decoding: Decoding,
}

impl NerTagger {
    /// Reads `config.json` and `model.safetensors` from `cfg.bert_path`; a
    /// missing file is a fatal resource-load error. The classifier head (and
    /// the CRF parameters when enabled) come from the caller's trainable
    /// `head_vb`.
    pub fn load(cfg: &NerConfig, head_vb: VarBuilder, device: &Device) -> Result<Self> {
        let dir = Path::new(&cfg.bert_path);
        let raw = std::fs::read_to_string(dir.join("config.json"))?;
        let bert_cfg: BertConfig = serde_json::from_str(&raw).map_err(Error::wrap)?;
        let weights = dir.join("model.safetensors");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], BERT_DTYPE, device)? };
        let encoder = BertModel::load(vb, &bert_cfg)?;

        let classify = linear(bert_cfg.hidden_size, cfg.class_num, head_vb.pp("classify"))?;
        let decoding = if cfg.use_crf {
            Decoding::Crf(Crf::new(cfg.class_num, head_vb.pp("crf"))?)
        } else {
            Decoding::Plain
        };
        Ok(Self {
            encoder,
            classify,
            decoding,
        })
    }

    fn logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let sequence = self.encoder.forward(input_ids, &token_type_ids, None)?;
        self.classify.forward(&sequence)
    }

    /// Inference: per-token logits for plain decoding, Viterbi tag paths for
    /// CRF decoding.
    pub fn predict(&self, input_ids: &Tensor) -> Result<NerOutput> {
        let logits = self.logits(input_ids)?;
        match &self.decoding {
            Decoding::Plain => Ok(NerOutput::Logits(logits)),
            Decoding::Crf(crf) => Ok(NerOutput::Paths(crf.decode(&logits)?)),
        }
    }

    /// Training: scalar loss for a `(batch, seq_len)` i64 target where
    /// [`IGNORE_LABEL`] marks positions outside the loss.
    pub fn loss(&self, input_ids: &Tensor, target: &Tensor) -> Result<Tensor> {
        let logits = self.logits(input_ids)?;
        match &self.decoding {
            Decoding::Plain => {
                let (b, t, c) = logits.dims3()?;
                masked_cross_entropy(&logits.reshape((b * t, c))?, &target.reshape(b * t)?)
            }
            Decoding::Crf(crf) => {
                let mask = target.gt(IGNORE_LABEL)?;
                crf.neg_log_likelihood(&logits, target, &mask)
            }
        }
    }
}

/// Cross-entropy over `(n, class_num)` logits and `(n,)` i64 targets where
/// negative targets are excluded from both the sum and the count, so the loss
/// is invariant to whatever value an ignored position holds. All positions
/// ignored yields the scalar 0.
pub fn masked_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let logp = ops::log_softmax(logits, D::Minus1)?;
    let valid = target.ge(0i64)?;
    let validf = valid.to_dtype(DType::F32)?;
    let count = validf.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Tensor::zeros((), DType::F32, logits.device());
    }
    let safe = target
        .mul(&valid.to_dtype(DType::I64)?)?
        .to_dtype(DType::U32)?;
    let picked = logp.gather(&safe.unsqueeze(1)?, 1)?.squeeze(1)?;
    picked
        .mul(&validf)?
        .sum_all()?
        .neg()?
        .affine(1.0 / count as f64, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loss_of(logits: &[[f32; 3]; 4], target: &[i64; 4]) -> f32 {
        let dev = Device::Cpu;
        let logits = Tensor::new(logits, &dev).unwrap();
        let target = Tensor::new(target, &dev).unwrap();
        masked_cross_entropy(&logits, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn ignored_target_values_do_not_change_loss() {
        let logits = [
            [0.2f32, -1.0, 0.5],
            [1.5, 0.0, -0.3],
            [0.0, 0.0, 0.0],
            [-0.7, 2.0, 0.1],
        ];
        let a = loss_of(&logits, &[0, IGNORE_LABEL, 2, IGNORE_LABEL]);
        // nothing at an ignored position may leak into the loss
        let b = loss_of(
            &[logits[0], [9.9, 9.9, 9.9], logits[2], [5.0, 5.0, 5.0]],
            &[0, IGNORE_LABEL, 2, IGNORE_LABEL],
        );
        assert!((a - b).abs() < 1e-6);
        // and dropping the ignored positions entirely gives the same mean
        let dev = Device::Cpu;
        let kept = Tensor::new(&[logits[0], logits[2]], &dev).unwrap();
        let kept_target = Tensor::new(&[0i64, 2], &dev).unwrap();
        let c = masked_cross_entropy(&kept, &kept_target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((a - c).abs() < 1e-6);
    }

    #[test]
    fn uniform_logits_give_log_class_count() {
        // two valid positions over three classes
        let loss = loss_of(
            &[[0f32, 0.0, 0.0]; 4],
            &[1, IGNORE_LABEL, 0, IGNORE_LABEL],
        );
        assert!((loss - 3f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn all_ignored_is_zero() {
        let loss = loss_of(
            &[[0.4f32, 0.1, -0.2]; 4],
            &[IGNORE_LABEL; 4],
        );
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn loss_matches_hand_computed_value() {
        // single valid position: loss == -log_softmax(logits)[target]
        let logits = [
            [1f32, 2.0, 3.0],
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
        ];
        let loss = loss_of(&logits, &[2, IGNORE_LABEL, IGNORE_LABEL, IGNORE_LABEL]);
        let z = (1f32.exp() + 2f32.exp() + 3f32.exp()).ln();
        let expected = z - 3.0;
        assert!((loss - expected).abs() < 1e-5);
    }
}
