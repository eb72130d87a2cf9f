use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{embedding, linear, lstm, Embedding, LSTMConfig, Linear, Module, VarBuilder, LSTM, RNN};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden_size: usize,
    pub optimizer: String,
    pub learning_rate: f64,
    pub margin: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4622,
            max_length: 20,
            hidden_size: 128,
            optimizer: "adam".to_string(),
            learning_rate: 1e-3,
            margin: 0.1,
        }
    }
}

/// Encodes a batch of padded token-id sequences into one fixed-length vector
/// per sequence.
///
/// Pipeline: embedding lookup -> bidirectional LSTM -> linear projection back
/// to `hidden_size` -> max over the time axis. Token id 0 is reserved for
/// padding and always maps to an all-zero embedding.
pub struct SentenceEncoder {
    embedding: Embedding,
    lstm_fwd: LSTM,
    lstm_bwd: LSTM,
    project: Linear,
}

impl SentenceEncoder {
    pub fn new(cfg: &SimilarityConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        // row 0 of the table belongs to the pad token
        let embedding = embedding(cfg.vocab_size + 1, hidden, vb.pp("embedding"))?;
        let lstm_fwd = lstm(hidden, hidden, LSTMConfig::default(), vb.pp("lstm_fwd"))?;
        let lstm_bwd = lstm(hidden, hidden, LSTMConfig::default(), vb.pp("lstm_bwd"))?;
        let project = linear(hidden * 2, hidden, vb.pp("project"))?;
        Ok(Self {
            embedding,
            lstm_fwd,
            lstm_bwd,
            project,
        })
    }

    /// Input shape `(batch, max_length)` of u32 token ids, output shape
    /// `(batch, hidden_size)`. The time reduction is an explicit `max` over
    /// dim 1, so a batch of size 1 keeps its batch dimension.
    pub fn forward(&self, sentences: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = sentences.dims2()?;
        let pad_mask = sentences.ne(0u32)?.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        // zero the pad rows so index 0 never carries a learned effect
        let x = self.embedding.forward(sentences)?.broadcast_mul(&pad_mask)?;

        let fwd_states = self.lstm_fwd.seq(&x)?;
        let fwd: Vec<Tensor> = fwd_states.iter().map(|s| s.h().clone()).collect();
        let fwd = Tensor::stack(&fwd, 1)?;

        // candle has no bidirectional LSTM wrapper, run the second pass over
        // reversed time steps
        let mut state = self.lstm_bwd.zero_state(batch)?;
        let mut bwd: Vec<Tensor> = Vec::with_capacity(seq_len);
        for t in (0..seq_len).rev() {
            state = self.lstm_bwd.step(&x.i((.., t))?, &state)?;
            bwd.push(state.h().clone());
        }
        bwd.reverse();
        let bwd = Tensor::stack(&bwd, 1)?;

        let x = Tensor::cat(&[&fwd, &bwd], D::Minus1)?;
        let x = self.project.forward(&x)?;
        x.max(1)
    }
}

/// `1 - cosine_similarity` along the last axis, in `[0, 2]`. 0 means the
/// vectors point the same way, 1 means orthogonal, 2 means opposite.
pub fn cosine_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a = l2_normalize(a)?;
    let b = l2_normalize(b)?;
    let cosine = a.mul(&b)?.sum(D::Minus1)?;
    cosine.affine(-1.0, 1.0)
}

fn l2_normalize(v: &Tensor) -> Result<Tensor> {
    let norm = v
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .clamp(1e-12, f64::INFINITY)?;
    v.broadcast_div(&norm)
}

/// Triplet margin loss over cosine distances.
///
/// `margin` is either a per-example tensor (any shape that flattens to
/// `(batch,)`) or the scalar default 0.1. Only triplets that still violate the
/// margin contribute to the mean; satisfied ones are excluded from both the
/// numerator and the denominator, which makes the gradient larger than a mean
/// over the whole batch would. A batch with no violations yields the scalar 0.
pub fn cosine_triplet_loss(
    anchor: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    margin: Option<&Tensor>,
) -> Result<Tensor> {
    let ap = cosine_distance(anchor, positive)?;
    let an = cosine_distance(anchor, negative)?;
    let diff = match margin {
        None => (ap.sub(&an)? + 0.1)?,
        Some(m) => ap.sub(&an)?.broadcast_add(&m.flatten_all()?)?,
    };
    let violating = diff.gt(0f64)?.to_dtype(DType::F32)?;
    let count = violating.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Tensor::zeros((), DType::F32, diff.device());
    }
    diff.mul(&violating)?.sum_all()?.affine(1.0 / count as f64, 0.0)
}

/// Siamese sentence-similarity model: one shared encoder, two explicit entry
/// points instead of a single dual-mode forward.
pub struct SiameseNetwork {
    encoder: SentenceEncoder,
}

impl SiameseNetwork {
    pub fn new(cfg: &SimilarityConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: SentenceEncoder::new(cfg, vb.pp("sentence_encoder"))?,
        })
    }

    /// Inference mode: encode a batch of sentences.
    pub fn encode(&self, sentences: &Tensor) -> Result<Tensor> {
        self.encoder.forward(sentences)
    }

    /// Training mode: encode anchor/positive/negative and return the triplet
    /// loss scalar.
    pub fn loss(
        &self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
        margin: Option<&Tensor>,
    ) -> Result<Tensor> {
        let a = self.encoder.forward(anchor)?;
        let p = self.encoder.forward(positive)?;
        let n = self.encoder.forward(negative)?;
        cosine_triplet_loss(&a, &p, &n, margin)
    }
}
