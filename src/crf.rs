use candle_core::{bail, DType, IndexOp, Result, Tensor};
use candle_nn::{Init, VarBuilder};

const CRF_INIT: Init = Init::Uniform { lo: -0.1, up: 0.1 };

/// Linear-chain conditional random field over per-token emission scores.
///
/// Scores a tag sequence as `start[t0] + sum(emission[i][ti]) +
/// sum(transitions[ti-1][ti]) + end[tlast]`; training minimizes the negative
/// log-likelihood against the log partition, inference is a Viterbi max-path
/// search.
pub struct Crf {
    start: Tensor,
    end: Tensor,
    transitions: Tensor,
    num_tags: usize,
}

impl Crf {
    pub fn new(num_tags: usize, vb: VarBuilder) -> Result<Self> {
        let start = vb.get_with_hints(num_tags, "start_transitions", CRF_INIT)?;
        let end = vb.get_with_hints(num_tags, "end_transitions", CRF_INIT)?;
        let transitions = vb.get_with_hints((num_tags, num_tags), "transitions", CRF_INIT)?;
        Ok(Self {
            start,
            end,
            transitions,
            num_tags,
        })
    }

    /// Mean negative log-likelihood of the gold tag sequences.
    ///
    /// `emissions` is `(batch, seq_len, num_tags)` f32, `tags` is
    /// `(batch, seq_len)` i64, `mask` is `(batch, seq_len)` u8. Every sequence
    /// must be unmasked at position 0; a mask that starts off is an error, not
    /// a silently wrong likelihood. Tag values at masked-off positions are
    /// ignored entirely.
    pub fn neg_log_likelihood(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = emissions.dims3()?;
        let device = emissions.device();
        let maskf = mask.to_dtype(DType::F32)?;
        let first_on = maskf.i((.., 0))?.sum_all()?.to_scalar::<f32>()?;
        if first_on < batch as f32 {
            bail!("crf mask must be on at position 0 for every sequence");
        }
        // masked-off tags may hold sentinel values, zero them before indexing
        let safe_tags = tags.mul(&mask.to_dtype(DType::I64)?)?;
        let idx = safe_tags.to_dtype(DType::U32)?;

        // gold path score; gather needs contiguous operands, column slices of
        // a batch are strided
        let tags0 = idx.i((.., 0))?.contiguous()?;
        let mut score = self.start.index_select(&tags0, 0)?;
        let emit0 = emissions
            .i((.., 0))?
            .contiguous()?
            .gather(&tags0.unsqueeze(1)?, 1)?
            .squeeze(1)?;
        score = score.add(&emit0)?;
        let stride = Tensor::new(self.num_tags as i64, device)?;
        for t in 1..seq_len {
            let cur = idx.i((.., t))?.contiguous()?;
            let prev = safe_tags.i((.., t - 1))?;
            let m = maskf.i((.., t))?;
            let emit = emissions
                .i((.., t))?
                .contiguous()?
                .gather(&cur.unsqueeze(1)?, 1)?
                .squeeze(1)?;
            let flat = prev
                .broadcast_mul(&stride)?
                .broadcast_add(&safe_tags.i((.., t))?)?
                .to_dtype(DType::U32)?;
            let trans = self.transitions.flatten_all()?.index_select(&flat, 0)?;
            score = score.add(&emit.add(&trans)?.mul(&m)?)?;
        }
        // tag at the last unmasked position of each sequence
        let lengths = maskf.sum(1)?.to_vec1::<f32>()?;
        let tag_rows = idx.to_vec2::<u32>()?;
        let last: Vec<u32> = tag_rows
            .iter()
            .zip(lengths.iter())
            .map(|(row, len)| row[(*len as usize).max(1) - 1])
            .collect();
        let last = Tensor::from_vec(last, batch, device)?;
        score = score.add(&self.end.index_select(&last, 0)?)?;

        // log partition by the forward algorithm
        let mut alpha = self
            .start
            .unsqueeze(0)?
            .broadcast_add(&emissions.i((.., 0))?)?;
        for t in 1..seq_len {
            let emit = emissions.i((.., t))?.unsqueeze(1)?;
            let scores = alpha
                .unsqueeze(2)?
                .broadcast_add(&self.transitions.unsqueeze(0)?)?
                .broadcast_add(&emit)?;
            let next = log_sum_exp(&scores, 1)?;
            let m = mask.i((.., t))?.unsqueeze(1)?.broadcast_as(next.shape())?;
            alpha = m.where_cond(&next, &alpha)?;
        }
        alpha = alpha.broadcast_add(&self.end.unsqueeze(0)?)?;
        let log_z = log_sum_exp(&alpha, 1)?;

        log_z.sub(&score)?.mean_all()
    }

    /// Viterbi decode: the highest-scoring tag path per sequence. Runs on the
    /// host, no gradients involved.
    pub fn decode(&self, emissions: &Tensor) -> Result<Vec<Vec<usize>>> {
        let em = emissions.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let start = self.start.to_vec1::<f32>()?;
        let end = self.end.to_vec1::<f32>()?;
        let trans = self.transitions.to_vec2::<f32>()?;

        let mut paths = Vec::with_capacity(em.len());
        for seq in em.iter() {
            if seq.is_empty() {
                paths.push(Vec::new());
                continue;
            }
            let mut score: Vec<f32> = seq[0]
                .iter()
                .zip(start.iter())
                .map(|(e, s)| e + s)
                .collect();
            let mut back: Vec<Vec<usize>> = Vec::with_capacity(seq.len() - 1);
            for frame in &seq[1..] {
                let mut next = vec![f32::NEG_INFINITY; self.num_tags];
                let mut ptr = vec![0usize; self.num_tags];
                for cur in 0..self.num_tags {
                    for prev in 0..self.num_tags {
                        let s = score[prev] + trans[prev][cur] + frame[cur];
                        if s > next[cur] {
                            next[cur] = s;
                            ptr[cur] = prev;
                        }
                    }
                }
                score = next;
                back.push(ptr);
            }
            for (s, e) in score.iter_mut().zip(end.iter()) {
                *s += e;
            }
            let mut best = 0usize;
            for (i, s) in score.iter().enumerate() {
                if *s > score[best] {
                    best = i;
                }
            }
            let mut tag = best;
            let mut path = vec![tag];
            for ptr in back.iter().rev() {
                tag = ptr[tag];
                path.push(tag);
            }
            path.reverse();
            paths.push(path);
        }
        Ok(paths)
    }
}

// stable log(sum(exp(t))) reduced over `dim`
fn log_sum_exp(t: &Tensor, dim: usize) -> Result<Tensor> {
    let max = t.max_keepdim(dim)?;
    let sum = t.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    sum.add(&max)?.squeeze(dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn crf(num_tags: usize) -> Crf {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Crf::new(num_tags, vb).unwrap()
    }

    fn ones_mask(batch: usize, seq_len: usize) -> Tensor {
        Tensor::ones((batch, seq_len), DType::U8, &Device::Cpu).unwrap()
    }

    #[test]
    fn single_tag_class_has_zero_nll() {
        // with one tag there is exactly one path, so score == log partition
        let crf = crf(1);
        let emissions = Tensor::new(&[[[0.3f32], [-1.2], [2.0], [0.7]]], &Device::Cpu).unwrap();
        let tags = Tensor::zeros((1, 4), DType::I64, &Device::Cpu).unwrap();
        let nll = crf
            .neg_log_likelihood(&emissions, &tags, &ones_mask(1, 4))
            .unwrap();
        assert!(nll.to_scalar::<f32>().unwrap().abs() < 1e-5);
    }

    #[test]
    fn nll_is_nonnegative() {
        let crf = crf(3);
        let emissions = Tensor::new(
            &[
                [[0.5f32, -0.2, 1.1], [2.0, 0.3, -0.7], [0.1, 0.1, 0.4]],
                [[-1.0f32, 0.8, 0.2], [0.0, -0.5, 1.5], [0.9, 0.2, -0.3]],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let tags = Tensor::new(&[[2i64, 0, 2], [1, 2, 0]], &Device::Cpu).unwrap();
        let nll = crf
            .neg_log_likelihood(&emissions, &tags, &ones_mask(2, 3))
            .unwrap();
        assert!(nll.to_scalar::<f32>().unwrap() >= -1e-5);
    }

    #[test]
    fn batched_sequences_score_independently() {
        // the chain factorizes per sequence, so the batch nll must equal the
        // mean of the single-sequence nlls
        let crf = crf(3);
        let seq_a = [[0.5f32, -0.2, 1.1], [2.0, 0.3, -0.7], [0.1, 0.1, 0.4]];
        let seq_b = [[-1.0f32, 0.8, 0.2], [0.0, -0.5, 1.5], [0.9, 0.2, -0.3]];
        let tags_a = [2i64, 0, 2];
        let tags_b = [1i64, 2, 0];
        let dev = Device::Cpu;

        let both = crf
            .neg_log_likelihood(
                &Tensor::new(&[seq_a, seq_b], &dev).unwrap(),
                &Tensor::new(&[tags_a, tags_b], &dev).unwrap(),
                &ones_mask(2, 3),
            )
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let first = crf
            .neg_log_likelihood(
                &Tensor::new(&[seq_a], &dev).unwrap(),
                &Tensor::new(&[tags_a], &dev).unwrap(),
                &ones_mask(1, 3),
            )
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let second = crf
            .neg_log_likelihood(
                &Tensor::new(&[seq_b], &dev).unwrap(),
                &Tensor::new(&[tags_b], &dev).unwrap(),
                &ones_mask(1, 3),
            )
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((both - (first + second) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn mask_off_at_first_position_is_an_error() {
        let crf = crf(3);
        let emissions = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let tags = Tensor::new(&[[-1i64, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0u8, 1]], &Device::Cpu).unwrap();
        assert!(crf.neg_log_likelihood(&emissions, &tags, &mask).is_err());
    }

    #[test]
    fn masked_tail_tags_do_not_change_nll() {
        let crf = crf(3);
        let emissions = Tensor::new(
            &[[[0.5f32, -0.2, 1.1], [2.0, 0.3, -0.7], [0.1, 0.1, 0.4]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0]], &Device::Cpu).unwrap();
        let tags_a = Tensor::new(&[[2i64, 0, -1]], &Device::Cpu).unwrap();
        let tags_b = Tensor::new(&[[2i64, 0, 1]], &Device::Cpu).unwrap();
        let a = crf
            .neg_log_likelihood(&emissions, &tags_a, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let b = crf
            .neg_log_likelihood(&emissions, &tags_b, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn decode_follows_dominant_emissions() {
        // emission scores large enough to drown the uniform(-0.1, 0.1) params
        let crf = crf(3);
        let emissions = Tensor::new(
            &[[
                [100f32, 0.0, 0.0],
                [0.0, 0.0, 100.0],
                [0.0, 100.0, 0.0],
                [100.0, 0.0, 0.0],
            ]],
            &Device::Cpu,
        )
        .unwrap();
        let paths = crf.decode(&emissions).unwrap();
        assert_eq!(paths, vec![vec![0, 2, 1, 0]]);
    }

    #[test]
    fn decode_path_lengths_match_sequences() {
        let crf = crf(4);
        let emissions = Tensor::zeros((3, 7, 4), DType::F32, &Device::Cpu).unwrap();
        let paths = crf.decode(&emissions).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.len() == 7));
    }
}
