use anyhow::Error as E;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::api::sync::Api;
use nn_exercises::ner::{NerConfig, NerOutput, NerTagger};
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Use the local `bert_path` directory when the weights are already there,
/// otherwise fetch config, weights and tokenizer from the hub and point the
/// config at the cache. Returns the tokenizer file path.
fn resolve_bert(cfg: &mut NerConfig) -> anyhow::Result<PathBuf> {
    let local = PathBuf::from(&cfg.bert_path);
    if local.join("model.safetensors").exists() {
        return Ok(local.join("tokenizer.json"));
    }
    let api = Api::new()?;
    let repo = api.model("bert-base-chinese".to_string());
    let config = repo.get("config.json")?;
    repo.get("model.safetensors")?;
    let tokenizer = repo.get("tokenizer.json")?;
    cfg.bert_path = config
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(tokenizer)
}

fn main() -> anyhow::Result<()> {
    let mut cfg = match std::env::args().nth(1) {
        Some(path) => NerConfig::from_file(path)?,
        None => NerConfig::default(),
    };
    let device = Device::cuda_if_available(0)?;
    let tokenizer_path = resolve_bert(&mut cfg)?;
    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(E::msg)?;

    let varmap = VarMap::new();
    let head_vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let tagger = NerTagger::load(&cfg, head_vb, &device)?;

    let sentence = "中国政府今天在北京召开新闻发布会";
    let encoding = tokenizer.encode(sentence, true).map_err(E::msg)?;
    let ids = encoding.get_ids().to_vec();
    let tokens = encoding.get_tokens().to_vec();
    let input = Tensor::from_vec(ids.clone(), (1, ids.len()), &device)?;

    match tagger.predict(&input)? {
        NerOutput::Logits(logits) => {
            let tags = logits.argmax(D::Minus1)?.squeeze(0)?.to_vec1::<u32>()?;
            for (token, tag) in tokens.iter().zip(tags.iter()) {
                println!("{token}\t{tag}");
            }
        }
        NerOutput::Paths(paths) => {
            if let Some(path) = paths.first() {
                for (token, tag) in tokens.iter().zip(path.iter()) {
                    println!("{token}\t{tag}");
                }
            }
        }
    }
    Ok(())
}
