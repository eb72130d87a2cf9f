use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use nn_exercises::similarity::{SiameseNetwork, SimilarityConfig};

fn main() -> anyhow::Result<()> {
    let cfg = SimilarityConfig {
        vocab_size: 10,
        max_length: 4,
        hidden_size: 64,
        ..Default::default()
    };
    let device = Device::cuda_if_available(0)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SiameseNetwork::new(&cfg, vb)?;

    let anchor = Tensor::new(&[[1u32, 2, 3, 0], [2, 2, 0, 0]], &device)?;
    let positive = Tensor::new(&[[1u32, 2, 3, 4], [3, 2, 3, 4]], &device)?;
    let negative = Tensor::new(&[[4u32, 3, 2, 1], [1, 1, 4, 2]], &device)?;

    let loss = model.loss(&anchor, &positive, &negative, None)?;
    println!("triplet loss: {}", loss.to_scalar::<f32>()?);

    let encoded = model.encode(&anchor)?;
    println!("encoded shape: {:?}", encoded.dims());
    Ok(())
}
