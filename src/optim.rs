use candle_core::{bail, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, SGD};

/// First-order update rule selected by name from the config.
///
/// Candle's `Optimizer` trait is not object safe, so the two supported rules
/// are wrapped in an enum instead of a boxed trait object.
pub enum TrainOptimizer {
    Adam(AdamW),
    Sgd(SGD),
}

// the wrapped candle optimizers do not derive Debug, print the variant name
impl std::fmt::Debug for TrainOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adam(_) => f.write_str("TrainOptimizer::Adam"),
            Self::Sgd(_) => f.write_str("TrainOptimizer::Sgd"),
        }
    }
}

impl TrainOptimizer {
    /// Backprop the loss, apply one update step and clear the gradients.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }
}

/// Build the optimizer named in the config over the given trainable vars.
///
/// An unrecognized name is a configuration error, not a silent no-op.
pub fn choose_optimizer(name: &str, learning_rate: f64, vars: Vec<Var>) -> Result<TrainOptimizer> {
    match name {
        "adam" => Ok(TrainOptimizer::Adam(AdamW::new_lr(vars, learning_rate)?)),
        "sgd" => Ok(TrainOptimizer::Sgd(SGD::new(vars, learning_rate)?)),
        other => bail!("unknown optimizer {other:?}, expected \"adam\" or \"sgd\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Shape, Var};

    fn some_vars() -> Vec<Var> {
        vec![Var::zeros(Shape::from((2, 2)), DType::F32, &Device::Cpu).unwrap()]
    }

    #[test]
    fn builds_adam_and_sgd() {
        let adam = choose_optimizer("adam", 1e-3, some_vars()).unwrap();
        assert!(matches!(adam, TrainOptimizer::Adam(_)));
        assert_eq!(adam.learning_rate(), 1e-3);

        let sgd = choose_optimizer("sgd", 0.1, some_vars()).unwrap();
        assert!(matches!(sgd, TrainOptimizer::Sgd(_)));
        assert_eq!(sgd.learning_rate(), 0.1);
    }

    #[test]
    fn rejects_unknown_name() {
        let err = choose_optimizer("adagrad", 1e-3, some_vars()).unwrap_err();
        assert!(err.to_string().contains("adagrad"));
    }
}
