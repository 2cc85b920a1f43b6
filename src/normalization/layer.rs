use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::{rms_norm_backward, rms_norm_forward, RmsNormGrads, RmsNormSaved};
use crate::error::{Error, Result};

/// RMSNorm layer with a learned per-feature scale
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Create a layer from an existing weight
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Load `weight` of length `size` from a var builder, initialized to ones
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self::new(weight, eps))
    }

    /// Learned scale
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Epsilon added to the mean square
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Forward pass that keeps the state needed by [`RmsNorm::backward`]
    pub fn forward_train(&self, x: &Tensor) -> Result<(Tensor, RmsNormSaved)> {
        rms_norm_forward(x, &self.weight, self.eps)
    }

    /// Gradients for a previous [`RmsNorm::forward_train`] call
    pub fn backward(&self, grad_output: &Tensor, saved: RmsNormSaved) -> Result<RmsNormGrads> {
        rms_norm_backward(grad_output, &self.weight, saved)
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match rms_norm_forward(xs, &self.weight, self.eps) {
            Ok((y, _)) => Ok(y),
            Err(Error::Tensor(e)) => Err(e),
            Err(other) => Err(candle_core::Error::Msg(other.to_string())),
        }
    }
}
