//! Root-mean-square normalization with a custom backward pass
//!
//! Two kernels implement [`RmsNormKernel`]: the fused row-parallel kernel
//! from `dolomite-simd` (behind the `fused` feature) and a naive kernel built
//! from candle tensor ops. The process picks one the first time it is needed
//! and keeps it for the rest of the run; setting
//! `DOLOMITE_DISABLE_FUSED_KERNELS` before that forces the naive kernel.
//!
//! Forward returns the output together with an [`RmsNormSaved`] value holding
//! the per-row reciprocal standard deviation. The caller passes that value,
//! by move, to the matching backward call.

#[cfg(feature = "fused")]
mod fused;
mod layer;
mod naive;

#[cfg(feature = "fused")]
pub use fused::FusedRmsNorm;
pub use layer::RmsNorm;
pub use naive::NaiveRmsNorm;

use candle_core::{DType, Shape, Tensor};
use once_cell::sync::Lazy;
use tracing::info;

use crate::error::{Error, Result};

/// Environment variable that forces the naive kernel
pub const DISABLE_FUSED_ENV: &str = "DOLOMITE_DISABLE_FUSED_KERNELS";

/// Kernel implementation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelBackend {
    /// Row-parallel fused kernel
    Fused,
    /// Tensor-op fallback
    Naive,
}

impl KernelBackend {
    /// Detect the best backend for this process
    pub fn detect() -> Self {
        if std::env::var_os(DISABLE_FUSED_ENV).is_some() {
            return KernelBackend::Naive;
        }
        if cfg!(feature = "fused") {
            KernelBackend::Fused
        } else {
            KernelBackend::Naive
        }
    }

    /// The kernel implementing this backend
    pub fn kernel(self) -> &'static dyn RmsNormKernel {
        match self {
            #[cfg(feature = "fused")]
            KernelBackend::Fused => &FusedRmsNorm,
            _ => &NaiveRmsNorm,
        }
    }
}

static ACTIVE_BACKEND: Lazy<KernelBackend> = Lazy::new(|| {
    let backend = KernelBackend::detect();
    info!(?backend, "selected RMSNorm kernel");
    backend
});

/// Backend chosen for this process
pub fn active_backend() -> KernelBackend {
    *ACTIVE_BACKEND
}

/// Kernel chosen for this process
pub fn kernel() -> &'static dyn RmsNormKernel {
    active_backend().kernel()
}

/// State saved by forward for the paired backward call
#[derive(Debug)]
pub struct RmsNormSaved {
    /// Input flattened to `[rows, features]`, original dtype
    input: Tensor,
    /// Reciprocal standard deviation per row, f32 `[rows]`
    rstd: Tensor,
    /// Shape of the caller's input
    input_shape: Shape,
}

impl RmsNormSaved {
    /// Reciprocal standard deviation per row
    pub fn rstd(&self) -> &Tensor {
        &self.rstd
    }

    /// Shape of the input that produced this state
    pub fn input_shape(&self) -> &Shape {
        &self.input_shape
    }
}

/// Gradients produced by backward
#[derive(Debug)]
pub struct RmsNormGrads {
    /// Gradient with respect to the input, shaped and typed like the input
    pub grad_input: Tensor,
    /// Gradient with respect to the weight, typed like the weight
    pub grad_weight: Tensor,
}

/// Forward/backward contract shared by all RMSNorm kernels
pub trait RmsNormKernel: Send + Sync + std::fmt::Debug {
    /// Backend this kernel implements
    fn backend(&self) -> KernelBackend;

    /// Normalize `x` over its last axis and scale by `weight`
    fn forward(&self, x: &Tensor, weight: &Tensor, eps: f64) -> Result<(Tensor, RmsNormSaved)>;

    /// Gradients for the forward call that produced `saved`
    fn backward(
        &self,
        grad_output: &Tensor,
        weight: &Tensor,
        saved: RmsNormSaved,
    ) -> Result<RmsNormGrads>;
}

/// Forward with the process-wide kernel
pub fn rms_norm_forward(x: &Tensor, weight: &Tensor, eps: f64) -> Result<(Tensor, RmsNormSaved)> {
    kernel().forward(x, weight, eps)
}

/// Backward with the process-wide kernel
pub fn rms_norm_backward(
    grad_output: &Tensor,
    weight: &Tensor,
    saved: RmsNormSaved,
) -> Result<RmsNormGrads> {
    kernel().backward(grad_output, weight, saved)
}

/// Accumulation dtype: never below f32
fn compute_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

/// Flatten `x` to `[rows, features]` and check `weight` against it
fn flatten_rows(x: &Tensor, weight: &Tensor) -> Result<(Tensor, usize, usize)> {
    let features = match x.dims().last() {
        Some(&features) if features > 0 => features,
        _ => {
            return Err(Error::config(format!(
                "RMSNorm input must have a non-empty last axis, got {:?}",
                x.dims()
            )))
        }
    };
    if weight.dims() != [features] {
        return Err(Error::shape_mismatch("weight", &[features], weight.dims()));
    }
    let rows = x.elem_count() / features;
    Ok((x.reshape((rows, features))?, rows, features))
}

/// Flatten an output gradient to the saved input's `[rows, features]`
fn flatten_grad(grad_output: &Tensor, saved: &RmsNormSaved) -> Result<Tensor> {
    if grad_output.shape() != &saved.input_shape {
        return Err(Error::shape_mismatch(
            "grad_output",
            saved.input_shape.dims(),
            grad_output.dims(),
        ));
    }
    Ok(grad_output.reshape(saved.input.shape())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_backend_is_stable_across_calls() {
        assert_eq!(active_backend(), active_backend());
        assert_eq!(kernel().backend(), active_backend());
    }

    #[test]
    fn test_weight_shape_is_checked() {
        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let w = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        let err = NaiveRmsNorm.forward(&x, &w, 1e-5).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref name, .. } if name == "weight"));
    }

    #[test]
    fn test_grad_shape_is_checked() {
        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let w = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let (_, saved) = NaiveRmsNorm.forward(&x, &w, 1e-5).unwrap();
        let dy = Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap();
        let err = NaiveRmsNorm.backward(&dy, &w, saved).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { ref name, .. } if name == "grad_output"));
    }
}
