use candle_core::{DType, Tensor};
use dolomite_simd::rmsnorm::{rms_norm_bwd, rms_norm_fwd, RowLayout};
use tracing::trace;

use super::{
    flatten_grad, flatten_rows, KernelBackend, RmsNormGrads, RmsNormKernel, RmsNormSaved,
};
use crate::error::Result;

/// RMSNorm running the row-parallel kernels from `dolomite-simd`.
///
/// Rows wider than one 64 KiB block fail with
/// [`Error::FeatureDimensionTooLarge`](crate::Error::FeatureDimensionTooLarge);
/// use [`NaiveRmsNorm`](super::NaiveRmsNorm) for those.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusedRmsNorm;

fn to_f32_vec(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

impl RmsNormKernel for FusedRmsNorm {
    fn backend(&self) -> KernelBackend {
        KernelBackend::Fused
    }

    fn forward(&self, x: &Tensor, weight: &Tensor, eps: f64) -> Result<(Tensor, RmsNormSaved)> {
        let (x2d, rows, cols) = flatten_rows(x, weight)?;
        let layout = RowLayout {
            rows,
            cols,
            element_size: x.dtype().size_in_bytes(),
        };
        let block = layout.block_size()?;
        trace!(rows, cols, block, "fused rmsnorm forward");

        let xs = to_f32_vec(&x2d)?;
        let ws = to_f32_vec(weight)?;
        let mut y = vec![0.0f32; rows * cols];
        let mut rstd = vec![0.0f32; rows];
        rms_norm_fwd(&xs, &ws, eps as f32, layout, &mut y, &mut rstd)?;

        let device = x.device();
        let y = Tensor::from_vec(y, (rows, cols), device)?
            .to_dtype(x.dtype())?
            .reshape(x.shape())?;
        let saved = RmsNormSaved {
            input: x2d,
            rstd: Tensor::from_vec(rstd, rows, device)?,
            input_shape: x.shape().clone(),
        };
        Ok((y, saved))
    }

    fn backward(
        &self,
        grad_output: &Tensor,
        weight: &Tensor,
        saved: RmsNormSaved,
    ) -> Result<RmsNormGrads> {
        let dy2d = flatten_grad(grad_output, &saved)?;
        let (rows, cols) = saved.input.dims2()?;
        let layout = RowLayout {
            rows,
            cols,
            element_size: saved.input.dtype().size_in_bytes(),
        };
        let num_shards = rayon::current_num_threads();
        trace!(rows, cols, num_shards, "fused rmsnorm backward");

        let xs = to_f32_vec(&saved.input)?;
        let dys = to_f32_vec(&dy2d)?;
        let ws = to_f32_vec(weight)?;
        let rstd = saved.rstd.to_vec1::<f32>()?;
        let mut dx = vec![0.0f32; rows * cols];
        let dw = rms_norm_bwd(&xs, &ws, &dys, &rstd, layout, num_shards, &mut dx)?;

        let device = saved.input.device();
        let grad_input = Tensor::from_vec(dx, (rows, cols), device)?
            .to_dtype(saved.input.dtype())?
            .reshape(&saved.input_shape)?;
        let grad_weight = Tensor::from_vec(dw, cols, weight.device())?.to_dtype(weight.dtype())?;

        Ok(RmsNormGrads {
            grad_input,
            grad_weight,
        })
    }
}
