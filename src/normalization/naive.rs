use candle_core::{DType, Tensor, D};

use super::{
    compute_dtype, flatten_grad, flatten_rows, KernelBackend, RmsNormGrads, RmsNormKernel,
    RmsNormSaved,
};
use crate::error::Result;

/// RMSNorm built from candle tensor ops.
///
/// Has no feature-dimension limit and runs on any candle device.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveRmsNorm;

impl RmsNormKernel for NaiveRmsNorm {
    fn backend(&self) -> KernelBackend {
        KernelBackend::Naive
    }

    fn forward(&self, x: &Tensor, weight: &Tensor, eps: f64) -> Result<(Tensor, RmsNormSaved)> {
        let (x2d, _, _) = flatten_rows(x, weight)?;
        let compute = compute_dtype(x.dtype());

        let xf = x2d.to_dtype(compute)?;
        let variance = xf.sqr()?.mean_keepdim(D::Minus1)?;
        let rstd = variance.affine(1.0, eps)?.sqrt()?.recip()?;
        let y = xf
            .broadcast_mul(&rstd)?
            .broadcast_mul(&weight.to_dtype(compute)?)?
            .to_dtype(x.dtype())?
            .reshape(x.shape())?;

        let saved = RmsNormSaved {
            input: x2d,
            rstd: rstd.squeeze(1)?.to_dtype(DType::F32)?,
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
        let (_, features) = saved.input.dims2()?;
        let compute = compute_dtype(saved.input.dtype());

        let x = saved.input.to_dtype(compute)?;
        let dy = dy2d.to_dtype(compute)?;
        let rstd = saved.rstd.to_dtype(compute)?.unsqueeze(1)?;

        let x_hat = x.broadcast_mul(&rstd)?;
        let wdy = dy.broadcast_mul(&weight.to_dtype(compute)?)?;

        let grad_weight = (&dy * &x_hat)?.sum(0)?.to_dtype(weight.dtype())?;

        let c1 = (&x_hat * &wdy)?
            .sum_keepdim(1)?
            .affine(1.0 / features as f64, 0.0)?;
        let grad_input = (wdy - x_hat.broadcast_mul(&c1)?)?
            .broadcast_mul(&rstd)?
            .to_dtype(saved.input.dtype())?
            .reshape(&saved.input_shape)?;

        Ok(RmsNormGrads {
            grad_input,
            grad_weight,
        })
    }
}
