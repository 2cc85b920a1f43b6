//! Fused root-mean-square normalization
//!
//! Forward runs one task per row. Backward splits the rows into a fixed
//! number of contiguous shards; each shard writes its rows of the input
//! gradient and accumulates a private partial weight gradient, and the
//! partials are summed at the end.

use rayon::prelude::*;

use crate::{block_size, ops, KernelError, KernelResult};

fn check_len(buffer: &'static str, actual: usize, expected: usize) -> KernelResult<()> {
    if actual != expected {
        return Err(KernelError::LengthMismatch {
            buffer,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Launch geometry shared by forward and backward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    /// Number of rows
    pub rows: usize,
    /// Features per row
    pub cols: usize,
    /// Size in bytes of one element of the caller's original dtype
    pub element_size: usize,
}

impl RowLayout {
    /// Validate the layout against the block limit and return the block size
    pub fn block_size(&self) -> KernelResult<usize> {
        block_size(self.cols, self.element_size)
    }

    fn elements(&self) -> usize {
        self.rows * self.cols
    }
}

/// Forward pass: `y = x * rstd * w` with `rstd = 1 / sqrt(mean(x^2) + eps)`.
///
/// Writes the output into `y` and the per-row reciprocal standard deviation
/// into `rstd`.
pub fn rms_norm_fwd(
    x: &[f32],
    w: &[f32],
    eps: f32,
    layout: RowLayout,
    y: &mut [f32],
    rstd: &mut [f32],
) -> KernelResult<()> {
    layout.block_size()?;
    check_len("x", x.len(), layout.elements())?;
    check_len("y", y.len(), layout.elements())?;
    check_len("weight", w.len(), layout.cols)?;
    check_len("rstd", rstd.len(), layout.rows)?;

    let cols = layout.cols;
    y.par_chunks_mut(cols)
        .zip(rstd.par_iter_mut())
        .enumerate()
        .for_each(|(row, (y_row, r))| {
            let x_row = &x[row * cols..(row + 1) * cols];
            let var = ops::sum_squares(x_row) / cols as f32;
            *r = 1.0 / (var + eps).sqrt();
            ops::scale_mul(x_row, *r, w, y_row);
        });

    Ok(())
}

/// Backward pass.
///
/// Returns the weight gradient (in f32) and writes the input gradient into
/// `dx`. `num_shards` bounds the number of partial weight-gradient buffers.
#[allow(clippy::too_many_arguments)]
pub fn rms_norm_bwd(
    x: &[f32],
    w: &[f32],
    dy: &[f32],
    rstd: &[f32],
    layout: RowLayout,
    num_shards: usize,
    dx: &mut [f32],
) -> KernelResult<Vec<f32>> {
    layout.block_size()?;
    check_len("x", x.len(), layout.elements())?;
    check_len("grad_output", dy.len(), layout.elements())?;
    check_len("grad_input", dx.len(), layout.elements())?;
    check_len("weight", w.len(), layout.cols)?;
    check_len("rstd", rstd.len(), layout.rows)?;

    let cols = layout.cols;
    if layout.rows == 0 {
        return Ok(vec![0.0; cols]);
    }

    let num_shards = num_shards.clamp(1, layout.rows);
    let rows_per_shard = layout.rows.div_ceil(num_shards);

    let partials: Vec<Vec<f32>> = dx
        .par_chunks_mut(rows_per_shard * cols)
        .enumerate()
        .map(|(shard, dx_shard)| {
            let row_start = shard * rows_per_shard;
            let mut dw = vec![0.0f32; cols];
            let mut x_hat = vec![0.0f32; cols];
            let mut wdy = vec![0.0f32; cols];

            for (local, dx_row) in dx_shard.chunks_mut(cols).enumerate() {
                let row = row_start + local;
                let x_row = &x[row * cols..(row + 1) * cols];
                let dy_row = &dy[row * cols..(row + 1) * cols];
                let r = rstd[row];

                for i in 0..cols {
                    x_hat[i] = x_row[i] * r;
                    wdy[i] = w[i] * dy_row[i];
                    dw[i] += dy_row[i] * x_hat[i];
                }

                let c1 = ops::dot(&x_hat, &wdy) / cols as f32;
                for i in 0..cols {
                    dx_row[i] = (wdy[i] - x_hat[i] * c1) * r;
                }
            }

            dw
        })
        .collect();

    let mut dw = vec![0.0f32; cols];
    for partial in &partials {
        for (acc, v) in dw.iter_mut().zip(partial) {
            *acc += v;
        }
    }
    Ok(dw)
}
