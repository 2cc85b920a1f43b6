//! Vectorized reductions and element-wise helpers for the fused kernels

use wide::f32x8;

use crate::SIMD_CAPABILITY;

const LANES: usize = 8;

#[inline]
fn load(chunk: &[f32]) -> f32x8 {
    let mut lanes = [0.0f32; LANES];
    lanes.copy_from_slice(chunk);
    f32x8::from(lanes)
}

#[inline]
fn horizontal_sum(v: f32x8) -> f32 {
    v.to_array().iter().sum()
}

/// Sum of squares of `x`
#[inline]
pub fn sum_squares(x: &[f32]) -> f32 {
    if !SIMD_CAPABILITY.is_vectorized() {
        return x.iter().map(|v| v * v).sum();
    }

    let mut chunks = x.chunks_exact(LANES);
    let mut acc = f32x8::splat(0.0);
    for chunk in &mut chunks {
        let v = load(chunk);
        acc = acc + v * v;
    }
    horizontal_sum(acc) + chunks.remainder().iter().map(|v| v * v).sum::<f32>()
}

/// Dot product of `a` and `b`
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());

    if !SIMD_CAPABILITY.is_vectorized() {
        return a.iter().zip(b).map(|(x, y)| x * y).sum();
    }

    let mut a_chunks = a.chunks_exact(LANES);
    let mut b_chunks = b.chunks_exact(LANES);
    let mut acc = f32x8::splat(0.0);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        acc = acc + load(ca) * load(cb);
    }
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(x, y)| x * y)
        .sum();
    horizontal_sum(acc) + tail
}

/// `out[i] = x[i] * scale * w[i]`
#[inline]
pub fn scale_mul(x: &[f32], scale: f32, w: &[f32], out: &mut [f32]) {
    assert_eq!(x.len(), w.len());
    assert_eq!(x.len(), out.len());

    if !SIMD_CAPABILITY.is_vectorized() {
        for ((o, xv), wv) in out.iter_mut().zip(x).zip(w) {
            *o = xv * scale * wv;
        }
        return;
    }

    let s = f32x8::splat(scale);
    let mut x_chunks = x.chunks_exact(LANES);
    let mut w_chunks = w.chunks_exact(LANES);
    let mut o_chunks = out.chunks_exact_mut(LANES);
    for ((cx, cw), co) in (&mut x_chunks).zip(&mut w_chunks).zip(&mut o_chunks) {
        let r = load(cx) * s * load(cw);
        co.copy_from_slice(&r.to_array());
    }
    for ((o, xv), wv) in o_chunks
        .into_remainder()
        .iter_mut()
        .zip(x_chunks.remainder())
        .zip(w_chunks.remainder())
    {
        *o = xv * scale * wv;
    }
}
