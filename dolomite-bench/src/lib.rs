//! Dolomite benchmarking suite
//!
//! Benchmarks for the RMSNorm kernels (raw SIMD kernels, and fused against
//! naive through the tensor API) and for the fused-projection layout
//! transforms used during checkpoint conversion.

#![warn(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput};
use std::time::Duration;

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Rows (tokens) per normalization call
    pub row_counts: Vec<usize>,
    /// Feature dimensions to normalize
    pub feature_dims: Vec<usize>,
    /// `(num_heads, num_key_value_heads, head_dim)` layouts for QKV transforms
    pub head_layouts: Vec<(usize, usize, usize)>,
    /// Measurement time per benchmark
    pub measurement_time: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            row_counts: vec![1, 64, 512],
            feature_dims: vec![768, 2048, 4096, 8192],
            head_layouts: vec![(16, 16, 64), (16, 1, 128), (32, 8, 128)],
            measurement_time: Duration::from_secs(5),
        }
    }
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i % 97) as f32 - 48.0) / 48.0).collect()
}

/// Raw slice kernels from `dolomite-simd`
pub mod kernel_benchmarks {
    use super::*;
    use dolomite_simd::ops::sum_squares;
    use dolomite_simd::rmsnorm::{rms_norm_bwd, rms_norm_fwd, RowLayout};

    /// Benchmark the vectorized sum of squares
    pub fn bench_sum_squares(c: &mut Criterion, config: &BenchConfig) {
        let mut group = c.benchmark_group("simd_sum_squares");

        for &size in &config.feature_dims {
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(BenchmarkId::new("size", size), &size, |b, &size| {
                let x = ramp(size);
                b.iter(|| std::hint::black_box(sum_squares(std::hint::black_box(&x))));
            });
        }

        group.finish();
    }

    /// Benchmark the row-parallel forward kernel
    pub fn bench_forward(c: &mut Criterion, config: &BenchConfig) {
        let mut group = c.benchmark_group("rmsnorm_kernel_forward");

        for &rows in &config.row_counts {
            for &cols in &config.feature_dims {
                let layout = RowLayout {
                    rows,
                    cols,
                    element_size: 4,
                };
                group.throughput(Throughput::Elements((rows * cols) as u64));
                group.bench_with_input(
                    BenchmarkId::new("rows_x_cols", format!("{rows}x{cols}")),
                    &layout,
                    |b, &layout| {
                        let x = ramp(rows * cols);
                        let w = vec![1.0f32; cols];
                        let mut y = vec![0.0f32; rows * cols];
                        let mut rstd = vec![0.0f32; rows];
                        b.iter(|| {
                            rms_norm_fwd(&x, &w, 1e-5, layout, &mut y, &mut rstd)
                                .expect("valid layout");
                            std::hint::black_box(&mut y);
                        });
                    },
                );
            }
        }

        group.finish();
    }

    /// Benchmark the sharded backward kernel
    pub fn bench_backward(c: &mut Criterion, config: &BenchConfig) {
        let mut group = c.benchmark_group("rmsnorm_kernel_backward");
        let shards = shard_count();

        for &rows in &config.row_counts {
            for &cols in &config.feature_dims {
                let layout = RowLayout {
                    rows,
                    cols,
                    element_size: 4,
                };
                group.throughput(Throughput::Elements((rows * cols) as u64));
                group.bench_with_input(
                    BenchmarkId::new("rows_x_cols", format!("{rows}x{cols}")),
                    &layout,
                    |b, &layout| {
                        let x = ramp(rows * cols);
                        let dy = ramp(rows * cols);
                        let w = vec![1.0f32; cols];
                        let rstd = vec![1.0f32; rows];
                        let mut dx = vec![0.0f32; rows * cols];
                        b.iter(|| {
                            let dw = rms_norm_bwd(&x, &w, &dy, &rstd, layout, shards, &mut dx)
                                .expect("valid layout");
                            std::hint::black_box(dw);
                        });
                    },
                );
            }
        }

        group.finish();
    }

    fn shard_count() -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

/// Fused against naive RMSNorm through the tensor API
pub mod tensor_benchmarks {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use dolomite::normalization::{FusedRmsNorm, NaiveRmsNorm, RmsNormKernel};

    fn inputs(rows: usize, cols: usize, dtype: DType) -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let make = |len: usize, shape: &[usize]| {
            Tensor::from_vec(ramp(len), shape, &device)
                .and_then(|t| t.to_dtype(dtype))
                .expect("tensor construction")
        };
        (
            make(rows * cols, &[rows, cols]),
            make(cols, &[cols]),
            make(rows * cols, &[rows, cols]),
        )
    }

    /// Forward and backward through each kernel implementation
    pub fn bench_kernels(c: &mut Criterion, config: &BenchConfig) {
        let kernels: [(&str, &dyn RmsNormKernel); 2] =
            [("fused", &FusedRmsNorm), ("naive", &NaiveRmsNorm)];

        for dtype in [DType::F32, DType::BF16] {
            let mut group = c.benchmark_group(format!("rmsnorm_tensor_{dtype:?}").to_lowercase());
            for &rows in &config.row_counts {
                for &cols in &config.feature_dims {
                    let (x, w, dy) = inputs(rows, cols, dtype);
                    group.throughput(Throughput::Elements((rows * cols) as u64));
                    for (label, kernel) in kernels {
                        group.bench_function(
                            BenchmarkId::new(format!("{label}_forward"), format!("{rows}x{cols}")),
                            |b| b.iter(|| kernel.forward(&x, &w, 1e-5).expect("forward")),
                        );
                        group.bench_function(
                            BenchmarkId::new(format!("{label}_backward"), format!("{rows}x{cols}")),
                            |b| {
                                b.iter_batched(
                                    || kernel.forward(&x, &w, 1e-5).expect("forward").1,
                                    |saved| kernel.backward(&dy, &w, saved).expect("backward"),
                                    criterion::BatchSize::SmallInput,
                                )
                            },
                        );
                    }
                }
            }
            group.finish();
        }
    }
}

/// Fused projection layout transforms
pub mod conversion_benchmarks {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use dolomite::AttentionGeometry;
    use dolomite_convert::attention::{
        deduplicate_key_value_heads, interleave_query_key_value, repeat_key_value_heads,
    };

    /// Interleave separate q/k/v projections into the grouped layout
    pub fn bench_interleave(c: &mut Criterion, config: &BenchConfig) {
        let mut group = c.benchmark_group("qkv_interleave");

        for &(heads, kv_heads, head_dim) in &config.head_layouts {
            let geometry = AttentionGeometry::new(heads, kv_heads, head_dim).expect("geometry");
            let hidden = heads * head_dim;
            let q = Tensor::zeros((geometry.query_rows(), hidden), DType::BF16, &Device::Cpu)
                .expect("q");
            let kv = Tensor::zeros((geometry.key_value_rows(), hidden), DType::BF16, &Device::Cpu)
                .expect("kv");
            group.throughput(Throughput::Bytes((geometry.fused_rows() * hidden * 2) as u64));
            group.bench_function(
                BenchmarkId::new("heads", format!("{heads}/{kv_heads}x{head_dim}")),
                |b| {
                    b.iter(|| {
                        interleave_query_key_value(&q, &kv, &kv, &geometry, "c_attn")
                            .expect("interleave")
                    })
                },
            );
        }

        group.finish();
    }

    /// Repeat grouped key/value heads and collapse them again
    pub fn bench_head_repetition(c: &mut Criterion, config: &BenchConfig) {
        let mut group = c.benchmark_group("kv_head_repetition");

        for &(heads, kv_heads, head_dim) in &config.head_layouts {
            let geometry = AttentionGeometry::new(heads, kv_heads, head_dim).expect("geometry");
            let hidden = heads * head_dim;
            let kv = Tensor::zeros((geometry.key_value_rows(), hidden), DType::BF16, &Device::Cpu)
                .expect("kv");
            group.bench_function(
                BenchmarkId::new("heads", format!("{heads}/{kv_heads}x{head_dim}")),
                |b| {
                    b.iter(|| {
                        let repeated = repeat_key_value_heads(&kv, &geometry, "k").expect("repeat");
                        deduplicate_key_value_heads(&repeated, &geometry, "k").expect("dedupe")
                    })
                },
            );
        }

        group.finish();
    }
}

/// Run all benchmarks with the given configuration
pub fn run_all_benchmarks(c: &mut Criterion, config: &BenchConfig) {
    kernel_benchmarks::bench_sum_squares(c, config);
    kernel_benchmarks::bench_forward(c, config);
    kernel_benchmarks::bench_backward(c, config);

    tensor_benchmarks::bench_kernels(c, config);

    conversion_benchmarks::bench_interleave(c, config);
    conversion_benchmarks::bench_head_repetition(c, config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_config_default() {
        let config = BenchConfig::default();
        assert!(!config.row_counts.is_empty());
        assert!(config
            .feature_dims
            .iter()
            .all(|&cols| dolomite_simd::block_size(cols, 4).is_ok()));
        for &(heads, kv_heads, head_dim) in &config.head_layouts {
            assert!(dolomite::AttentionGeometry::new(heads, kv_heads, head_dim).is_ok());
        }
    }
}
