//! SIMD-accelerated kernels for Dolomite
//!
//! This crate provides the fused row-parallel kernels used by the model
//! layers in `dolomite`. Kernels operate on flat row-major `f32` buffers; the
//! caller is responsible for converting to and from its tensor type.

#![warn(missing_docs)]

use thiserror::Error;

pub mod ops;
pub mod rmsnorm;

/// Largest row (in bytes) a fused kernel processes in a single block.
pub const MAX_FUSED_BLOCK_BYTES: usize = 65536;

/// Errors raised by the fused kernels
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The feature dimension does not fit in one kernel block
    #[error("feature dimension {features} exceeds the maximum fused block size {block_size}")]
    FeatureDimensionTooLarge {
        /// Requested feature dimension
        features: usize,
        /// Largest block the kernel can address
        block_size: usize,
    },

    /// A buffer does not have the length implied by the launch geometry
    #[error("buffer `{buffer}` has length {actual}, expected {expected}")]
    LengthMismatch {
        /// Name of the offending buffer
        buffer: &'static str,
        /// Expected element count
        expected: usize,
        /// Actual element count
        actual: usize,
    },

    /// Zero-width rows cannot be normalized
    #[error("feature dimension must be greater than zero")]
    EmptyFeatures,
}

/// Result type for kernel launches
pub type KernelResult<T> = Result<T, KernelError>;

/// SIMD vector width detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdCapability {
    /// 512-bit x86 vectors
    Avx512,
    /// 256-bit x86 vectors
    Avx2,
    /// 128-bit x86 vectors
    Sse4,
    /// 128-bit ARM vectors
    Neon,
    /// No vector unit detected
    Scalar,
}

impl SimdCapability {
    /// Detect the best available SIMD capability
    pub fn detect() -> Self {
        if cfg!(feature = "portable") {
            return SimdCapability::Scalar;
        }

        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx512f") {
                return SimdCapability::Avx512;
            }
            if is_x86_feature_detected!("avx2") {
                return SimdCapability::Avx2;
            }
            if is_x86_feature_detected!("sse4.1") {
                return SimdCapability::Sse4;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("neon") {
                return SimdCapability::Neon;
            }
        }

        SimdCapability::Scalar
    }

    /// Get the vector width in f32 elements
    pub fn vector_width_f32(&self) -> usize {
        match self {
            SimdCapability::Avx512 => 16,
            SimdCapability::Avx2 => 8,
            SimdCapability::Sse4 => 4,
            SimdCapability::Neon => 4,
            SimdCapability::Scalar => 1,
        }
    }

    /// Whether the 8-lane `wide` code path should be used
    pub fn is_vectorized(&self) -> bool {
        !matches!(self, SimdCapability::Scalar)
    }
}

/// Global SIMD capability detector
pub static SIMD_CAPABILITY: once_cell::sync::Lazy<SimdCapability> =
    once_cell::sync::Lazy::new(SimdCapability::detect);

/// Compute the kernel block size for a row of `features` elements of
/// `element_size` bytes.
///
/// The block is the next power of two of `features`, capped at
/// [`MAX_FUSED_BLOCK_BYTES`]. Rows wider than the block are rejected rather
/// than truncated.
pub fn block_size(features: usize, element_size: usize) -> KernelResult<usize> {
    if features == 0 {
        return Err(KernelError::EmptyFeatures);
    }
    let max_size = MAX_FUSED_BLOCK_BYTES / element_size.max(1);
    let block = max_size.min(features.next_power_of_two());
    if features > block {
        return Err(KernelError::FeatureDimensionTooLarge {
            features,
            block_size: block,
        });
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simd_detection() {
        let cap = SimdCapability::detect();
        assert!(cap.vector_width_f32() >= 1);
    }

    #[test]
    fn test_block_size_rounds_up_to_power_of_two() {
        assert_eq!(block_size(1, 4).unwrap(), 1);
        assert_eq!(block_size(100, 4).unwrap(), 128);
        assert_eq!(block_size(4096, 2).unwrap(), 4096);
    }

    #[test]
    fn test_block_size_limit_depends_on_element_size() {
        assert_eq!(block_size(16384, 4).unwrap(), 16384);
        assert_eq!(
            block_size(16385, 4),
            Err(KernelError::FeatureDimensionTooLarge {
                features: 16385,
                block_size: 16384
            })
        );
        // half precision rows may be twice as wide
        assert_eq!(block_size(32768, 2).unwrap(), 32768);
    }

    #[test]
    fn test_block_size_rejects_empty_rows() {
        assert_eq!(block_size(0, 4), Err(KernelError::EmptyFeatures));
    }
}
