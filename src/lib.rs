//! Dolomite - transformer model utilities
//!
//! This crate holds the pieces of the Dolomite model stack shared by the
//! checkpoint converters in `dolomite-convert`:
//! - the internal model configuration ([`DolomiteConfig`])
//! - the error taxonomy ([`Error`])
//! - RMS normalization with fused and naive kernels ([`normalization`])
//! - tracing subscriber setup ([`logging`])

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod normalization;

// Re-exports
pub use config::{
    AttentionGeometry, AttentionHeadType, DolomiteConfig, NormalizationFunction,
    PositionEmbeddingType,
};
pub use error::{Error, Result};
pub use normalization::{KernelBackend, RmsNorm, RmsNormGrads, RmsNormKernel, RmsNormSaved};
