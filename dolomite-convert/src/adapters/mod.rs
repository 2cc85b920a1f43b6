//! Format adapters
//!
//! - [`BigCodeAdapter`]: `gpt_bigcode`, whose tensor names match the internal layout
//! - [`LlamaAdapter`]: `llama`, with separate q/k/v and up/gate projections
//! - [`GraniteAdapter`]: `granite`, the llama layout plus width multipliers

mod bigcode;
mod granite;
mod llama;

pub use bigcode::{BigCodeAdapter, GptBigCodeConfig};
pub use granite::{GraniteAdapter, GraniteConfig};
pub use llama::{LlamaAdapter, LlamaConfig};

use candle_core::Tensor;
use dolomite::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::layout::TensorSpec;

/// Deserialize an external `config.json`
fn parse_config<T: DeserializeOwned>(external: &Value) -> Result<T> {
    Ok(serde_json::from_value(external.clone())?)
}

/// Reject absent (zero) dimensions by their external field name
fn require(field: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(Error::missing_configuration(field));
    }
    Ok(value)
}

/// Check a converted tensor against its layout entry
fn check_shape(spec: &TensorSpec, name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.dims() != spec.shape.as_slice() {
        return Err(Error::shape_mismatch(name, &spec.shape, tensor.dims()));
    }
    Ok(())
}
