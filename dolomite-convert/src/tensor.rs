//! Tensor helpers shared by the checkpoint store and the adapters

use candle_core::{DType, Device, Tensor};
use dolomite::{Error, Result};
use safetensors::Dtype;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::warn;

/// Named tensors of one checkpoint
pub type StateDict = HashMap<String, Tensor>;

/// Buffers that models register but never persist as parameters
const NON_PERSISTENT_SUFFIXES: &[&str] = &["rotary_emb.inv_freq", "attn.bias", "attn.masked_bias"];

/// Map a candle dtype to its safetensors tag
pub fn to_safetensors_dtype(dtype: DType) -> Result<Dtype> {
    #[allow(unreachable_patterns)]
    let dtype = match dtype {
        DType::U8 => Dtype::U8,
        DType::U32 => Dtype::U32,
        DType::I64 => Dtype::I64,
        DType::BF16 => Dtype::BF16,
        DType::F16 => Dtype::F16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        other => {
            return Err(Error::checkpoint(format!(
                "cannot serialize tensors of dtype {other:?}"
            )))
        }
    };
    Ok(dtype)
}

/// Map a safetensors tag to the candle dtype used in memory
pub fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    let dtype = match dtype {
        Dtype::U8 => DType::U8,
        Dtype::U32 => DType::U32,
        Dtype::I64 => DType::I64,
        Dtype::BF16 => DType::BF16,
        Dtype::F16 => DType::F16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        other => {
            return Err(Error::checkpoint(format!(
                "unsupported tensor dtype {other:?}"
            )))
        }
    };
    Ok(dtype)
}

/// Little-endian row-major bytes of a tensor, as stored in safetensors
pub fn tensor_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    #[allow(unreachable_patterns)]
    let bytes = match tensor.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => flat
            .to_vec1::<u32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::I64 => flat
            .to_vec1::<i64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::BF16 => flat
            .to_vec1::<half::bf16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F16 => flat
            .to_vec1::<half::f16>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F32 => flat
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        DType::F64 => flat
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        other => {
            return Err(Error::checkpoint(format!(
                "cannot serialize tensors of dtype {other:?}"
            )))
        }
    };
    Ok(bytes)
}

/// Rebuild a CPU tensor from safetensors bytes
pub fn tensor_from_bytes(data: &[u8], dtype: Dtype, shape: &[usize]) -> Result<Tensor> {
    let dtype = from_safetensors_dtype(dtype)?;
    Ok(Tensor::from_raw_buffer(data, dtype, shape, &Device::Cpu)?)
}

/// Same dtype, same shape and identical bytes
pub fn bitwise_equal(a: &Tensor, b: &Tensor) -> Result<bool> {
    if a.dtype() != b.dtype() || a.dims() != b.dims() {
        return Ok(false);
    }
    Ok(tensor_bytes(a)? == tensor_bytes(b)?)
}

/// Read-only view over a source state dict that records which tensors an
/// adapter consumed, so leftovers can be reported once the mapping is done.
pub(crate) struct TensorSource<'a> {
    tensors: &'a StateDict,
    taken: HashSet<&'a str>,
}

impl<'a> TensorSource<'a> {
    pub(crate) fn new(tensors: &'a StateDict) -> Self {
        Self {
            tensors,
            taken: HashSet::with_capacity(tensors.len()),
        }
    }

    /// Borrow a required tensor
    pub(crate) fn take(&mut self, name: &str) -> Result<&'a Tensor> {
        let (key, tensor) = self
            .tensors
            .get_key_value(name)
            .ok_or_else(|| Error::missing_tensor(name))?;
        self.taken.insert(key.as_str());
        Ok(tensor)
    }

    /// Deep copy of a required tensor, so the output never aliases the input
    pub(crate) fn copy(&mut self, name: &str) -> Result<Tensor> {
        Ok(self.take(name)?.copy()?)
    }

    /// Take `name` with its shape checked against `expected`
    pub(crate) fn take_shaped(&mut self, name: &str, expected: &[usize]) -> Result<&'a Tensor> {
        let tensor = self.take(name)?;
        if tensor.dims() != expected {
            return Err(Error::shape_mismatch(name, expected, tensor.dims()));
        }
        Ok(tensor)
    }

    /// Names present in the source that no mapping consumed
    pub(crate) fn unconsumed(&self) -> BTreeSet<&'a str> {
        self.tensors
            .keys()
            .map(String::as_str)
            .filter(|name| !self.taken.contains(name))
            .filter(|name| !NON_PERSISTENT_SUFFIXES.iter().any(|s| name.ends_with(s)))
            .collect()
    }

    /// Log every tensor the conversion dropped
    pub(crate) fn finish(self, format: &str) {
        let leftover = self.unconsumed();
        if !leftover.is_empty() {
            warn!(
                format,
                count = leftover.len(),
                tensors = ?leftover,
                "source tensors were not mapped and will be dropped"
            );
        }
    }
}
