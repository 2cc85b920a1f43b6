//! Test fixtures: small model configurations and random checkpoints

use candle_core::{DType, Device, Tensor};
use dolomite::config::DOLOMITE_ARCHITECTURE;
use dolomite::{
    AttentionHeadType, DolomiteConfig, NormalizationFunction, PositionEmbeddingType, Result,
};
use dolomite_convert::checkpoint::{save_checkpoint, write_json, SAFETENSORS_INDEX_FILE};
use dolomite_convert::layout::internal_layout;
use dolomite_convert::tensor::bitwise_equal;
use dolomite_convert::{FormatAdapter, StateDict};
use std::path::Path;

/// Shape of a tiny test model
#[derive(Debug, Clone, Copy)]
pub struct Dims {
    pub n_head: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub n_layer: usize,
}

impl Dims {
    pub fn new(n_head: usize, kv_heads: usize, head_dim: usize) -> Self {
        Self {
            n_head,
            kv_heads,
            head_dim,
            n_layer: 2,
        }
    }
}

fn base_config(dims: Dims) -> DolomiteConfig {
    DolomiteConfig {
        architectures: vec![DOLOMITE_ARCHITECTURE.to_string()],
        vocab_size: 11,
        n_positions: 16,
        n_embd: dims.n_head * dims.head_dim,
        n_layer: dims.n_layer,
        n_head: dims.n_head,
        num_key_value_heads: Some(dims.kv_heads),
        attention_head_type: AttentionHeadType::from_head_counts(dims.n_head, dims.kv_heads),
        bos_token_id: Some(serde_json::json!(0)),
        eos_token_id: Some(serde_json::json!(1)),
        ..Default::default()
    }
}

/// Internal configuration representable as `gpt_bigcode`
pub fn bigcode_config(dims: Dims) -> DolomiteConfig {
    DolomiteConfig {
        n_inner: Some(3 * dims.n_head * dims.head_dim),
        ..base_config(dims)
    }
}

/// Internal configuration representable as `llama`
pub fn llama_config(dims: Dims, add_bias: bool) -> DolomiteConfig {
    DolomiteConfig {
        n_inner: Some(5),
        activation_function: "swiglu".to_string(),
        normalization_function: NormalizationFunction::Rmsnorm,
        position_embedding_type: PositionEmbeddingType::Rope,
        layer_norm_epsilon: 1e-6,
        add_bias,
        tie_word_embeddings: false,
        ..base_config(dims)
    }
}

/// Internal configuration representable as `granite`
pub fn granite_config(dims: Dims) -> DolomiteConfig {
    DolomiteConfig {
        m_emb: Some(12.0),
        m_width: Some(8.0),
        m_residual: Some(0.22),
        attention_multiplier: Some(0.015625),
        tie_word_embeddings: true,
        ..llama_config(dims, false)
    }
}

/// Random internal state dict matching `config`
pub fn random_state_dict(config: &DolomiteConfig, dtype: DType) -> Result<StateDict> {
    let mut state_dict = StateDict::new();
    for spec in internal_layout(config)? {
        let tensor = Tensor::randn(0f32, 1.0, spec.shape.as_slice(), &Device::Cpu)?.to_dtype(dtype)?;
        state_dict.insert(spec.name, tensor);
    }
    Ok(state_dict)
}

/// Write `config` and `state_dict` converted by `adapter` as an external checkpoint
pub fn write_external_checkpoint(
    dir: &Path,
    adapter: &dyn FormatAdapter,
    config: &DolomiteConfig,
    state_dict: &StateDict,
    max_shard_size: u64,
) -> Result<()> {
    let external_config = adapter.export_config(config)?;
    let external = adapter.export_state_dict(config, state_dict)?;
    save_checkpoint(dir, &external_config, &external, max_shard_size)
}

/// Write an arbitrary config next to an arbitrary state dict
pub fn write_raw_checkpoint(dir: &Path, config: &serde_json::Value, state_dict: &StateDict) -> Result<()> {
    save_checkpoint(dir, config, state_dict, u64::MAX)
}

/// Whether a checkpoint directory is sharded
pub fn is_sharded(dir: &Path) -> bool {
    dir.join(SAFETENSORS_INDEX_FILE).is_file()
}

/// Write tokenizer and generation files a real checkpoint would carry
pub fn write_auxiliary_files(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("tokenizer.json"), br#"{"version": "1.0", "model": {}}"#)?;
    std::fs::write(dir.join("special_tokens_map.json"), br#"{"eos_token": "</s>"}"#)?;
    write_json(
        dir,
        "generation_config.json",
        &serde_json::json!({"bos_token_id": 0, "eos_token_id": 1, "max_new_tokens": 8}),
    )
}

/// Assert two state dicts hold the same names and bitwise identical tensors
pub fn assert_state_dicts_equal(expected: &StateDict, actual: &StateDict) {
    let mut expected_names: Vec<&String> = expected.keys().collect();
    let mut actual_names: Vec<&String> = actual.keys().collect();
    expected_names.sort();
    actual_names.sort();
    assert_eq!(expected_names, actual_names);

    for (name, tensor) in expected {
        assert!(
            bitwise_equal(tensor, &actual[name]).unwrap(),
            "tensor `{name}` differs"
        );
    }
}
