use dolomite::config::{DOLOMITE_ARCHITECTURE, DOLOMITE_MODEL_TYPE};
use dolomite::{
    AttentionGeometry, AttentionHeadType, DolomiteConfig, Error, NormalizationFunction,
    PositionEmbeddingType, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{check_shape, parse_config, require};
use crate::attention::{
    deduplicate_key_value_heads, interleave_query_key_value, repeat_key_value_heads,
    split_query_key_value,
};
use crate::layout::{internal_layout, TensorRole};
use crate::registry::{FormatAdapter, ModelType};
use crate::tensor::{StateDict, TensorSource};

const FORMAT: &str = "gpt_bigcode";
const ARCHITECTURE: &str = "GPTBigCodeForCausalLM";

fn default_model_type() -> String {
    FORMAT.to_string()
}

fn default_activation() -> String {
    "gelu_pytorch_tanh".to_string()
}

fn default_dropout() -> f64 {
    0.1
}

fn default_epsilon() -> f64 {
    1e-5
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_true() -> bool {
    true
}

/// `config.json` of a `gpt_bigcode` checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptBigCodeConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default)]
    pub n_positions: usize,
    #[serde(default)]
    pub n_embd: usize,
    #[serde(default)]
    pub n_layer: usize,
    #[serde(default)]
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_activation")]
    pub activation_function: String,
    #[serde(default = "default_dropout")]
    pub resid_pdrop: f64,
    #[serde(default = "default_dropout")]
    pub embd_pdrop: f64,
    #[serde(default = "default_dropout")]
    pub attn_pdrop: f64,
    #[serde(default = "default_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_true")]
    pub scale_attn_weights: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_true")]
    pub attention_softmax_in_fp32: bool,
    #[serde(default = "default_true")]
    pub scale_attention_softmax_in_fp32: bool,
    /// One shared key/value head; otherwise one per query head
    #[serde(default = "default_true")]
    pub multi_query: bool,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<Value>,
    #[serde(default)]
    pub eos_token_id: Option<Value>,
    #[serde(default)]
    pub pad_token_id: Option<Value>,
    /// Grouping hint recorded when grouped-query weights were expanded to
    /// multi-head on export; lets import restore the grouped layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
}

/// Adapter for `gpt_bigcode` checkpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct BigCodeAdapter;

impl BigCodeAdapter {
    fn check_exportable(config: &DolomiteConfig) -> Result<()> {
        if config.normalization_function != NormalizationFunction::Layernorm {
            return Err(Error::incompatible(FORMAT, "normalization_function must be layernorm"));
        }
        if config.position_embedding_type != PositionEmbeddingType::LearnedAbsolute {
            return Err(Error::incompatible(
                FORMAT,
                "position_embedding_type must be learned_absolute",
            ));
        }
        if !config.add_bias {
            return Err(Error::incompatible(FORMAT, "add_bias must be true"));
        }
        if config.is_glu() {
            return Err(Error::incompatible(
                FORMAT,
                format!("gated activation `{}` is not supported", config.activation_function),
            ));
        }
        if config.has_multipliers() {
            return Err(Error::incompatible(FORMAT, "width multipliers are not supported"));
        }
        Ok(())
    }
}

/// Fused QKV layout of the external checkpoint: grouped-query attention is
/// stored expanded to multi-head, the other head types as they are.
fn external_geometry(geometry: &AttentionGeometry) -> AttentionGeometry {
    match geometry.head_type() {
        AttentionHeadType::Gqa => geometry.multi_head(),
        _ => *geometry,
    }
}

impl FormatAdapter for BigCodeAdapter {
    fn model_type(&self) -> ModelType {
        ModelType::GptBigCode
    }

    fn import_config(&self, external: &Value) -> Result<DolomiteConfig> {
        let external: GptBigCodeConfig = parse_config(external)?;
        let n_head = require("n_head", external.n_head)?;

        let stored_kv_heads = if external.multi_query { 1 } else { n_head };
        let kv_heads = match external.num_key_value_heads {
            Some(hint) if !external.multi_query && hint < n_head => hint,
            _ => stored_kv_heads,
        };

        let config = DolomiteConfig {
            architectures: vec![DOLOMITE_ARCHITECTURE.to_string()],
            vocab_size: require("vocab_size", external.vocab_size)?,
            n_positions: require("n_positions", external.n_positions)?,
            n_embd: require("n_embd", external.n_embd)?,
            n_layer: require("n_layer", external.n_layer)?,
            n_head,
            num_key_value_heads: Some(kv_heads),
            n_inner: external.n_inner,
            activation_function: external.activation_function,
            attention_head_type: AttentionHeadType::from_head_counts(n_head, kv_heads),
            normalization_function: NormalizationFunction::Layernorm,
            layer_norm_epsilon: external.layer_norm_epsilon,
            position_embedding_type: PositionEmbeddingType::LearnedAbsolute,
            add_bias: true,
            tie_word_embeddings: external.tie_word_embeddings,
            initializer_range: external.initializer_range,
            resid_pdrop: external.resid_pdrop,
            embd_pdrop: external.embd_pdrop,
            attn_pdrop: external.attn_pdrop,
            scale_attn_weights: external.scale_attn_weights,
            attention_softmax_in_fp32: external.attention_softmax_in_fp32,
            use_cache: external.use_cache,
            bos_token_id: external.bos_token_id,
            eos_token_id: external.eos_token_id,
            pad_token_id: external.pad_token_id,
            torch_dtype: external.torch_dtype,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn export_config(&self, config: &DolomiteConfig) -> Result<Value> {
        Self::check_exportable(config)?;
        let kv_heads = config.key_value_heads()?;
        let head_type = config.attention_geometry()?.head_type();

        let external = GptBigCodeConfig {
            architectures: vec![ARCHITECTURE.to_string()],
            model_type: default_model_type(),
            vocab_size: config.vocab_size,
            n_positions: config.n_positions,
            n_embd: config.n_embd,
            n_layer: config.n_layer,
            n_head: config.n_head,
            n_inner: config.n_inner,
            activation_function: config.activation_function.clone(),
            resid_pdrop: config.resid_pdrop,
            embd_pdrop: config.embd_pdrop,
            attn_pdrop: config.attn_pdrop,
            layer_norm_epsilon: config.layer_norm_epsilon,
            initializer_range: config.initializer_range,
            scale_attn_weights: config.scale_attn_weights,
            use_cache: config.use_cache,
            attention_softmax_in_fp32: config.attention_softmax_in_fp32,
            scale_attention_softmax_in_fp32: config.attention_softmax_in_fp32,
            multi_query: config.attention_head_type == AttentionHeadType::Mqa,
            tie_word_embeddings: config.tie_word_embeddings,
            bos_token_id: config.bos_token_id.clone(),
            eos_token_id: config.eos_token_id.clone(),
            pad_token_id: config.pad_token_id.clone(),
            num_key_value_heads: (head_type == AttentionHeadType::Gqa).then_some(kv_heads),
            torch_dtype: config.torch_dtype.clone(),
        };
        Ok(serde_json::to_value(external)?)
    }

    fn import_state_dict(&self, config: &DolomiteConfig, external: &StateDict) -> Result<StateDict> {
        let geometry = config.attention_geometry()?;
        let stored = external_geometry(&geometry);
        let mut source = TensorSource::new(external);
        let mut internal = StateDict::with_capacity(external.len());

        for spec in internal_layout(config)? {
            let tensor = if spec.role == TensorRole::QueryKeyValue && stored != geometry {
                let fused = source.take(&spec.name)?;
                let (q, k, v) = split_query_key_value(fused, &stored, &spec.name)?;
                let k = deduplicate_key_value_heads(&k, &geometry, &spec.name)?;
                let v = deduplicate_key_value_heads(&v, &geometry, &spec.name)?;
                interleave_query_key_value(&q, &k, &v, &geometry, &spec.name)?
            } else {
                source.copy(&spec.name)?
            };
            check_shape(&spec, &spec.name, &tensor)?;
            internal.insert(spec.name, tensor);
        }

        source.finish(FORMAT);
        debug!(tensors = internal.len(), "mapped gpt_bigcode tensors");
        Ok(internal)
    }

    fn export_state_dict(&self, config: &DolomiteConfig, internal: &StateDict) -> Result<StateDict> {
        Self::check_exportable(config)?;
        let geometry = config.attention_geometry()?;
        let stored = external_geometry(&geometry);
        let mut source = TensorSource::new(internal);
        let mut external = StateDict::with_capacity(internal.len());

        for spec in internal_layout(config)? {
            let tensor = source.take_shaped(&spec.name, &spec.shape)?;
            let tensor = if spec.role == TensorRole::QueryKeyValue && stored != geometry {
                let (q, k, v) = split_query_key_value(tensor, &geometry, &spec.name)?;
                let k = repeat_key_value_heads(&k, &geometry, &spec.name)?;
                let v = repeat_key_value_heads(&v, &geometry, &spec.name)?;
                interleave_query_key_value(&q, &k, &v, &stored, &spec.name)?
            } else {
                tensor.copy()?
            };
            external.insert(spec.name, tensor);
        }

        source.finish(DOLOMITE_MODEL_TYPE);
        Ok(external)
    }
}
