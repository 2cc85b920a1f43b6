use dolomite::config::{DOLOMITE_ARCHITECTURE, DOLOMITE_MODEL_TYPE};
use dolomite::{
    AttentionHeadType, DolomiteConfig, Error, NormalizationFunction, PositionEmbeddingType, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{check_shape, parse_config, require};
use crate::attention::{
    interleave_query_key_value, interleave_up_gate, split_query_key_value, split_up_gate,
};
use crate::layout::{internal_layout, TensorRole, TensorSpec};
use crate::registry::{FormatAdapter, ModelType};
use crate::tensor::{StateDict, TensorSource};

/// The only activation the llama MLP can express
const GATED_ACTIVATION: &str = "swiglu";
const HIDDEN_ACT: &str = "silu";

fn default_model_type() -> String {
    ModelType::Llama.as_str().to_string()
}

fn default_hidden_act() -> String {
    HIDDEN_ACT.to_string()
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_true() -> bool {
    true
}

/// `config.json` of a `llama` checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default)]
    pub hidden_size: usize,
    #[serde(default)]
    pub intermediate_size: usize,
    #[serde(default)]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub num_attention_heads: usize,
    /// Defaults to `num_attention_heads`
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Explicit head size; must equal `hidden_size / num_attention_heads`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<Value>,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub attention_dropout: f64,
    #[serde(default)]
    pub mlp_bias: bool,
    #[serde(default)]
    pub bos_token_id: Option<Value>,
    #[serde(default)]
    pub eos_token_id: Option<Value>,
    #[serde(default)]
    pub pad_token_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torch_dtype: Option<String>,
}

impl LlamaConfig {
    /// Internal configuration for a llama-layout checkpoint of `format`
    pub(crate) fn to_dolomite(&self, format: ModelType) -> Result<DolomiteConfig> {
        let n_head = require("num_attention_heads", self.num_attention_heads)?;
        let n_embd = require("hidden_size", self.hidden_size)?;
        let kv_heads = self.num_key_value_heads.unwrap_or(n_head);

        if self.attention_bias != self.mlp_bias {
            return Err(Error::incompatible(
                format.as_str(),
                "attention_bias and mlp_bias must be equal",
            ));
        }
        if self.hidden_act != HIDDEN_ACT {
            return Err(Error::incompatible(
                format.as_str(),
                format!("hidden_act `{}` is not supported, expected `{HIDDEN_ACT}`", self.hidden_act),
            ));
        }
        if let Some(head_dim) = self.head_dim {
            if head_dim * n_head != n_embd {
                return Err(Error::incompatible(
                    format.as_str(),
                    format!("head_dim {head_dim} does not divide hidden_size {n_embd} into {n_head} heads"),
                ));
            }
        }

        let config = DolomiteConfig {
            model_type: DOLOMITE_MODEL_TYPE.to_string(),
            architectures: vec![DOLOMITE_ARCHITECTURE.to_string()],
            vocab_size: require("vocab_size", self.vocab_size)?,
            n_positions: self.max_position_embeddings,
            n_embd,
            n_layer: require("num_hidden_layers", self.num_hidden_layers)?,
            n_head,
            num_key_value_heads: Some(kv_heads),
            n_inner: Some(require("intermediate_size", self.intermediate_size)?),
            activation_function: GATED_ACTIVATION.to_string(),
            attention_head_type: AttentionHeadType::from_head_counts(n_head, kv_heads),
            normalization_function: NormalizationFunction::Rmsnorm,
            layer_norm_epsilon: self.rms_norm_eps,
            position_embedding_type: PositionEmbeddingType::Rope,
            rope_theta: self.rope_theta,
            rope_scaling: self.rope_scaling.clone(),
            add_bias: self.attention_bias,
            tie_word_embeddings: self.tie_word_embeddings,
            initializer_range: self.initializer_range,
            resid_pdrop: 0.0,
            embd_pdrop: 0.0,
            attn_pdrop: self.attention_dropout,
            use_cache: self.use_cache,
            bos_token_id: self.bos_token_id.clone(),
            eos_token_id: self.eos_token_id.clone(),
            pad_token_id: self.pad_token_id.clone(),
            torch_dtype: self.torch_dtype.clone(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Llama-layout configuration of `format` for an internal configuration
    pub(crate) fn from_dolomite(config: &DolomiteConfig, format: ModelType) -> Result<Self> {
        check_llama_layout(config, format)?;
        Ok(Self {
            architectures: vec![architecture(format).to_string()],
            model_type: format.as_str().to_string(),
            vocab_size: config.vocab_size,
            hidden_size: config.n_embd,
            intermediate_size: config.inner_size(),
            num_hidden_layers: config.n_layer,
            num_attention_heads: config.n_head,
            num_key_value_heads: Some(config.key_value_heads()?),
            head_dim: None,
            hidden_act: default_hidden_act(),
            max_position_embeddings: config.n_positions,
            initializer_range: config.initializer_range,
            rms_norm_eps: config.layer_norm_epsilon,
            use_cache: config.use_cache,
            tie_word_embeddings: config.tie_word_embeddings,
            rope_theta: config.rope_theta,
            rope_scaling: config.rope_scaling.clone(),
            attention_bias: config.add_bias,
            attention_dropout: config.attn_pdrop,
            mlp_bias: config.add_bias,
            bos_token_id: config.bos_token_id.clone(),
            eos_token_id: config.eos_token_id.clone(),
            pad_token_id: config.pad_token_id.clone(),
            torch_dtype: config.torch_dtype.clone(),
        })
    }
}

fn architecture(format: ModelType) -> &'static str {
    match format {
        ModelType::Granite => "GraniteForCausalLM",
        _ => "LlamaForCausalLM",
    }
}

/// Structural requirements shared by every llama-layout format
pub(crate) fn check_llama_layout(config: &DolomiteConfig, format: ModelType) -> Result<()> {
    let format = format.as_str();
    if config.normalization_function != NormalizationFunction::Rmsnorm {
        return Err(Error::incompatible(format, "normalization_function must be rmsnorm"));
    }
    if config.position_embedding_type != PositionEmbeddingType::Rope {
        return Err(Error::incompatible(format, "position_embedding_type must be rope"));
    }
    if config.activation_function != GATED_ACTIVATION {
        return Err(Error::incompatible(
            format,
            format!(
                "activation_function must be {GATED_ACTIVATION}, got `{}`",
                config.activation_function
            ),
        ));
    }
    Ok(())
}

/// External tensor names a layout entry maps to: three for the fused
/// attention projection (q, k, v), two for the fused MLP input (up, gate)
fn external_names(spec: &TensorSpec, format: ModelType) -> Result<Vec<String>> {
    let kind = spec.kind.suffix();
    let layer = format!("model.layers.{}", spec.layer.unwrap_or_default());
    let names = match spec.role {
        TensorRole::TokenEmbedding => vec![format!("model.embed_tokens.{kind}")],
        TensorRole::FinalNorm => vec![format!("model.norm.{kind}")],
        TensorRole::LmHead => vec![format!("lm_head.{kind}")],
        TensorRole::AttentionNorm => vec![format!("{layer}.input_layernorm.{kind}")],
        TensorRole::MlpNorm => vec![format!("{layer}.post_attention_layernorm.{kind}")],
        TensorRole::QueryKeyValue => ["q_proj", "k_proj", "v_proj"]
            .iter()
            .map(|proj| format!("{layer}.self_attn.{proj}.{kind}"))
            .collect(),
        TensorRole::AttentionOutput => vec![format!("{layer}.self_attn.o_proj.{kind}")],
        TensorRole::MlpInput => ["up_proj", "gate_proj"]
            .iter()
            .map(|proj| format!("{layer}.mlp.{proj}.{kind}"))
            .collect(),
        TensorRole::MlpOutput => vec![format!("{layer}.mlp.down_proj.{kind}")],
        TensorRole::PositionEmbedding => {
            return Err(Error::incompatible(
                format.as_str(),
                "learned position embeddings have no counterpart",
            ))
        }
    };
    Ok(names)
}

/// Map llama-layout tensors onto the internal layout
pub(crate) fn import_tensors(
    config: &DolomiteConfig,
    external: &StateDict,
    format: ModelType,
) -> Result<StateDict> {
    let geometry = config.attention_geometry()?;
    let inner = config.inner_size();
    let mut source = TensorSource::new(external);
    let mut internal = StateDict::with_capacity(external.len());

    for spec in internal_layout(config)? {
        let names = external_names(&spec, format)?;
        let tensor = match spec.role {
            TensorRole::QueryKeyValue => interleave_query_key_value(
                source.take(&names[0])?,
                source.take(&names[1])?,
                source.take(&names[2])?,
                &geometry,
                &spec.name,
            )?,
            TensorRole::MlpInput => interleave_up_gate(
                source.take(&names[0])?,
                source.take(&names[1])?,
                inner,
                &spec.name,
            )?,
            _ => source.copy(&names[0])?,
        };
        check_shape(&spec, &names[0], &tensor)?;
        internal.insert(spec.name, tensor);
    }

    source.finish(format.as_str());
    debug!(%format, tensors = internal.len(), "mapped llama-layout tensors");
    Ok(internal)
}

/// Map internal tensors onto the llama layout
pub(crate) fn export_tensors(
    config: &DolomiteConfig,
    internal: &StateDict,
    format: ModelType,
) -> Result<StateDict> {
    check_llama_layout(config, format)?;
    let geometry = config.attention_geometry()?;
    let inner = config.inner_size();
    let mut source = TensorSource::new(internal);
    let mut external = StateDict::with_capacity(internal.len() + 3 * config.n_layer);

    for spec in internal_layout(config)? {
        let tensor = source.take_shaped(&spec.name, &spec.shape)?;
        let mut names = external_names(&spec, format)?.into_iter();
        let parts = match spec.role {
            TensorRole::QueryKeyValue => {
                let (q, k, v) = split_query_key_value(tensor, &geometry, &spec.name)?;
                vec![q, k, v]
            }
            TensorRole::MlpInput => {
                let (up, gate) = split_up_gate(tensor, inner, &spec.name)?;
                vec![up, gate]
            }
            _ => vec![tensor.copy()?],
        };
        for part in parts {
            if let Some(name) = names.next() {
                external.insert(name, part);
            }
        }
    }

    source.finish(DOLOMITE_MODEL_TYPE);
    Ok(external)
}

/// Adapter for `llama` checkpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaAdapter;

impl FormatAdapter for LlamaAdapter {
    fn model_type(&self) -> ModelType {
        ModelType::Llama
    }

    fn import_config(&self, external: &Value) -> Result<DolomiteConfig> {
        let external: LlamaConfig = parse_config(external)?;
        external.to_dolomite(ModelType::Llama)
    }

    fn export_config(&self, config: &DolomiteConfig) -> Result<Value> {
        if config.has_multipliers() {
            return Err(Error::incompatible(
                ModelType::Llama.as_str(),
                "width multipliers are not supported",
            ));
        }
        let external = LlamaConfig::from_dolomite(config, ModelType::Llama)?;
        Ok(serde_json::to_value(external)?)
    }

    fn import_state_dict(&self, config: &DolomiteConfig, external: &StateDict) -> Result<StateDict> {
        import_tensors(config, external, ModelType::Llama)
    }

    fn export_state_dict(&self, config: &DolomiteConfig, internal: &StateDict) -> Result<StateDict> {
        export_tensors(config, internal, ModelType::Llama)
    }
}
