//! Configuration structures for Dolomite models
//!
//! [`DolomiteConfig`] is the `config.json` descriptor of an internal
//! (`gpt_dolomite`) checkpoint. Adapters translate it to and from the
//! configuration of each external format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{Error, Result};

/// `model_type` written into internal checkpoints
pub const DOLOMITE_MODEL_TYPE: &str = "gpt_dolomite";

/// Architecture name written into internal checkpoints
pub const DOLOMITE_ARCHITECTURE: &str = "GPTDolomiteForCausalLM";

/// How key/value heads relate to query heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionHeadType {
    /// Multi-head attention: one key/value head per query head
    Mha,
    /// Multi-query attention: a single shared key/value head
    Mqa,
    /// Grouped-query attention: key/value heads shared by groups of query heads
    Gqa,
}

impl AttentionHeadType {
    /// Classify a head configuration
    pub fn from_head_counts(num_heads: usize, num_key_value_heads: usize) -> Self {
        if num_key_value_heads == num_heads {
            Self::Mha
        } else if num_key_value_heads == 1 {
            Self::Mqa
        } else {
            Self::Gqa
        }
    }
}

/// Normalization layer used by the blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationFunction {
    /// Mean-centred layer normalization with bias
    Layernorm,
    /// Root-mean-square normalization without bias
    Rmsnorm,
}

/// Position embedding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    /// Learned absolute position table (`wpe`)
    LearnedAbsolute,
    /// Rotary embeddings
    Rope,
    /// No position information
    Nope,
}

fn default_model_type() -> String {
    DOLOMITE_MODEL_TYPE.to_string()
}

fn default_activation() -> String {
    "gelu_pytorch_tanh".to_string()
}

fn default_head_type() -> AttentionHeadType {
    AttentionHeadType::Mha
}

fn default_normalization() -> NormalizationFunction {
    NormalizationFunction::Layernorm
}

fn default_position_embedding() -> PositionEmbeddingType {
    PositionEmbeddingType::LearnedAbsolute
}

fn default_epsilon() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_true() -> bool {
    true
}

/// Internal model configuration (`config.json` of a `gpt_dolomite` checkpoint)
///
/// Architecture dimensions default to zero when absent so that
/// [`DolomiteConfig::validate`] can report exactly which one is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DolomiteConfig {
    /// Always `gpt_dolomite` for internal checkpoints
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Architecture class names
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Vocabulary size
    #[serde(default)]
    pub vocab_size: usize,
    /// Maximum sequence length
    #[serde(default)]
    pub n_positions: usize,
    /// Hidden size
    #[serde(default)]
    pub n_embd: usize,
    /// Number of transformer blocks
    #[serde(default)]
    pub n_layer: usize,
    /// Number of query heads
    #[serde(default)]
    pub n_head: usize,
    /// Number of key/value heads (required for GQA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// MLP inner size, `4 * n_embd` when absent
    #[serde(default)]
    pub n_inner: Option<usize>,
    /// MLP activation; names ending in `glu` use a fused up/gate projection
    #[serde(default = "default_activation")]
    pub activation_function: String,
    /// Attention head layout
    #[serde(default = "default_head_type")]
    pub attention_head_type: AttentionHeadType,
    /// Normalization layer
    #[serde(default = "default_normalization")]
    pub normalization_function: NormalizationFunction,
    /// Normalization epsilon
    #[serde(default = "default_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Position embedding scheme
    #[serde(default = "default_position_embedding")]
    pub position_embedding_type: PositionEmbeddingType,
    /// Rotary base frequency
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Rotary scaling parameters, passed through untouched
    #[serde(default)]
    pub rope_scaling: Option<Value>,
    /// Whether linear layers and layernorms carry biases
    #[serde(default = "default_true")]
    pub add_bias: bool,
    /// Whether the LM head shares the token embedding
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    /// Weight initialization standard deviation
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    /// Residual dropout
    #[serde(default)]
    pub resid_pdrop: f64,
    /// Embedding dropout
    #[serde(default)]
    pub embd_pdrop: f64,
    /// Attention dropout
    #[serde(default)]
    pub attn_pdrop: f64,
    /// Scale attention scores by `1 / sqrt(head_dim)`
    #[serde(default = "default_true")]
    pub scale_attn_weights: bool,
    /// Run the attention softmax in f32
    #[serde(default = "default_true")]
    pub attention_softmax_in_fp32: bool,
    /// Enable the KV cache
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Embedding output multiplier
    #[serde(default)]
    pub m_emb: Option<f64>,
    /// Logit divisor
    #[serde(default)]
    pub m_width: Option<f64>,
    /// Residual branch multiplier
    #[serde(default)]
    pub m_residual: Option<f64>,
    /// Attention score multiplier, `1 / sqrt(head_dim)` when absent
    #[serde(default)]
    pub attention_multiplier: Option<f64>,
    /// Beginning-of-sequence token id(s)
    #[serde(default)]
    pub bos_token_id: Option<Value>,
    /// End-of-sequence token id(s)
    #[serde(default)]
    pub eos_token_id: Option<Value>,
    /// Padding token id
    #[serde(default)]
    pub pad_token_id: Option<Value>,
    /// Storage dtype recorded by the source framework
    #[serde(default)]
    pub torch_dtype: Option<String>,
}

impl Default for DolomiteConfig {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            architectures: vec![DOLOMITE_ARCHITECTURE.to_string()],
            vocab_size: 50257,
            n_positions: 1024,
            n_embd: 768,
            n_layer: 12,
            n_head: 12,
            num_key_value_heads: None,
            n_inner: None,
            activation_function: default_activation(),
            attention_head_type: default_head_type(),
            normalization_function: default_normalization(),
            layer_norm_epsilon: default_epsilon(),
            position_embedding_type: default_position_embedding(),
            rope_theta: default_rope_theta(),
            rope_scaling: None,
            add_bias: true,
            tie_word_embeddings: true,
            initializer_range: default_initializer_range(),
            resid_pdrop: 0.0,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            scale_attn_weights: true,
            attention_softmax_in_fp32: true,
            use_cache: true,
            m_emb: None,
            m_width: None,
            m_residual: None,
            attention_multiplier: None,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
            torch_dtype: None,
        }
    }
}

impl DolomiteConfig {
    /// Load configuration from a `config.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an already parsed JSON document
    pub fn from_value(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("vocab_size", self.vocab_size),
            ("n_embd", self.n_embd),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
        ] {
            if value == 0 {
                return Err(Error::missing_configuration(field));
            }
        }

        if self.n_embd % self.n_head != 0 {
            return Err(Error::config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }

        let kv_heads = self.key_value_heads()?;
        if kv_heads == 0 || self.n_head % kv_heads != 0 {
            return Err(Error::config(format!(
                "n_head ({}) must be divisible by num_key_value_heads ({})",
                self.n_head, kv_heads
            )));
        }

        match self.attention_head_type {
            AttentionHeadType::Mha if kv_heads != self.n_head => Err(Error::config(format!(
                "mha requires num_key_value_heads == n_head, got {kv_heads}"
            ))),
            AttentionHeadType::Mqa if kv_heads != 1 => Err(Error::config(format!(
                "mqa requires num_key_value_heads == 1, got {kv_heads}"
            ))),
            _ => Ok(()),
        }
    }

    /// Number of key/value heads implied by the attention head type
    pub fn key_value_heads(&self) -> Result<usize> {
        match self.attention_head_type {
            AttentionHeadType::Mha => Ok(self.num_key_value_heads.unwrap_or(self.n_head)),
            AttentionHeadType::Mqa => Ok(self.num_key_value_heads.unwrap_or(1)),
            AttentionHeadType::Gqa => self
                .num_key_value_heads
                .ok_or_else(|| Error::missing_configuration("num_key_value_heads")),
        }
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head.max(1)
    }

    /// MLP inner size
    pub fn inner_size(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// Whether the MLP uses a gated linear unit (fused up/gate projection)
    pub fn is_glu(&self) -> bool {
        self.activation_function.ends_with("glu")
    }

    /// Whether any of the width-scaling multipliers is set
    pub fn has_multipliers(&self) -> bool {
        self.m_emb.is_some()
            || self.m_width.is_some()
            || self.m_residual.is_some()
            || self.attention_multiplier.is_some()
    }

    /// Attention geometry derived from the head configuration
    pub fn attention_geometry(&self) -> Result<AttentionGeometry> {
        AttentionGeometry::new(self.n_head, self.key_value_heads()?, self.head_dim())
    }
}

/// Head counts and sizes that fix the fused QKV chunk layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionGeometry {
    /// Number of query heads
    pub num_heads: usize,
    /// Number of key/value heads
    pub num_key_value_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
}

impl AttentionGeometry {
    /// Create a geometry, checking that query heads split evenly into groups
    pub fn new(num_heads: usize, num_key_value_heads: usize, head_dim: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(Error::missing_configuration("num_attention_heads"));
        }
        if num_key_value_heads == 0 || num_heads % num_key_value_heads != 0 {
            return Err(Error::config(format!(
                "{num_heads} query heads cannot be grouped over {num_key_value_heads} key/value heads"
            )));
        }
        if head_dim == 0 {
            return Err(Error::config("head dimension must be greater than zero"));
        }
        Ok(Self {
            num_heads,
            num_key_value_heads,
            head_dim,
        })
    }

    /// The same head count with one key/value head per query head
    pub fn multi_head(&self) -> Self {
        Self {
            num_key_value_heads: self.num_heads,
            ..*self
        }
    }

    /// Query heads sharing one key/value head
    pub fn query_heads_per_group(&self) -> usize {
        self.num_heads / self.num_key_value_heads
    }

    /// Rows of the query projection
    pub fn query_rows(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Rows of each of the key and value projections
    pub fn key_value_rows(&self) -> usize {
        self.num_key_value_heads * self.head_dim
    }

    /// Rows of the fused QKV projection
    pub fn fused_rows(&self) -> usize {
        self.query_rows() + 2 * self.key_value_rows()
    }

    /// Attention head type of this geometry
    pub fn head_type(&self) -> AttentionHeadType {
        AttentionHeadType::from_head_counts(self.num_heads, self.num_key_value_heads)
    }
}
