//! Tensor layout of internal checkpoints
//!
//! [`internal_layout`] lists every tensor an internal checkpoint holds for a
//! given configuration, with its role and expected shape. Adapters walk this
//! list in both directions so that each one only has to describe how a role
//! maps to its own naming.

use dolomite::{DolomiteConfig, NormalizationFunction, PositionEmbeddingType, Result};

/// What a tensor does in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// `transformer.wte`
    TokenEmbedding,
    /// `transformer.wpe`
    PositionEmbedding,
    /// `transformer.h.{i}.ln_1`
    AttentionNorm,
    /// `transformer.h.{i}.attn.c_attn`
    QueryKeyValue,
    /// `transformer.h.{i}.attn.c_proj`
    AttentionOutput,
    /// `transformer.h.{i}.ln_2`
    MlpNorm,
    /// `transformer.h.{i}.mlp.c_fc`
    MlpInput,
    /// `transformer.h.{i}.mlp.c_proj`
    MlpOutput,
    /// `transformer.ln_f`
    FinalNorm,
    /// `lm_head`
    LmHead,
}

/// Parameter kind within a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// `.weight`
    Weight,
    /// `.bias`
    Bias,
}

impl ParamKind {
    /// Name suffix of the parameter
    pub fn suffix(&self) -> &'static str {
        match self {
            ParamKind::Weight => "weight",
            ParamKind::Bias => "bias",
        }
    }
}

/// One tensor of an internal checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    /// Internal tensor name
    pub name: String,
    /// Expected shape
    pub shape: Vec<usize>,
    /// Block index for per-layer tensors
    pub layer: Option<usize>,
    /// Module role
    pub role: TensorRole,
    /// Weight or bias
    pub kind: ParamKind,
}

impl TensorSpec {
    fn top(module: &str, role: TensorRole, kind: ParamKind, shape: Vec<usize>) -> Self {
        Self {
            name: format!("{module}.{}", kind.suffix()),
            shape,
            layer: None,
            role,
            kind,
        }
    }

    fn block(layer: usize, module: &str, role: TensorRole, kind: ParamKind, shape: Vec<usize>) -> Self {
        Self {
            name: format!("transformer.h.{layer}.{module}.{}", kind.suffix()),
            shape,
            layer: Some(layer),
            role,
            kind,
        }
    }
}

/// Every tensor of an internal checkpoint for `config`, in model order
pub fn internal_layout(config: &DolomiteConfig) -> Result<Vec<TensorSpec>> {
    use ParamKind::{Bias, Weight};
    use TensorRole::*;

    let geometry = config.attention_geometry()?;
    let hidden = config.n_embd;
    let inner = config.inner_size();
    let fc_rows = if config.is_glu() { 2 * inner } else { inner };
    let fused_rows = geometry.fused_rows();
    let norm_bias = config.normalization_function == NormalizationFunction::Layernorm;
    let bias = config.add_bias;

    let mut specs = vec![TensorSpec::top(
        "transformer.wte",
        TokenEmbedding,
        Weight,
        vec![config.vocab_size, hidden],
    )];
    if config.position_embedding_type == PositionEmbeddingType::LearnedAbsolute {
        specs.push(TensorSpec::top(
            "transformer.wpe",
            PositionEmbedding,
            Weight,
            vec![config.n_positions, hidden],
        ));
    }

    for layer in 0..config.n_layer {
        let modules = [
            ("ln_1", AttentionNorm, vec![hidden], vec![hidden], norm_bias),
            ("attn.c_attn", QueryKeyValue, vec![fused_rows, hidden], vec![fused_rows], bias),
            ("attn.c_proj", AttentionOutput, vec![hidden, hidden], vec![hidden], bias),
            ("ln_2", MlpNorm, vec![hidden], vec![hidden], norm_bias),
            ("mlp.c_fc", MlpInput, vec![fc_rows, hidden], vec![fc_rows], bias),
            ("mlp.c_proj", MlpOutput, vec![hidden, inner], vec![hidden], bias),
        ];
        for (module, role, weight_shape, bias_shape, has_bias) in modules {
            specs.push(TensorSpec::block(layer, module, role, Weight, weight_shape));
            if has_bias {
                specs.push(TensorSpec::block(layer, module, role, Bias, bias_shape));
            }
        }
    }

    specs.push(TensorSpec::top("transformer.ln_f", FinalNorm, Weight, vec![hidden]));
    if norm_bias {
        specs.push(TensorSpec::top("transformer.ln_f", FinalNorm, Bias, vec![hidden]));
    }
    if !config.tie_word_embeddings {
        specs.push(TensorSpec::top(
            "lm_head",
            LmHead,
            Weight,
            vec![config.vocab_size, hidden],
        ));
    }
    Ok(specs)
}
