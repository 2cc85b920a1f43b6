use dolomite::{DolomiteConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::llama::{export_tensors, import_tensors, LlamaConfig};
use super::parse_config;
use crate::registry::{FormatAdapter, ModelType};
use crate::tensor::StateDict;

fn default_multiplier() -> f64 {
    1.0
}

/// `config.json` of a `granite` checkpoint: the llama fields plus the
/// width-scaling multipliers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraniteConfig {
    #[serde(flatten)]
    pub base: LlamaConfig,
    /// Scale applied to token embeddings (`m_emb`)
    #[serde(default = "default_multiplier")]
    pub embedding_multiplier: f64,
    /// Scale applied to residual branches (`m_residual`)
    #[serde(default = "default_multiplier")]
    pub residual_multiplier: f64,
    /// Attention score scale (`attention_multiplier`)
    #[serde(default = "default_multiplier")]
    pub attention_multiplier: f64,
    /// Logit divisor (`m_width`)
    #[serde(default = "default_multiplier")]
    pub logits_scaling: f64,
}

/// Adapter for `granite` checkpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct GraniteAdapter;

impl FormatAdapter for GraniteAdapter {
    fn model_type(&self) -> ModelType {
        ModelType::Granite
    }

    fn import_config(&self, external: &Value) -> Result<DolomiteConfig> {
        let external: GraniteConfig = parse_config(external)?;
        let mut config = external.base.to_dolomite(ModelType::Granite)?;
        config.m_emb = Some(external.embedding_multiplier);
        config.m_residual = Some(external.residual_multiplier);
        config.attention_multiplier = Some(external.attention_multiplier);
        config.m_width = Some(external.logits_scaling);
        Ok(config)
    }

    fn export_config(&self, config: &DolomiteConfig) -> Result<Value> {
        let base = LlamaConfig::from_dolomite(config, ModelType::Granite)?;
        // an unset attention multiplier means the standard 1 / sqrt(head_dim)
        let attention_multiplier = config
            .attention_multiplier
            .unwrap_or_else(|| 1.0 / (config.head_dim() as f64).sqrt());
        let external = GraniteConfig {
            base,
            embedding_multiplier: config.m_emb.unwrap_or(1.0),
            residual_multiplier: config.m_residual.unwrap_or(1.0),
            attention_multiplier,
            logits_scaling: config.m_width.unwrap_or(1.0),
        };
        Ok(serde_json::to_value(external)?)
    }

    fn import_state_dict(&self, config: &DolomiteConfig, external: &StateDict) -> Result<StateDict> {
        import_tensors(config, external, ModelType::Granite)
    }

    fn export_state_dict(&self, config: &DolomiteConfig, internal: &StateDict) -> Result<StateDict> {
        export_tensors(config, internal, ModelType::Granite)
    }
}
