//! Format registry
//!
//! Every supported external format is a [`ModelType`] with one
//! [`FormatAdapter`] that owns both directions of the conversion.

use dolomite::{DolomiteConfig, Error, Result};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::adapters::{BigCodeAdapter, GraniteAdapter, LlamaAdapter};
use crate::checkpoint;
use crate::options::ConversionOptions;
use crate::tensor::StateDict;

/// External formats with a registered adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// `gpt_bigcode`
    GptBigCode,
    /// `granite`
    Granite,
    /// `llama`
    Llama,
}

impl ModelType {
    /// Every registered format
    pub const ALL: [ModelType; 3] = [ModelType::GptBigCode, ModelType::Granite, ModelType::Llama];

    /// The `model_type` tag used in `config.json`
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::GptBigCode => "gpt_bigcode",
            ModelType::Granite => "granite",
            ModelType::Llama => "llama",
        }
    }

    /// Adapter converting this format
    pub fn adapter(&self) -> &'static dyn FormatAdapter {
        match self {
            ModelType::GptBigCode => &BigCodeAdapter,
            ModelType::Granite => &GraniteAdapter,
            ModelType::Llama => &LlamaAdapter,
        }
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        ModelType::ALL
            .into_iter()
            .find(|model_type| model_type.as_str() == tag)
            .ok_or_else(|| Error::unsupported_format(tag))
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional conversion between one external format and the internal layout.
///
/// Implementors provide the four pure mappings; the provided `import` and
/// `export` methods wire them to checkpoint directories.
pub trait FormatAdapter: Send + Sync {
    /// Format handled by this adapter
    fn model_type(&self) -> ModelType;

    /// External `config.json` to internal configuration
    fn import_config(&self, external: &Value) -> Result<DolomiteConfig>;

    /// Internal configuration to external `config.json`
    fn export_config(&self, config: &DolomiteConfig) -> Result<Value>;

    /// External tensors to internal tensors, given the imported configuration
    fn import_state_dict(&self, config: &DolomiteConfig, external: &StateDict) -> Result<StateDict>;

    /// Internal tensors to external tensors
    fn export_state_dict(&self, config: &DolomiteConfig, internal: &StateDict) -> Result<StateDict>;

    /// Convert the external checkpoint in `source` into an internal one in `destination`
    fn import(&self, source: &Path, destination: &Path, options: &ConversionOptions) -> Result<()> {
        let format = self.model_type();
        info!(%format, source = %source.display(), destination = %destination.display(), "importing checkpoint");

        let external_config = checkpoint::read_config(source)?;
        let config = self.import_config(&external_config)?;
        let external = checkpoint::load_state_dict(source)?;
        let internal = self.import_state_dict(&config, &external)?;
        drop(external);

        let config_value = serde_json::to_value(&config)?;
        checkpoint::save_checkpoint(destination, &config_value, &internal, options.max_shard_size)?;
        checkpoint::save_generation_config(source, destination, &config_value)?;
        if options.copy_tokenizer_files {
            checkpoint::copy_tokenizer_files(source, destination)?;
        }

        info!(%format, tensors = internal.len(), "import complete");
        Ok(())
    }

    /// Convert the internal checkpoint in `source` into this format in `destination`
    fn export(&self, source: &Path, destination: &Path, options: &ConversionOptions) -> Result<()> {
        let format = self.model_type();
        info!(%format, source = %source.display(), destination = %destination.display(), "exporting checkpoint");

        let config = DolomiteConfig::from_value(checkpoint::read_config(source)?)?;
        let external_config = self.export_config(&config)?;
        let internal = checkpoint::load_state_dict(source)?;
        let external = self.export_state_dict(&config, &internal)?;
        drop(internal);

        checkpoint::save_checkpoint(destination, &external_config, &external, options.max_shard_size)?;
        checkpoint::save_generation_config(source, destination, &external_config)?;
        if options.copy_tokenizer_files {
            checkpoint::copy_tokenizer_files(source, destination)?;
        }

        info!(%format, tensors = external.len(), "export complete");
        Ok(())
    }
}

/// Adapter importing checkpoints tagged `tag`
pub fn resolve_import(tag: &str) -> Result<&'static dyn FormatAdapter> {
    Ok(tag.parse::<ModelType>()?.adapter())
}

/// Adapter exporting to the format tagged `tag`
pub fn resolve_export(tag: &str) -> Result<&'static dyn FormatAdapter> {
    Ok(tag.parse::<ModelType>()?.adapter())
}
