//! Conversion options
//!
//! Options come from defaults, an optional TOML or JSON file, and
//! `DOLOMITE_*` environment variables, in increasing priority.

use dolomite::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable prefix for option overrides
pub const ENV_PREFIX: &str = "DOLOMITE";

/// Default largest shard written, matching HuggingFace's `5GB`
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 5_000_000_000;

/// Options shared by import and export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// Largest safetensors file in bytes; accepts sizes such as `"2GB"`
    #[serde(deserialize_with = "deserialize_size")]
    pub max_shard_size: u64,
    /// Copy tokenizer files alongside the converted weights
    pub copy_tokenizer_files: bool,
    /// Cache directory for hub downloads
    pub hub_cache_dir: Option<PathBuf>,
    /// Hub revision (branch, tag or commit) to resolve remote sources at
    pub hub_revision: Option<String>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            copy_tokenizer_files: true,
            hub_cache_dir: None,
            hub_revision: None,
        }
    }
}

impl ConversionOptions {
    /// Load options from a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let options: Self = if path.extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("{}: {e}", path.display())))?
        } else {
            serde_json::from_str(&content)?
        };
        options.validate()?;
        Ok(options)
    }

    /// Defaults overridden by `DOLOMITE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Defaults overridden by `{prefix}_*` environment variables
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let options: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate options
    pub fn validate(&self) -> Result<()> {
        if self.max_shard_size == 0 {
            return Err(Error::config("max_shard_size must be greater than zero"));
        }
        Ok(())
    }
}

/// Parse a byte size such as `5000`, `"500MB"` or `"2GiB"`
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::config(format!("invalid size `{text}`")))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        _ => return Err(Error::config(format!("invalid size unit in `{text}`"))),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::config(format!("size `{text}` overflows")))
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}
