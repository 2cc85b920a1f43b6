//! Resolution of checkpoint identifiers to local directories
//!
//! An identifier is either a path to a checkpoint directory or a hub
//! repository id such as `bigcode/gpt_bigcode-santacoder`.

use dolomite::{Error, Result};
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::checkpoint::{
    ShardIndex, CONFIG_FILE, GENERATION_CONFIG_FILE, SAFETENSORS_FILE, SAFETENSORS_INDEX_FILE,
    TOKENIZER_FILES,
};
use crate::options::ConversionOptions;

/// Turns an identifier into a local checkpoint directory
pub trait SourceResolver {
    /// Path of the checkpoint's `config.json`, fetching only that file if remote
    fn config_path(&self, identifier: &str) -> Result<PathBuf>;

    /// Directory holding the complete checkpoint
    fn checkpoint_dir(&self, identifier: &str) -> Result<PathBuf>;
}

/// Resolves identifiers that are local directories
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResolver;

impl SourceResolver for LocalResolver {
    fn config_path(&self, identifier: &str) -> Result<PathBuf> {
        let path = self.checkpoint_dir(identifier)?.join(CONFIG_FILE);
        if !path.is_file() {
            return Err(Error::checkpoint(format!(
                "no {CONFIG_FILE} found in {identifier}"
            )));
        }
        Ok(path)
    }

    fn checkpoint_dir(&self, identifier: &str) -> Result<PathBuf> {
        let dir = Path::new(identifier);
        if !dir.is_dir() {
            return Err(Error::checkpoint(format!(
                "checkpoint directory does not exist: {identifier}"
            )));
        }
        Ok(dir.to_path_buf())
    }
}

/// Resolves hub repository ids through the local hub cache
#[derive(Clone)]
pub struct HubResolver {
    api: Api,
    revision: Option<String>,
}

impl fmt::Debug for HubResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubResolver")
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl HubResolver {
    /// Hub client honoring the cache directory and revision in `options`
    pub fn new(options: &ConversionOptions) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = &options.hub_cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().map_err(|e| Error::hub(e.to_string()))?;
        Ok(Self {
            api,
            revision: options.hub_revision.clone(),
        })
    }

    fn repo(&self, identifier: &str) -> ApiRepo {
        let repo = match &self.revision {
            Some(revision) => {
                Repo::with_revision(identifier.to_string(), RepoType::Model, revision.clone())
            }
            None => Repo::model(identifier.to_string()),
        };
        self.api.repo(repo)
    }

    fn fetch(repo: &ApiRepo, identifier: &str, file: &str) -> Result<PathBuf> {
        repo.get(file)
            .map_err(|e| Error::hub(format!("{identifier}/{file}: {e}")))
    }
}

impl SourceResolver for HubResolver {
    fn config_path(&self, identifier: &str) -> Result<PathBuf> {
        Self::fetch(&self.repo(identifier), identifier, CONFIG_FILE)
    }

    fn checkpoint_dir(&self, identifier: &str) -> Result<PathBuf> {
        let repo = self.repo(identifier);
        let config = Self::fetch(&repo, identifier, CONFIG_FILE)?;

        match repo.get(SAFETENSORS_INDEX_FILE) {
            Ok(index_path) => {
                let index: ShardIndex =
                    serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
                let shards: BTreeSet<&String> = index.weight_map.values().collect();
                info!(identifier, shards = shards.len(), "downloading sharded weights");
                for shard in shards {
                    Self::fetch(&repo, identifier, shard)?;
                }
            }
            Err(_) => {
                info!(identifier, "downloading weights");
                Self::fetch(&repo, identifier, SAFETENSORS_FILE)?;
            }
        }

        for optional in std::iter::once(&GENERATION_CONFIG_FILE).chain(TOKENIZER_FILES) {
            if repo.get(optional).is_err() {
                debug!(identifier, file = optional, "optional file not available");
            }
        }

        config
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::hub(format!("{identifier}: cache path has no parent")))
    }
}

/// Local directories first, hub repositories otherwise
#[derive(Debug)]
pub struct DefaultResolver {
    options: ConversionOptions,
}

impl DefaultResolver {
    /// Resolver using `options` for hub access
    pub fn new(options: &ConversionOptions) -> Self {
        Self {
            options: options.clone(),
        }
    }

    fn is_local(identifier: &str) -> bool {
        Path::new(identifier).is_dir()
    }

    fn hub(&self) -> Result<HubResolver> {
        HubResolver::new(&self.options)
    }
}

impl SourceResolver for DefaultResolver {
    fn config_path(&self, identifier: &str) -> Result<PathBuf> {
        if Self::is_local(identifier) {
            LocalResolver.config_path(identifier)
        } else {
            self.hub()?.config_path(identifier)
        }
    }

    fn checkpoint_dir(&self, identifier: &str) -> Result<PathBuf> {
        if Self::is_local(identifier) {
            LocalResolver.checkpoint_dir(identifier)
        } else {
            self.hub()?.checkpoint_dir(identifier)
        }
    }
}
