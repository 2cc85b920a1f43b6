//! Checkpoint directory store
//!
//! A checkpoint is a directory holding `config.json`, safetensors weights
//! (either `model.safetensors` or numbered shards plus
//! `model.safetensors.index.json`), an optional `generation_config.json`
//! and tokenizer files.

use dolomite::{Error, Result};
use memmap2::Mmap;
use safetensors::tensor::View;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::tensor::{tensor_bytes, tensor_from_bytes, to_safetensors_dtype, StateDict};

/// Model configuration file
pub const CONFIG_FILE: &str = "config.json";
/// Generation defaults file
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";
/// Single-file weights
pub const SAFETENSORS_FILE: &str = "model.safetensors";
/// Shard index for multi-file weights
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Tokenizer artifacts copied verbatim between checkpoints
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "added_tokens.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
];

/// `model.safetensors.index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardIndex {
    /// Index metadata
    pub metadata: ShardIndexMetadata,
    /// Tensor name to shard file name
    pub weight_map: BTreeMap<String, String>,
}

/// Metadata block of a [`ShardIndex`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardIndexMetadata {
    /// Sum of all tensor byte sizes
    pub total_size: u64,
}

/// Owned tensor bytes handed to the safetensors serializer
struct SerializedTensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for &SerializedTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Name of shard `index` (zero based) out of `count`
pub fn shard_file_name(index: usize, count: usize) -> String {
    format!("model-{:05}-of-{:05}.safetensors", index + 1, count)
}

/// Read `config.json` from a checkpoint directory
pub fn read_config(dir: &Path) -> Result<Value> {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Err(Error::checkpoint(format!(
            "no {CONFIG_FILE} found in {}",
            dir.display()
        )));
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a JSON document into `dir/file_name`
pub fn write_json(dir: &Path, file_name: &str, value: &Value) -> Result<()> {
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    fs::write(dir.join(file_name), content)?;
    Ok(())
}

/// Load every tensor of a checkpoint into memory
pub fn load_state_dict(dir: &Path) -> Result<StateDict> {
    let single = dir.join(SAFETENSORS_FILE);
    let index_path = dir.join(SAFETENSORS_INDEX_FILE);

    let state_dict = if single.is_file() {
        load_safetensors_file(&single)?
    } else if index_path.is_file() {
        let index: ShardIndex = serde_json::from_str(&fs::read_to_string(&index_path)?)?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        let mut state_dict = StateDict::with_capacity(index.weight_map.len());
        for shard in shards {
            state_dict.extend(load_safetensors_file(&dir.join(shard))?);
        }
        if let Some(missing) = index.weight_map.keys().find(|k| !state_dict.contains_key(*k)) {
            return Err(Error::checkpoint(format!(
                "tensor `{missing}` is listed in {SAFETENSORS_INDEX_FILE} but absent from its shard"
            )));
        }
        state_dict
    } else {
        return Err(Error::checkpoint(format!(
            "no {SAFETENSORS_FILE} or {SAFETENSORS_INDEX_FILE} found in {}",
            dir.display()
        )));
    };

    info!(tensors = state_dict.len(), dir = %dir.display(), "loaded state dict");
    Ok(state_dict)
}

/// Load one safetensors file through a memory map
pub fn load_safetensors_file(path: &Path) -> Result<StateDict> {
    let file = File::open(path)?;
    // SAFETY: the file is opened read-only and not modified while mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| Error::checkpoint(format!("{}: {e}", path.display())))?;

    let mut state_dict = StateDict::with_capacity(tensors.len());
    for (name, view) in tensors.tensors() {
        let tensor = tensor_from_bytes(view.data(), view.dtype(), view.shape())?;
        state_dict.insert(name, tensor);
    }
    debug!(path = %path.display(), tensors = state_dict.len(), "read safetensors file");
    Ok(state_dict)
}

/// Whether `file_name` is a weight file written by [`save_state_dict`]
fn is_weight_file(file_name: &str) -> bool {
    if file_name == SAFETENSORS_FILE || file_name == SAFETENSORS_INDEX_FILE {
        return true;
    }
    file_name
        .strip_prefix("model-")
        .and_then(|rest| rest.strip_suffix(".safetensors"))
        .and_then(|rest| rest.split_once("-of-"))
        .map_or(false, |(index, count)| {
            !index.is_empty()
                && !count.is_empty()
                && index.chars().chain(count.chars()).all(|c| c.is_ascii_digit())
        })
}

/// Delete weight files left in `dir` by an earlier save, so they cannot
/// shadow the files about to be written
fn remove_weight_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if is_weight_file(name) && entry.file_type()?.is_file() {
            debug!(file = name, "removing stale weight file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Greedily pack tensors, in name order, into shards of at most
/// `max_shard_size` bytes. A tensor larger than the limit gets its own shard.
fn plan_shards<'a>(sizes: &[(&'a str, u64)], max_shard_size: u64) -> Vec<Vec<&'a str>> {
    let mut shards: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_size = 0u64;
    for &(name, size) in sizes {
        if !current.is_empty() && current_size + size > max_shard_size {
            shards.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(name);
        current_size += size;
    }
    if !current.is_empty() || shards.is_empty() {
        shards.push(current);
    }
    shards
}

/// Write a state dict as safetensors, sharding above `max_shard_size` bytes.
///
/// Returns the written weight files. Every file carries the
/// `{"format": "pt"}` metadata expected by HuggingFace loaders.
pub fn save_state_dict(dir: &Path, state_dict: &StateDict, max_shard_size: u64) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    remove_weight_files(dir)?;

    let mut names: Vec<&String> = state_dict.keys().collect();
    names.sort();

    let mut serialized: HashMap<&str, SerializedTensor> = HashMap::with_capacity(names.len());
    let mut sizes = Vec::with_capacity(names.len());
    for name in names {
        let tensor = &state_dict[name];
        let entry = SerializedTensor {
            dtype: to_safetensors_dtype(tensor.dtype())?,
            shape: tensor.dims().to_vec(),
            data: tensor_bytes(tensor)?,
        };
        sizes.push((name.as_str(), entry.data.len() as u64));
        serialized.insert(name.as_str(), entry);
    }
    let total_size: u64 = sizes.iter().map(|(_, size)| size).sum();

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    let shards = plan_shards(&sizes, max_shard_size);
    let count = shards.len();

    let mut written = Vec::with_capacity(count);
    let mut weight_map = BTreeMap::new();
    for (i, shard) in shards.iter().enumerate() {
        let file_name = if count == 1 {
            SAFETENSORS_FILE.to_string()
        } else {
            shard_file_name(i, count)
        };
        let entries = shard.iter().map(|name| (*name, &serialized[name]));
        let path = dir.join(&file_name);
        safetensors::serialize_to_file(entries, &metadata, &path)
            .map_err(|e| Error::checkpoint(format!("{}: {e}", path.display())))?;
        for name in shard {
            weight_map.insert(name.to_string(), file_name.clone());
        }
        written.push(path);
    }

    if count > 1 {
        let index = ShardIndex {
            metadata: ShardIndexMetadata { total_size },
            weight_map,
        };
        write_json(dir, SAFETENSORS_INDEX_FILE, &serde_json::to_value(&index)?)?;
    }

    info!(
        tensors = state_dict.len(),
        shards = count,
        total_size,
        dir = %dir.display(),
        "saved state dict"
    );
    Ok(written)
}

/// Write a complete checkpoint: configuration and weights
pub fn save_checkpoint(
    dir: &Path,
    config: &Value,
    state_dict: &StateDict,
    max_shard_size: u64,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_json(dir, CONFIG_FILE, config)?;
    save_state_dict(dir, state_dict, max_shard_size)?;
    Ok(())
}

/// Carry generation defaults over to the destination.
///
/// An existing `generation_config.json` is copied as is; otherwise one is
/// derived from the special token ids of the model configuration.
pub fn save_generation_config(source: &Path, destination: &Path, model_config: &Value) -> Result<()> {
    let existing = source.join(GENERATION_CONFIG_FILE);
    if existing.is_file() {
        fs::copy(&existing, destination.join(GENERATION_CONFIG_FILE))?;
        return Ok(());
    }

    let mut generation = serde_json::Map::new();
    for key in ["bos_token_id", "eos_token_id", "pad_token_id"] {
        if let Some(id) = model_config.get(key).filter(|v| !v.is_null()) {
            generation.insert(key.to_string(), id.clone());
        }
    }
    if generation.is_empty() {
        return Ok(());
    }
    write_json(destination, GENERATION_CONFIG_FILE, &Value::Object(generation))
}

/// Copy the tokenizer files present in `source`; returns how many were copied
pub fn copy_tokenizer_files(source: &Path, destination: &Path) -> Result<usize> {
    let mut copied = 0;
    for name in TOKENIZER_FILES {
        let from = source.join(name);
        if from.is_file() {
            fs::copy(&from, destination.join(name))?;
            copied += 1;
        }
    }
    debug!(copied, "copied tokenizer files");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::bitwise_equal;
    use candle_core::{DType, Device, Tensor};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state_dict() -> StateDict {
        let mut dict = StateDict::new();
        for (i, name) in ["a.weight", "b.weight", "c.bias", "d.weight"].iter().enumerate() {
            let t = Tensor::arange(0f32, 16.0, &Device::Cpu)
                .unwrap()
                .affine(1.0, i as f64)
                .unwrap()
                .reshape((4, 4))
                .unwrap();
            dict.insert(name.to_string(), t);
        }
        dict.insert(
            "e.half".to_string(),
            Tensor::ones(3, DType::BF16, &Device::Cpu).unwrap(),
        );
        dict
    }

    #[test]
    fn test_resave_replaces_previous_weight_files() {
        let dir = TempDir::new().unwrap();
        let mut zeros = StateDict::new();
        let mut ones = StateDict::new();
        for name in ["a.weight", "b.weight", "c.weight"] {
            zeros.insert(name.to_string(), Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap());
            ones.insert(name.to_string(), Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap());
        }
        fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();

        save_state_dict(dir.path(), &zeros, u64::MAX).unwrap();
        save_state_dict(dir.path(), &ones, 64).unwrap();
        assert!(!dir.path().join(SAFETENSORS_FILE).exists());
        assert!(dir.path().join(SAFETENSORS_INDEX_FILE).is_file());
        assert_same(&ones, &load_state_dict(dir.path()).unwrap());

        save_state_dict(dir.path(), &zeros, u64::MAX).unwrap();
        assert!(!dir.path().join(SAFETENSORS_INDEX_FILE).exists());
        assert!(!dir.path().join(shard_file_name(0, 3)).exists());
        assert_same(&zeros, &load_state_dict(dir.path()).unwrap());
        assert!(dir.path().join("tokenizer.json").is_file());
    }

    #[test]
    fn test_weight_file_names() {
        assert!(is_weight_file("model.safetensors"));
        assert!(is_weight_file("model.safetensors.index.json"));
        assert!(is_weight_file(&shard_file_name(2, 7)));
        assert!(!is_weight_file("model-final.safetensors"));
        assert!(!is_weight_file("tokenizer.json"));
        assert!(!is_weight_file("config.json"));
    }

    fn assert_same(a: &StateDict, b: &StateDict) {
        assert_eq!(a.len(), b.len());
        for (name, tensor) in a {
            assert!(bitwise_equal(tensor, &b[name]).unwrap(), "{name} differs");
        }
    }

    #[test]
    fn test_single_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let dict = sample_state_dict();
        let files = save_state_dict(dir.path(), &dict, u64::MAX).unwrap();
        assert_eq!(files, vec![dir.path().join(SAFETENSORS_FILE)]);
        assert!(!dir.path().join(SAFETENSORS_INDEX_FILE).exists());
        assert_same(&dict, &load_state_dict(dir.path()).unwrap());
    }

    #[test]
    fn test_sharded_round_trip_writes_index() {
        let dir = TempDir::new().unwrap();
        let dict = sample_state_dict();
        // each f32 tensor is 64 bytes, so two fit in one shard
        let files = save_state_dict(dir.path(), &dict, 128).unwrap();
        assert_eq!(files.len(), 3);
        assert!(dir.path().join("model-00001-of-00003.safetensors").is_file());

        let index: ShardIndex = serde_json::from_str(
            &fs::read_to_string(dir.path().join(SAFETENSORS_INDEX_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(index.metadata.total_size, 4 * 64 + 6);
        assert_eq!(index.weight_map["a.weight"], "model-00001-of-00003.safetensors");
        assert_eq!(index.weight_map["e.half"], "model-00003-of-00003.safetensors");

        assert_same(&dict, &load_state_dict(dir.path()).unwrap());
    }

    #[test]
    fn test_files_carry_pt_format_metadata() {
        let dir = TempDir::new().unwrap();
        save_state_dict(dir.path(), &sample_state_dict(), u64::MAX).unwrap();
        let bytes = fs::read(dir.path().join(SAFETENSORS_FILE)).unwrap();
        let (_, metadata) = SafeTensors::read_metadata(&bytes).unwrap();
        let extra = metadata.metadata().as_ref().unwrap();
        assert_eq!(extra.get("format").map(String::as_str), Some("pt"));
    }

    #[test]
    fn test_oversized_tensor_gets_its_own_shard() {
        let sizes = [("a", 10), ("b", 100), ("c", 10), ("d", 10)];
        let shards = plan_shards(&sizes, 50);
        assert_eq!(shards, vec![vec!["a"], vec!["b"], vec!["c", "d"]]);
    }

    #[test]
    fn test_missing_weights_are_reported() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_state_dict(dir.path()),
            Err(Error::Checkpoint(_))
        ));
        assert!(matches!(read_config(dir.path()), Err(Error::Checkpoint(_))));
    }

    #[test]
    fn test_generation_config_is_derived_from_token_ids() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let config = json!({"bos_token_id": 1, "eos_token_id": [2, 3], "pad_token_id": null});
        save_generation_config(source.path(), dest.path(), &config).unwrap();
        let written: Value = serde_json::from_str(
            &fs::read_to_string(dest.path().join(GENERATION_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written, json!({"bos_token_id": 1, "eos_token_id": [2, 3]}));
    }

    #[test]
    fn test_tokenizer_files_are_copied_verbatim() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("tokenizer.json"), b"{\"model\": {}}").unwrap();
        fs::write(source.path().join("merges.txt"), b"a b\n").unwrap();
        assert_eq!(copy_tokenizer_files(source.path(), dest.path()).unwrap(), 2);
        assert_eq!(fs::read(dest.path().join("merges.txt")).unwrap(), b"a b\n");
    }
}
