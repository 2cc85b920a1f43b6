//! Conversions between checkpoint directories on disk

use super::fixtures::*;
use super::init_test_logging;
use candle_core::DType;
use dolomite::{DolomiteConfig, Result};
use dolomite_convert::checkpoint::{load_state_dict, read_config, GENERATION_CONFIG_FILE};
use dolomite_convert::{
    export_checkpoint, export_to_external, export_with_options, import_checkpoint,
    import_from_external, import_with_options, ConversionOptions, ModelType,
};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn path_str(dir: &std::path::Path) -> &str {
    dir.to_str().expect("temp paths are valid UTF-8")
}

#[test]
fn test_llama_directory_round_trip() -> Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let hf = root.path().join("llama-hf");
    let internal_dir = root.path().join("llama-dolomite");
    let exported = root.path().join("llama-exported");

    let config = llama_config(Dims::new(4, 2, 2), false);
    let weights = random_state_dict(&config, DType::BF16)?;
    write_external_checkpoint(&hf, ModelType::Llama.adapter(), &config, &weights, u64::MAX)?;
    write_auxiliary_files(&hf)?;

    import_from_external(path_str(&hf), &internal_dir)?;

    let imported_config = read_config(&internal_dir)?;
    assert_eq!(imported_config["model_type"], "gpt_dolomite");
    assert_eq!(imported_config["attention_head_type"], "gqa");
    assert_eq!(DolomiteConfig::from_value(imported_config)?, config);
    assert_state_dicts_equal(&weights, &load_state_dict(&internal_dir)?);
    assert_eq!(
        fs::read(internal_dir.join("tokenizer.json"))?,
        fs::read(hf.join("tokenizer.json"))?
    );
    assert!(internal_dir.join("special_tokens_map.json").is_file());
    assert!(internal_dir.join(GENERATION_CONFIG_FILE).is_file());

    export_to_external(&internal_dir, &exported, "llama")?;
    assert_state_dicts_equal(&load_state_dict(&hf)?, &load_state_dict(&exported)?);
    assert_eq!(read_config(&exported)?, read_config(&hf)?);
    assert!(exported.join("tokenizer.json").is_file());
    Ok(())
}

#[test]
fn test_bigcode_gqa_directory_round_trip() -> Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let internal_dir = root.path().join("internal");
    let hf = root.path().join("bigcode");
    let reimported = root.path().join("reimported");

    let config = bigcode_config(Dims::new(8, 2, 2));
    let weights = random_state_dict(&config, DType::F32)?;
    dolomite_convert::checkpoint::save_checkpoint(
        &internal_dir,
        &serde_json::to_value(&config)?,
        &weights,
        u64::MAX,
    )?;

    export_checkpoint(&internal_dir, &hf, "gpt_bigcode")?;
    let exported_config = read_config(&hf)?;
    assert_eq!(exported_config["multi_query"], json!(false));
    assert_eq!(exported_config["num_key_value_heads"], json!(2));
    assert_eq!(exported_config["architectures"], json!(["GPTBigCodeForCausalLM"]));

    import_checkpoint(&hf, &reimported)?;
    assert_eq!(DolomiteConfig::from_value(read_config(&reimported)?)?, config);
    assert_state_dicts_equal(&weights, &load_state_dict(&reimported)?);
    Ok(())
}

#[test]
fn test_granite_export_writes_generation_config_from_token_ids() -> Result<()> {
    let root = TempDir::new()?;
    let internal_dir = root.path().join("internal");
    let hf = root.path().join("granite");

    let config = granite_config(Dims::new(4, 4, 2));
    let weights = random_state_dict(&config, DType::F32)?;
    dolomite_convert::checkpoint::save_checkpoint(
        &internal_dir,
        &serde_json::to_value(&config)?,
        &weights,
        u64::MAX,
    )?;

    export_to_external(&internal_dir, &hf, "granite")?;
    let exported = read_config(&hf)?;
    assert_eq!(exported["embedding_multiplier"], json!(12.0));
    assert_eq!(exported["logits_scaling"], json!(8.0));

    let generation: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(hf.join(GENERATION_CONFIG_FILE))?)?;
    assert_eq!(generation, json!({"bos_token_id": 0, "eos_token_id": 1}));
    Ok(())
}

#[test]
fn test_sharded_source_and_destination() -> Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let hf = root.path().join("sharded-hf");
    let internal_dir = root.path().join("internal");

    let config = llama_config(Dims::new(4, 4, 4), true);
    let weights = random_state_dict(&config, DType::F32)?;
    write_external_checkpoint(&hf, ModelType::Llama.adapter(), &config, &weights, 1024)?;
    assert!(is_sharded(&hf));

    let options = ConversionOptions {
        max_shard_size: 2048,
        copy_tokenizer_files: false,
        ..Default::default()
    };
    import_with_options(path_str(&hf), &internal_dir, &options)?;
    assert!(is_sharded(&internal_dir));
    assert_state_dicts_equal(&weights, &load_state_dict(&internal_dir)?);

    let unsharded = root.path().join("unsharded");
    export_with_options(&internal_dir, &unsharded, "llama", &ConversionOptions::default())?;
    assert!(!is_sharded(&unsharded));
    assert_state_dicts_equal(&load_state_dict(&hf)?, &load_state_dict(&unsharded)?);
    Ok(())
}
