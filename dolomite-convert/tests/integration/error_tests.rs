//! Error conditions: unsupported formats, missing configuration and
//! inconsistent tensors

use super::fixtures::*;
use super::init_test_logging;
use candle_core::{DType, Device, Tensor};
use dolomite::{Error, Result};
use dolomite_convert::checkpoint::save_checkpoint;
use dolomite_convert::{export_to_external, import_from_external, ModelType, StateDict};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_unsupported_import_writes_nothing() -> Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let source = root.path().join("mistral");
    let destination = root.path().join("out");

    let mut weights = StateDict::new();
    weights.insert(
        "model.embed_tokens.weight".to_string(),
        Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?,
    );
    write_raw_checkpoint(&source, &json!({"model_type": "mistral", "vocab_size": 4}), &weights)?;

    let err = import_from_external(source.to_str().unwrap(), &destination).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(ref tag) if tag == "mistral"));
    assert_eq!(
        err.to_string(),
        "Unsupported format: the model_type `mistral` is not yet supported"
    );
    assert!(!destination.exists());
    Ok(())
}

#[test]
fn test_unsupported_export_writes_nothing() -> Result<()> {
    let root = TempDir::new()?;
    let destination = root.path().join("out");
    // the tag is checked before the source is read
    let err = export_to_external(root.path().join("missing"), &destination, "t5").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(ref tag) if tag == "t5"));
    assert!(!destination.exists());
    Ok(())
}

#[test]
fn test_missing_model_type() -> Result<()> {
    let root = TempDir::new()?;
    let source = root.path().join("untyped");
    write_raw_checkpoint(&source, &json!({"vocab_size": 4}), &StateDict::new())?;
    let err = import_from_external(source.to_str().unwrap(), root.path().join("out")).unwrap_err();
    assert!(matches!(err, Error::MissingConfiguration(ref f) if f == "model_type"));
    Ok(())
}

#[test]
fn test_missing_tensor_is_named() -> Result<()> {
    let config = llama_config(Dims::new(4, 2, 2), false);
    let adapter = ModelType::Llama.adapter();
    let mut external = adapter.export_state_dict(&config, &random_state_dict(&config, DType::F32)?)?;
    external.remove("model.layers.1.self_attn.v_proj.weight");

    let err = adapter.import_state_dict(&config, &external).unwrap_err();
    assert!(matches!(
        err,
        Error::MissingTensor(ref name) if name == "model.layers.1.self_attn.v_proj.weight"
    ));
    Ok(())
}

#[test]
fn test_shape_disagreeing_with_config() -> Result<()> {
    let config = llama_config(Dims::new(4, 2, 2), false);
    let adapter = ModelType::Llama.adapter();
    let mut external = adapter.export_state_dict(&config, &random_state_dict(&config, DType::F32)?)?;
    external.insert(
        "model.layers.0.mlp.down_proj.weight".to_string(),
        Tensor::zeros((8, 6), DType::F32, &Device::Cpu)?,
    );

    let err = adapter.import_state_dict(&config, &external).unwrap_err();
    match err {
        Error::ShapeMismatch {
            name,
            expected,
            actual,
        } => {
            assert_eq!(name, "model.layers.0.mlp.down_proj.weight");
            assert_eq!(expected, vec![8, 5]);
            assert_eq!(actual, vec![8, 6]);
        }
        other => panic!("expected ShapeMismatch, got {other}"),
    }
    Ok(())
}

#[test]
fn test_diverging_repeated_heads_are_rejected_on_import() -> Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let hf = root.path().join("bigcode");

    let config = bigcode_config(Dims::new(4, 2, 2));
    let adapter = ModelType::GptBigCode.adapter();
    let mut external = adapter.export_state_dict(&config, &random_state_dict(&config, DType::F32)?)?;

    // multi-head layout: per head [q, k, v] of 2 rows each; overwrite the
    // key of head 3, the second copy of group 1
    let name = "transformer.h.1.attn.c_attn.weight";
    let fused = &external[name];
    let perturbed = Tensor::cat(
        &[
            fused.narrow(0, 0, 20)?,
            Tensor::ones((2, 8), DType::F32, &Device::Cpu)?,
            fused.narrow(0, 22, 2)?,
        ],
        0,
    )?;
    external.insert(name.to_string(), perturbed);
    save_checkpoint(&hf, &adapter.export_config(&config)?, &external, u64::MAX)?;

    let err = import_from_external(hf.to_str().unwrap(), root.path().join("out")).unwrap_err();
    assert!(matches!(
        err,
        Error::HeadGroupMismatch { ref name, group: 1 } if name == "transformer.h.1.attn.c_attn.weight"
    ));
    Ok(())
}

#[test]
fn test_incompatible_export_is_reported_before_writing() -> Result<()> {
    let root = TempDir::new()?;
    let internal_dir = root.path().join("internal");
    let destination = root.path().join("bigcode");

    let config = llama_config(Dims::new(4, 4, 2), false);
    save_checkpoint(
        &internal_dir,
        &serde_json::to_value(&config)?,
        &random_state_dict(&config, DType::F32)?,
        u64::MAX,
    )?;

    let err = export_to_external(&internal_dir, &destination, "gpt_bigcode").unwrap_err();
    assert!(matches!(
        err,
        Error::IncompatibleConfiguration { ref format, .. } if format == "gpt_bigcode"
    ));
    assert!(!destination.exists());
    Ok(())
}
