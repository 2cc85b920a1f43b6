//! In-memory conversions: export followed by import restores the internal
//! checkpoint exactly, for every format and head layout.

use super::fixtures::*;
use super::init_test_logging;
use candle_core::DType;
use dolomite::{AttentionGeometry, DolomiteConfig, Result};
use dolomite_convert::attention::split_query_key_value;
use dolomite_convert::tensor::bitwise_equal;
use dolomite_convert::ModelType;
use proptest::prelude::*;

fn assert_round_trip(model_type: ModelType, config: &DolomiteConfig, dtype: DType) -> Result<()> {
    let adapter = model_type.adapter();
    let internal = random_state_dict(config, dtype)?;

    let external_config = adapter.export_config(config)?;
    let external = adapter.export_state_dict(config, &internal)?;
    assert_eq!(external_config["model_type"], model_type.as_str());

    let imported_config = adapter.import_config(&external_config)?;
    assert_eq!(&imported_config, config, "{model_type} config changed");
    let imported = adapter.import_state_dict(&imported_config, &external)?;
    assert_state_dicts_equal(&internal, &imported);
    Ok(())
}

#[test]
fn test_bigcode_round_trip_for_every_head_type() -> Result<()> {
    init_test_logging();
    for dims in [Dims::new(4, 4, 2), Dims::new(4, 1, 2), Dims::new(4, 2, 2)] {
        assert_round_trip(ModelType::GptBigCode, &bigcode_config(dims), DType::F32)?;
    }
    Ok(())
}

#[test]
fn test_llama_round_trip_with_and_without_bias() -> Result<()> {
    init_test_logging();
    for add_bias in [false, true] {
        for dims in [Dims::new(4, 4, 2), Dims::new(4, 1, 2), Dims::new(6, 2, 3)] {
            assert_round_trip(ModelType::Llama, &llama_config(dims, add_bias), DType::BF16)?;
        }
    }
    Ok(())
}

#[test]
fn test_granite_round_trip_keeps_multipliers() -> Result<()> {
    init_test_logging();
    assert_round_trip(ModelType::Granite, &granite_config(Dims::new(8, 2, 2)), DType::F16)
}

#[test]
fn test_llama_export_names() -> Result<()> {
    let config = llama_config(Dims::new(4, 2, 2), false);
    let internal = random_state_dict(&config, DType::F32)?;
    let external = ModelType::Llama.adapter().export_state_dict(&config, &internal)?;

    let mut names: Vec<&str> = external
        .keys()
        .map(String::as_str)
        .filter(|n| !n.starts_with("model.layers.1."))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "lm_head.weight",
            "model.embed_tokens.weight",
            "model.layers.0.input_layernorm.weight",
            "model.layers.0.mlp.down_proj.weight",
            "model.layers.0.mlp.gate_proj.weight",
            "model.layers.0.mlp.up_proj.weight",
            "model.layers.0.post_attention_layernorm.weight",
            "model.layers.0.self_attn.k_proj.weight",
            "model.layers.0.self_attn.o_proj.weight",
            "model.layers.0.self_attn.q_proj.weight",
            "model.layers.0.self_attn.v_proj.weight",
            "model.norm.weight",
        ]
    );
    assert_eq!(external["model.layers.0.self_attn.q_proj.weight"].dims(), &[8, 8]);
    assert_eq!(external["model.layers.0.self_attn.k_proj.weight"].dims(), &[4, 8]);
    assert_eq!(external["model.layers.0.mlp.gate_proj.weight"].dims(), &[5, 8]);
    Ok(())
}

#[test]
fn test_gqa_export_to_bigcode_repeats_heads_in_group_order() -> Result<()> {
    // 8 query heads sharing 2 key/value heads
    let dims = Dims::new(8, 2, 2);
    let config = bigcode_config(dims);
    let geometry = config.attention_geometry()?;
    let internal = random_state_dict(&config, DType::F32)?;
    let external = ModelType::GptBigCode.adapter().export_state_dict(&config, &internal)?;

    let name = "transformer.h.0.attn.c_attn.weight";
    assert_eq!(external[name].dims(), &[8 * 2 * 3, 16]);

    let (_, k, v) = split_query_key_value(&internal[name], &geometry, name)?;
    let multi_head = AttentionGeometry::new(8, 8, 2)?;
    let (_, k_mha, v_mha) = split_query_key_value(&external[name], &multi_head, name)?;

    for head in 0..8 {
        let group = head / 4;
        let k_head = k_mha.narrow(0, head * 2, 2)?;
        let v_head = v_mha.narrow(0, head * 2, 2)?;
        assert!(bitwise_equal(&k_head, &k.narrow(0, group * 2, 2)?)?, "k head {head}");
        assert!(bitwise_equal(&v_head, &v.narrow(0, group * 2, 2)?)?, "v head {head}");
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_llama_layout_round_trips(
        kv_heads in 1usize..4,
        group in 1usize..4,
        head_dim in 1usize..4,
        n_layer in 1usize..3,
        add_bias in any::<bool>(),
        tie in any::<bool>(),
    ) {
        let dims = Dims { n_head: kv_heads * group, kv_heads, head_dim, n_layer };
        let config = DolomiteConfig {
            tie_word_embeddings: tie,
            ..llama_config(dims, add_bias)
        };
        assert_round_trip(ModelType::Llama, &config, DType::F32).unwrap();
    }

    #[test]
    fn prop_bigcode_layout_round_trips(
        kv_heads in 1usize..4,
        group in 1usize..4,
        head_dim in 1usize..4,
    ) {
        let dims = Dims::new(kv_heads * group, kv_heads, head_dim);
        assert_round_trip(ModelType::GptBigCode, &bigcode_config(dims), DType::F32).unwrap();
    }
}
