use pretty_assertions::assert_eq;
use std::path::PathBuf;
use tch::{nn, Device, Kind, Tensor};
use xgpt_modeling::{merge_lora_into_variables, MergeLoraError};

fn q_proj(vs: &nn::VarStore) -> Tensor {
    let path = &vs.root() / "model" / "layers" / 0 / "self_attn" / "q_proj";
    path.zeros("weight", &[2, 3])
}

fn write_adapter(dir: &tempfile::TempDir, config: &str, a: &Tensor, b: &Tensor) -> Vec<PathBuf> {
    let config_path = dir.path().join("adapter_config.json");
    std::fs::write(&config_path, config).unwrap();
    let weights_path = dir.path().join("adapter_model.safetensors");
    Tensor::write_safetensors(
        &[
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
                a,
            ),
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
                b,
            ),
        ],
        &weights_path,
        &None,
    )
    .unwrap();
    vec![config_path, weights_path]
}

#[test]
fn merges_scaled_delta_into_weight() {
    let vs = nn::VarStore::new(Device::Cpu);
    let weight = q_proj(&vs);
    let dir = tempfile::tempdir().unwrap();
    // rank 1: A is (1, in), B is (out, 1)
    let a = Tensor::from_slice(&[1f32, 2., 3.]).reshape([1, 3]);
    let b = Tensor::from_slice(&[1f32, -1.]).reshape([2, 1]);
    let files = write_adapter(
        &dir,
        r#"{"peft_type": "LORA", "r": 1, "lora_alpha": 2}"#,
        &a,
        &b,
    );

    let merged = merge_lora_into_variables(&vs, &files).unwrap();
    assert_eq!(merged, 1);

    let weight: Vec<f32> = weight.detach().reshape([-1]).try_into().unwrap();
    assert_eq!(weight, vec![2., 4., 6., -2., -4., -6.]);
}

#[test]
fn adapter_for_unknown_module_is_rejected() {
    let vs = nn::VarStore::new(Device::Cpu);
    let _weight = q_proj(&vs);
    let dir = tempfile::tempdir().unwrap();
    let files = dir.path().join("adapter_model.safetensors");
    let a = Tensor::ones([1, 3], (Kind::Float, Device::Cpu));
    let b = Tensor::ones([2, 1], (Kind::Float, Device::Cpu));
    Tensor::write_safetensors(
        &[
            ("base_model.model.model.layers.9.mlp.up_proj.lora_A.weight", &a),
            ("base_model.model.model.layers.9.mlp.up_proj.lora_B.weight", &b),
        ],
        &files,
        &None,
    )
    .unwrap();
    let config = dir.path().join("adapter_config.json");
    std::fs::write(&config, r#"{"r": 1, "lora_alpha": 1}"#).unwrap();

    let err = merge_lora_into_variables(&vs, &[config, files]).unwrap_err();
    assert!(
        matches!(err, MergeLoraError::UnknownModule(ref name) if name == "model.layers.9.mlp.up_proj"),
        "{err}"
    );
}

#[test]
fn missing_adapter_config_is_rejected() {
    let vs = nn::VarStore::new(Device::Cpu);
    let _weight = q_proj(&vs);
    let err = merge_lora_into_variables(&vs, &[]).unwrap_err();
    assert!(matches!(err, MergeLoraError::MissingConfigJSON));
}
