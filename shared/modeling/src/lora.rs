use crate::safetensor_utils::{read_safetensors, LoadSafetensorsError};
use std::{collections::BTreeMap, io, path::PathBuf};
use tch::{nn::VarStore, Kind, Tensor};
use thiserror::Error;
use tracing::debug;

const ADAPTER_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub peft_type: Option<String>,
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        match self.use_rslora {
            true => self.lora_alpha / (self.r as f64).sqrt(),
            false => self.lora_alpha / self.r as f64,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeLoraError {
    #[error("missing adapter_config.json")]
    MissingConfigJSON,

    #[error("failed to read file adapter_config.json")]
    FailedToReadConfig(#[from] io::Error),

    #[error("could not parse adapter_config.json")]
    FailedToParseConfig(#[from] serde_json::Error),

    #[error("adapter type {0} is not LORA")]
    NotLora(String),

    #[error("adapter rank must be positive")]
    ZeroRank,

    #[error("Failed to load adapter weights: {0}")]
    LoadSafetensors(#[from] LoadSafetensorsError),

    #[error("failed to perform tensor operation: {0}")]
    TchError(#[from] tch::TchError),

    #[error("adapter has no lora weights")]
    NoAdapterWeights,

    #[error("adapter module {0} is missing its lora_{1} weight")]
    IncompletePair(String, &'static str),

    #[error("adapter module {0} does not match any model weight")]
    UnknownModule(String),

    #[error("adapter delta for {name} has shape {delta:?}, model weight has {weight:?}")]
    ShapeMismatch {
        name: String,
        delta: Vec<i64>,
        weight: Vec<i64>,
    },
}

#[derive(Default)]
struct LoraPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

pub fn load_lora_config(adapter_files: &[PathBuf]) -> Result<LoraConfig, MergeLoraError> {
    let config_file = std::fs::read_to_string(
        adapter_files
            .iter()
            .find(|x| x.ends_with("adapter_config.json"))
            .ok_or(MergeLoraError::MissingConfigJSON)?
            .as_path(),
    )?;
    let config: LoraConfig = serde_json::from_str(&config_file)?;
    if let Some(peft_type) = &config.peft_type {
        if !peft_type.eq_ignore_ascii_case("lora") {
            return Err(MergeLoraError::NotLora(peft_type.clone()));
        }
    }
    if config.r == 0 {
        return Err(MergeLoraError::ZeroRank);
    }
    Ok(config)
}

/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight` ->
/// (`model.layers.0.self_attn.q_proj`, `A`)
fn split_adapter_name(name: &str) -> Option<(&str, &'static str)> {
    let name = name.strip_prefix(ADAPTER_PREFIX).unwrap_or(name);
    let name = name.strip_suffix(".weight")?;
    // older peft versions keep the adapter name, e.g. `lora_A.default`
    let name = name.strip_suffix(".default").unwrap_or(name);
    if let Some(module) = name.strip_suffix(".lora_A") {
        Some((module, "A"))
    } else {
        name.strip_suffix(".lora_B").map(|module| (module, "B"))
    }
}

/// Folds a PEFT LoRA adapter into the model weights in place:
/// `W += (B @ A) * scaling` for every adapted linear layer.
/// Returns the number of merged layers.
pub fn merge_lora_into_variables(
    vs: &VarStore,
    adapter_files: &[PathBuf],
) -> Result<usize, MergeLoraError> {
    let config = load_lora_config(adapter_files)?;
    let scaling = config.scaling();

    let mut pairs: BTreeMap<String, LoraPair> = BTreeMap::new();
    for (name, tensor) in read_safetensors(adapter_files)? {
        match split_adapter_name(&name) {
            Some((module, "A")) => pairs.entry(module.to_owned()).or_default().a = Some(tensor),
            Some((module, _)) => pairs.entry(module.to_owned()).or_default().b = Some(tensor),
            None => debug!("Skipping non-lora adapter tensor {name}"),
        }
    }
    if pairs.is_empty() {
        return Err(MergeLoraError::NoAdapterWeights);
    }

    let _no_grad = tch::no_grad_guard();
    let mut variables = vs.variables();
    for (module, pair) in &pairs {
        let a = pair
            .a
            .as_ref()
            .ok_or_else(|| MergeLoraError::IncompletePair(module.clone(), "A"))?;
        let b = pair
            .b
            .as_ref()
            .ok_or_else(|| MergeLoraError::IncompletePair(module.clone(), "B"))?;
        let weight_name = format!("{module}.weight");
        let weight = variables
            .get_mut(&weight_name)
            .ok_or_else(|| MergeLoraError::UnknownModule(module.clone()))?;

        let mut delta = b.to_kind(Kind::Float).f_matmul(&a.to_kind(Kind::Float))? * scaling;
        if config.fan_in_fan_out {
            delta = delta.transpose(0, 1);
        }
        if delta.size() != weight.size() {
            return Err(MergeLoraError::ShapeMismatch {
                name: weight_name,
                delta: delta.size(),
                weight: weight.size(),
            });
        }
        let merged = weight.to_kind(Kind::Float) + delta.to_device(weight.device());
        weight.f_copy_(&merged.to_kind(weight.kind()))?;
    }
    Ok(pairs.len())
}
