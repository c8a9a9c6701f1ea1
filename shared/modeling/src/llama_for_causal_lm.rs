use crate::{
    llama::{Cache, Config, Llama, Llama3RopeConfig, LlamaEosToks},
    lora::{merge_lora_into_variables, MergeLoraError},
    safetensor_utils::load_safetensors_into_variables,
    CausalLM, LoadSafetensorsError,
};
use std::{
    io,
    path::{Path, PathBuf},
    str::FromStr,
};
use tch::{
    nn::{self, Module, VarStore},
    Device, Kind, TchError, Tensor,
};
use thiserror::Error;
use tracing::{debug, info};

/// `config.json` of a Hugging Face Llama checkpoint.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "LlamaConfig::default_rope_theta")]
    pub rope_theta: f32,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<LlamaEosToks>,
    pub rope_scaling: Option<Llama3RopeConfig>,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionImplementation {
    Eager,
    #[default]
    Sdpa,
    #[serde(rename = "flash_attention_2")]
    FlashAttention2,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown attention implementation \"{0}\", expected eager, sdpa or flash_attention_2")]
pub struct UnknownAttentionImplementation(String);

impl FromStr for AttentionImplementation {
    type Err = UnknownAttentionImplementation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eager" => Ok(Self::Eager),
            "sdpa" => Ok(Self::Sdpa),
            "flash_attention_2" => Ok(Self::FlashAttention2),
            other => Err(UnknownAttentionImplementation(other.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadLlamaForCausalLMError {
    #[error("missing config.json")]
    MissingConfigJSON,

    #[error("failed to read file config.json")]
    FailedToReadConfig(#[from] io::Error),

    #[error("could not parse config.json")]
    FailedToParseConfig(#[from] serde_json::Error),

    #[error("this model uses tied embeddings, which aren't supported.")]
    ModelHasTiedEmbeddings,

    #[error("FlashAttention-2 is not available, use eager or sdpa attention")]
    ModelExplicitlyUsesFA2,

    #[error("weights can't be loaded as {0:?}, only floating point kinds are supported")]
    UnsupportedKind(Kind),

    #[error("Failed to load safetensors from disk: {0}")]
    LoadSafetensorsError(#[from] LoadSafetensorsError),
}

impl LlamaConfig {
    fn default_rope_theta() -> f32 {
        10_000.0
    }

    /// Reads `config.json` out of a list of downloaded repo files.
    pub fn from_repo_files(repo_files: &[PathBuf]) -> Result<Self, LoadLlamaForCausalLMError> {
        let path = repo_files
            .iter()
            .map(PathBuf::as_path)
            .find(|x| x.file_name().is_some_and(|name| name == "config.json"))
            .ok_or(LoadLlamaForCausalLMError::MissingConfigJSON)?;
        Self::from_file(path)
    }

    fn from_file(path: &Path) -> Result<Self, LoadLlamaForCausalLMError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        if config.tie_word_embeddings {
            return Err(LoadLlamaForCausalLMError::ModelHasTiedEmbeddings);
        }
        Ok(config)
    }

    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn into_config(self, use_sdpa: bool) -> Config {
        let num_key_value_heads = self.num_key_value_heads();
        Config {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads,
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id,
            rope_scaling: self.rope_scaling,
            max_position_embeddings: self.max_position_embeddings,
            use_sdpa,
        }
    }
}

fn check_kind(kind: Option<Kind>) -> Result<(), LoadLlamaForCausalLMError> {
    match kind {
        None | Some(Kind::Float | Kind::Half | Kind::BFloat16 | Kind::Double) => Ok(()),
        Some(other) => Err(LoadLlamaForCausalLMError::UnsupportedKind(other)),
    }
}

/// Llama decoder with an untied LM head, loaded from safetensors.
#[derive(Debug)]
pub struct LlamaForCausalLM {
    pub model: Llama,
    pub config: Config,
    pub variables: VarStore,
    pub device: Device,
    pub lm_head: nn::Linear,
    pub cache: Cache,
}

impl LlamaForCausalLM {
    pub fn from_pretrained(
        repo_files: &[PathBuf],
        kind: Option<Kind>,
        attn_implementation: Option<AttentionImplementation>,
        device: Option<Device>,
        override_max_position_embeddings: Option<usize>,
    ) -> Result<Self, LoadLlamaForCausalLMError> {
        check_kind(kind)?;
        let use_sdpa = match attn_implementation.unwrap_or_default() {
            AttentionImplementation::Eager => false,
            AttentionImplementation::Sdpa => true,
            AttentionImplementation::FlashAttention2 => {
                return Err(LoadLlamaForCausalLMError::ModelExplicitlyUsesFA2)
            }
        };
        let mut config = LlamaConfig::from_repo_files(repo_files)?.into_config(use_sdpa);
        if let Some(max_position_embeddings) = override_max_position_embeddings {
            config.max_position_embeddings = max_position_embeddings;
        }

        let device = device.unwrap_or(Device::cuda_if_available());
        let mut variables = VarStore::new(device);
        if let Some(kind) = kind {
            variables.set_kind(kind);
        }
        let _no_grad = tch::no_grad_guard();
        let model = Llama::new(variables.root(), &config);
        let lm_head = nn::linear(
            &variables.root() / "lm_head",
            config.hidden_size as i64,
            config.vocab_size as i64,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        load_safetensors_into_variables(&variables, repo_files)?;
        debug!("Copied {} variables from safetensors", variables.len());
        let cache = Cache::new(kind.unwrap_or(Kind::Float), &config, &device);
        info!(
            "Loaded Llama with {} layers, vocab {} on {:?}",
            config.num_hidden_layers, config.vocab_size, device
        );
        Ok(Self {
            model,
            config,
            variables,
            device,
            lm_head,
            cache,
        })
    }

    /// Folds a LoRA adapter into the loaded weights. Returns the number of
    /// adapted layers.
    pub fn merge_lora(&self, adapter_files: &[PathBuf]) -> Result<usize, MergeLoraError> {
        merge_lora_into_variables(&self.variables, adapter_files)
    }

    /// Grows the input embedding and the LM head to `new_vocab_size` rows, new
    /// rows initialised to the mean of the existing ones. Never shrinks.
    /// Returns how many rows were added.
    pub fn resize_token_embeddings(&mut self, new_vocab_size: usize) -> Result<usize, TchError> {
        let old_vocab_size = self.config.vocab_size;
        if new_vocab_size <= old_vocab_size {
            return Ok(0);
        }
        let added = new_vocab_size - old_vocab_size;
        let _no_grad = tch::no_grad_guard();
        grow_with_mean_rows(self.model.embedding_weight_mut(), added as i64)?;
        grow_with_mean_rows(&mut self.lm_head.ws, added as i64)?;
        self.config.vocab_size = new_vocab_size;
        info!("Resized token embeddings from {old_vocab_size} to {new_vocab_size}");
        Ok(added)
    }
}

fn grow_with_mean_rows(weight: &mut Tensor, added: i64) -> Result<(), TchError> {
    let mean = weight
        .f_mean_dim(0, true, Kind::Float)?
        .f_to_kind(weight.kind())?;
    let rows = mean.f_expand([added, -1], false)?;
    let grown = Tensor::f_cat(&[&*weight, &rows], 0)?;
    weight.set_data(&grown);
    Ok(())
}

impl CausalLM for LlamaForCausalLM {
    fn forward(
        &mut self,
        x: &Tensor,
        attention_mask: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> Tensor {
        let hidden = self.model.forward(x, attention_mask, &self.cache);
        let hidden = match num_logits_to_keep {
            Some(keep) => {
                let t = hidden.size()[1];
                hidden.narrow(1, t - keep, keep)
            }
            None => hidden,
        };
        self.lm_head.forward(&hidden)
    }

    fn bos_token_id(&self) -> Option<i64> {
        self.config.bos_token_id.map(|x| x as i64)
    }

    fn eos_token_ids(&self) -> Vec<i64> {
        self.config
            .eos_token_id
            .as_ref()
            .map(|x| x.ids())
            .unwrap_or_default()
    }

    fn max_context_length(&self) -> Option<usize> {
        Some(self.config.max_position_embeddings)
    }

    fn device(&self) -> Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_with_mean_rows() {
        let mut weight = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 6.0]).reshape([2, 2]);
        grow_with_mean_rows(&mut weight, 2).unwrap();
        assert_eq!(weight.size(), vec![4, 2]);
        let values: Vec<f32> = weight.reshape([-1]).try_into().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 6.0, 2.0, 4.0, 2.0, 4.0]);
    }

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "vocab_size": 32,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "rms_norm_eps": 1e-6,
                "bos_token_id": 1,
                "eos_token_id": [2, 3],
                "max_position_embeddings": 128
            }"#,
        )
        .unwrap();
        assert!(!config.tie_word_embeddings);
        assert_eq!(config.num_key_value_heads(), 4);
        assert_eq!(config.rope_theta, 10_000.0);
        let config = config.into_config(true);
        assert_eq!(config.eos_token_id.unwrap().ids(), vec![2, 3]);
    }

    #[test]
    fn test_config_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer_config = dir.path().join("tokenizer_config.json");
        std::fs::write(&tokenizer_config, "{}").unwrap();
        assert!(matches!(
            LlamaConfig::from_repo_files(&[tokenizer_config.clone()]),
            Err(LoadLlamaForCausalLMError::MissingConfigJSON)
        ));

        let config = dir.path().join("config.json");
        std::fs::write(
            &config,
            r#"{
                "hidden_size": 8,
                "intermediate_size": 16,
                "vocab_size": 12,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "rms_norm_eps": 1e-6,
                "max_position_embeddings": 16,
                "tie_word_embeddings": true
            }"#,
        )
        .unwrap();
        assert!(matches!(
            LlamaConfig::from_repo_files(&[tokenizer_config, config]),
            Err(LoadLlamaForCausalLMError::ModelHasTiedEmbeddings)
        ));
    }

    #[test]
    fn test_parse_attention_implementation() {
        assert!(matches!("eager".parse::<AttentionImplementation>(), Ok(AttentionImplementation::Eager)));
        assert!(matches!("sdpa".parse::<AttentionImplementation>(), Ok(AttentionImplementation::Sdpa)));
        assert!(matches!(
            "flash_attention_2".parse::<AttentionImplementation>(),
            Ok(AttentionImplementation::FlashAttention2)
        ));
        assert_eq!(
            "flash".parse::<AttentionImplementation>().unwrap_err(),
            UnknownAttentionImplementation("flash".to_owned())
        );
    }

    #[test]
    fn test_int8_rejected() {
        assert!(matches!(
            check_kind(Some(Kind::Int8)),
            Err(LoadLlamaForCausalLMError::UnsupportedKind(Kind::Int8))
        ));
        assert!(check_kind(Some(Kind::BFloat16)).is_ok());
        assert!(check_kind(None).is_ok());
    }
}
