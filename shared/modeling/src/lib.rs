mod auto_tokenizer;
mod batcher;
mod dummy;
mod generation;
mod llama;
mod llama_for_causal_lm;
mod lora;
mod precision;
mod safetensor_utils;
mod sampling;
mod traits;

pub use auto_tokenizer::{
    auto_tokenizer, ensure_special_tokens, AutoTokenizerError, SpecialTokenIds, SpecialTokens,
    DEFAULT_BOS_TOKEN, DEFAULT_EOS_TOKEN, DEFAULT_PAD_TOKEN, DEFAULT_UNK_TOKEN,
};
pub use batcher::{Batcher, LeftPaddedBatch};
pub use dummy::DummyModel;
pub use generation::{generate, GenerationConfig};
pub use llama::{
    position_ids, Cache, Config, Llama, Llama3RopeConfig, Llama3RopeType, LlamaEosToks,
};
pub use llama_for_causal_lm::{
    AttentionImplementation, LlamaConfig, LlamaForCausalLM, LoadLlamaForCausalLMError,
    UnknownAttentionImplementation,
};
pub use lora::{load_lora_config, merge_lora_into_variables, LoraConfig, MergeLoraError};
pub use precision::{Precision, UnknownPrecision};
pub use safetensor_utils::{
    load_safetensors_into_variables, read_safetensors, LoadSafetensorsError,
};
pub use sampling::{LogitsProcessor, Sampling};
pub use traits::CausalLM;
