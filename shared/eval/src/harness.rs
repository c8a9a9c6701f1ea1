use crate::{dataset::Example, prompt::format_prompt};
use anyhow::{anyhow, ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;
use tracing::{info, warn};
use xgpt_modeling::{generate, Batcher, CausalLM, GenerationConfig, LogitsProcessor, Sampling};

pub const SAMPLING_TOP_P: f64 = 1.0;
pub const SAMPLING_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct PromptOptions {
    /// Used for examples that don't name their own task.
    pub default_task: String,
    pub max_input_tokens: usize,
    pub max_hypothesis_tokens: usize,
    pub model_max_length: usize,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub max_new_tokens: usize,
    pub pad_token_id: i64,
    pub eos_token_ids: Vec<i64>,
    pub seed: u64,
    pub progress_bar: bool,
}

/// Tokenized critique prompts, one per candidate in example-major order.
#[derive(Debug)]
pub struct PreparedEval {
    sources: Vec<Vec<i64>>,
}

fn encode(tokenizer: &Tokenizer, text: &str, add_special_tokens: bool) -> Result<Vec<i64>> {
    Ok(tokenizer
        .encode(text, add_special_tokens)
        .map_err(|e| anyhow!("failed to tokenize: {e}"))?
        .get_ids()
        .iter()
        .map(|x| *x as i64)
        .collect())
}

/// Cuts `text` down to its first `max_tokens` tokens.
pub fn truncate_to_tokens(tokenizer: &Tokenizer, text: &str, max_tokens: usize) -> Result<String> {
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|e| anyhow!("failed to tokenize: {e}"))?;
    if encoding.len() <= max_tokens {
        return Ok(text.to_owned());
    }
    if max_tokens == 0 {
        return Ok(String::new());
    }
    let end = encoding.get_offsets()[max_tokens - 1].1;
    match text.get(..end) {
        Some(prefix) => Ok(prefix.to_owned()),
        None => tokenizer
            .decode(&encoding.get_ids()[..max_tokens], false)
            .map_err(|e| anyhow!("failed to decode: {e}")),
    }
}

impl PreparedEval {
    pub fn prepare(
        examples: &[Example],
        tokenizer: &Tokenizer,
        options: &PromptOptions,
    ) -> Result<Self> {
        info!("Formatting inputs...");
        let mut sources = Vec::new();
        let mut truncated = 0;
        for example in examples {
            let task = match example.task.is_empty() {
                true => options.default_task.as_str(),
                false => example.task.as_str(),
            };
            let context = truncate_to_tokens(tokenizer, &example.input, options.max_input_tokens)?;
            for candidate in &example.candidates {
                let hypothesis =
                    truncate_to_tokens(tokenizer, &candidate.text, options.max_hypothesis_tokens)?;
                let prompt = format_prompt(task, &example.instruction, &context, &hypothesis)
                    .context("failed to format critique prompt")?;
                let mut ids = encode(tokenizer, &prompt.source(), true)?;
                if ids.len() > options.model_max_length {
                    ids.truncate(options.model_max_length);
                    truncated += 1;
                }
                sources.push(ids);
            }
        }
        if truncated > 0 {
            warn!(
                "{truncated} of {} prompts were longer than {} tokens and were truncated",
                sources.len(),
                options.model_max_length
            );
        }
        info!("Prepared {} prompts", sources.len());
        Ok(Self { sources })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[Vec<i64>] {
        &self.sources
    }

    /// Generates one critique per prompt, decoded without special tokens.
    pub fn run<M: CausalLM>(
        &self,
        model: &mut M,
        tokenizer: &Tokenizer,
        options: &RunOptions,
    ) -> Result<Vec<String>> {
        ensure!(options.batch_size > 0, "batch size must be positive");
        let batcher = Batcher::new(&self.sources, options.batch_size, options.pad_token_id);
        let pbar = match options.progress_bar {
            false => None,
            true => {
                let pbar = ProgressBar::new(batcher.num_batches() as u64);
                pbar.set_style(ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                    .progress_chars("#>-"));
                pbar.set_message("Evaluating");
                Some(pbar)
            }
        };

        let config = GenerationConfig {
            max_new_tokens: options.max_new_tokens,
            pad_token_id: options.pad_token_id,
            eos_token_ids: options.eos_token_ids.clone(),
        };
        let mut logits_processor = LogitsProcessor::from_sampling(
            options.seed,
            Sampling::TopP {
                p: SAMPLING_TOP_P,
                temperature: SAMPLING_TEMPERATURE,
            },
        );

        let mut outputs = Vec::with_capacity(self.sources.len());
        for batch in batcher {
            for continuation in generate(model, &batch, &config, &mut logits_processor)? {
                let ids = continuation.iter().map(|x| *x as u32).collect::<Vec<_>>();
                outputs.push(
                    tokenizer
                        .decode(&ids, true)
                        .map_err(|e| anyhow!("failed to decode: {e}"))?,
                );
            }
            if let Some(pbar) = &pbar {
                pbar.inc(1);
            }
        }
        if let Some(pbar) = pbar {
            pbar.finish();
        }
        Ok(outputs)
    }
}
