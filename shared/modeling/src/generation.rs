use crate::{CausalLM, LeftPaddedBatch, LogitsProcessor};
use anyhow::{bail, Result};
use tch::{Kind, Tensor};

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub pad_token_id: i64,
    pub eos_token_ids: Vec<i64>,
}

/// Samples up to `max_new_tokens` continuation tokens for every row of `batch`.
///
/// Each returned continuation holds only the newly generated tokens, stopping
/// before the first EOS; rows that finished early are fed pad tokens until the
/// whole batch is done.
pub fn generate<M: CausalLM>(
    model: &mut M,
    batch: &LeftPaddedBatch,
    config: &GenerationConfig,
    logits_processor: &mut LogitsProcessor,
) -> Result<Vec<Vec<i64>>> {
    let rows = batch.len();
    if rows == 0 {
        return Ok(Vec::new());
    }
    if let Some(max_context) = model.max_context_length() {
        let needed = batch.width() + config.max_new_tokens;
        if needed > max_context {
            bail!(
                "prompt width {} plus {} new tokens exceeds the model context of {max_context}",
                batch.width(),
                config.max_new_tokens
            );
        }
    }

    let _no_grad = tch::no_grad_guard();
    let device = model.device();
    let (mut input_ids, mut attention_mask) = batch.to_tensors(device);
    let mut continuations = vec![Vec::new(); rows];
    let mut finished = vec![false; rows];

    for _ in 0..config.max_new_tokens {
        let logits = model.forward(&input_ids, Some(&attention_mask), Some(1));
        let logits = logits.squeeze_dim(1);

        let mut next_tokens = Vec::with_capacity(rows);
        for (row, done) in finished.iter_mut().enumerate() {
            if *done {
                next_tokens.push(config.pad_token_id);
                continue;
            }
            let token = logits_processor.sample(&logits.get(row as i64))? as i64;
            if config.eos_token_ids.contains(&token) {
                *done = true;
            } else {
                continuations[row].push(token);
            }
            next_tokens.push(token);
        }
        if finished.iter().all(|x| *x) {
            break;
        }

        let next_tokens = Tensor::from_slice(&next_tokens).to(device).unsqueeze(1);
        input_ids = Tensor::cat(&[&input_ids, &next_tokens], 1);
        attention_mask = Tensor::cat(
            &[
                &attention_mask,
                &Tensor::ones([rows as i64, 1], (Kind::Int64, device)),
            ],
            1,
        );
    }
    Ok(continuations)
}
