use tch::{Device, Tensor};

use crate::CausalLM;

/// A model without weights that emits a fixed script of tokens per batch row,
/// then EOS forever. Useful for exercising generation without a checkpoint.
#[derive(Debug)]
pub struct DummyModel {
    vocab_size: usize,
    scripts: Vec<Vec<i64>>,
    eos_token_id: i64,
    max_context_length: Option<usize>,
    forward_calls: usize,
    last_input: Option<Vec<Vec<i64>>>,
}

impl DummyModel {
    pub fn scripted(vocab_size: usize, scripts: Vec<Vec<i64>>, eos_token_id: i64) -> Self {
        Self {
            vocab_size,
            scripts,
            eos_token_id,
            max_context_length: None,
            forward_calls: 0,
            last_input: None,
        }
    }

    pub fn with_max_context_length(mut self, max_context_length: usize) -> Self {
        self.max_context_length = Some(max_context_length);
        self
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls
    }

    /// The token ids passed to the most recent forward call, one vec per row.
    pub fn last_input(&self) -> Option<Vec<Vec<i64>>> {
        self.last_input.clone()
    }
}

impl CausalLM for DummyModel {
    fn forward(
        &mut self,
        x: &Tensor,
        _attention_mask: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> Tensor {
        let (b, t) = x.size2().unwrap();
        let kept = num_logits_to_keep.unwrap_or(t).min(t);
        let step = self.forward_calls;
        self.forward_calls += 1;

        let flat: Vec<i64> = x.reshape([-1]).try_into().unwrap();
        self.last_input = Some(flat.chunks(t as usize).map(|x| x.to_vec()).collect());

        let vocab = self.vocab_size;
        let mut logits = vec![0f32; b as usize * kept as usize * vocab];
        for row in 0..b as usize {
            let token = self
                .scripts
                .get(row)
                .and_then(|script| script.get(step))
                .copied()
                .unwrap_or(self.eos_token_id);
            for position in 0..kept as usize {
                logits[(row * kept as usize + position) * vocab + token as usize] = 100.0;
            }
        }
        Tensor::from_slice(&logits)
            .reshape([b, kept, vocab as i64])
            .to(x.device())
    }

    fn bos_token_id(&self) -> Option<i64> {
        None
    }

    fn eos_token_ids(&self) -> Vec<i64> {
        vec![self.eos_token_id]
    }

    fn max_context_length(&self) -> Option<usize> {
        self.max_context_length
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}
