use tch::{Device, Tensor};

/// Any causal language model that can be run forward over a batch of token ids.
/// Its internal implementation is completely hidden, so generation code only
/// ever sees logits.
pub trait CausalLM: Send + std::fmt::Debug {
    /// `x` is `(batch, seq)` token ids. `attention_mask` has the same shape and is
    /// non-zero on real tokens; rows may be left padded. Returns logits of shape
    /// `(batch, seq or num_logits_to_keep, vocab)`.
    fn forward(
        &mut self,
        x: &Tensor,
        attention_mask: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> Tensor;
    fn bos_token_id(&self) -> Option<i64>;
    fn eos_token_ids(&self) -> Vec<i64>;
    /// Longest sequence (prompt plus continuation) the model can attend over.
    fn max_context_length(&self) -> Option<usize>;
    fn device(&self) -> Device;
}
