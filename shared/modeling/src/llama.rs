use std::f32::consts::PI;
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub enum Llama3RopeType {
    #[serde(rename = "llama3")]
    Llama3,
    #[default]
    #[serde(rename = "default")]
    Default,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct Llama3RopeConfig {
    pub factor: f32,
    pub low_freq_factor: f32,
    pub high_freq_factor: f32,
    pub original_max_position_embeddings: usize,
    pub rope_type: Llama3RopeType,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum LlamaEosToks {
    Single(u32),
    Multiple(Vec<u32>),
}

impl LlamaEosToks {
    pub fn ids(&self) -> Vec<i64> {
        match self {
            LlamaEosToks::Single(id) => vec![*id as i64],
            LlamaEosToks::Multiple(ids) => ids.iter().map(|x| *x as i64).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<LlamaEosToks>,
    pub rope_scaling: Option<Llama3RopeConfig>,
    pub max_position_embeddings: usize,
    pub use_sdpa: bool,
}

impl Config {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary embedding tables, one row per position.
#[derive(Debug)]
pub struct Cache {
    cos: Tensor,
    sin: Tensor,
}

fn rope_frequencies(config: &Config) -> Vec<f32> {
    let head_dim = config.head_dim();
    (0..head_dim)
        .step_by(2)
        .map(|i| 1f32 / config.rope_theta.powf(i as f32 / head_dim as f32))
        .collect()
}

/// Llama 3 context extension: long wavelengths are slowed down by `factor`,
/// short ones kept, and the band in between interpolated.
fn llama3_scaled(frequencies: Vec<f32>, scaling: &Llama3RopeConfig) -> Vec<f32> {
    let original = scaling.original_max_position_embeddings as f32;
    let low_freq_wavelen = original / scaling.low_freq_factor;
    let high_freq_wavelen = original / scaling.high_freq_factor;
    frequencies
        .into_iter()
        .map(|freq| {
            let wavelen = 2. * PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scaling.factor
            } else {
                let smooth = (original / wavelen - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                (1. - smooth) * freq / scaling.factor + smooth * freq
            }
        })
        .collect()
}

impl Cache {
    pub fn new(kind: Kind, config: &Config, device: &Device) -> Self {
        let frequencies = match &config.rope_scaling {
            Some(
                scaling @ Llama3RopeConfig {
                    rope_type: Llama3RopeType::Llama3,
                    ..
                },
            ) => llama3_scaled(rope_frequencies(config), scaling),
            _ => rope_frequencies(config),
        };
        let frequencies = Tensor::from_slice(&frequencies).to(*device);
        let positions = (config.max_position_embeddings + 1) as i64;
        let angles = Tensor::arange(positions, (Kind::Float, *device))
            .reshape([positions, 1])
            .matmul(&frequencies.reshape([1, -1]));
        Self {
            cos: angles.cos().to_kind(kind),
            sin: angles.sin().to_kind(kind),
        }
    }

    /// `x` is `(batch, heads, seq, head_dim)`, `position_ids` is `(batch, seq)`.
    fn rotate(&self, x: &Tensor, position_ids: &Tensor) -> Tensor {
        let (b, _, t, _) = x.size4().unwrap();
        let flat = position_ids.reshape([-1]);
        let table = |values: &Tensor| {
            let rows = values.index_select(0, &flat).reshape([b, t, -1]);
            Tensor::cat(&[&rows, &rows], -1).unsqueeze(1)
        };
        (x * table(&self.cos)) + (rotate_half(x) * table(&self.sin))
    }
}

/// Position of every token counting only real tokens, so left-padded rows start
/// at 0 on their first real token. Pad positions get 1, they are masked anyway.
pub fn position_ids(attention_mask: &Tensor) -> Tensor {
    let mask = attention_mask.to_kind(Kind::Int64);
    let positions = mask.cumsum(-1, Kind::Int64) - 1;
    positions.masked_fill(&mask.eq(0i64), 1i64)
}

fn causal_mask(t: i64, device: Device) -> Tensor {
    Tensor::ones([t, t], (Kind::Int64, device))
        .tril(0)
        .eq(1i64)
        .reshape([1, 1, t, t])
}

/// Boolean `(batch, 1, seq, seq)` mask, true where a query may attend a key:
/// causal, restricted to real keys. The diagonal is always open so that rows
/// for pad queries never become fully masked.
fn attention_bias(attention_mask: &Tensor, device: Device) -> Tensor {
    let (b, t) = attention_mask.size2().unwrap();
    let keys = attention_mask.to_kind(Kind::Bool).reshape([b, 1, 1, t]);
    let diagonal = Tensor::eye(t, (Kind::Bool, device)).reshape([1, 1, t, t]);
    causal_mask(t, device)
        .logical_and(&keys)
        .logical_or(&diagonal)
}

/// Expands grouped key/value heads to one per query head.
fn repeat_kv(x: &Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return x.shallow_clone();
    }
    let (b, kv_heads, t, head_dim) = x.size4().unwrap();
    x.unsqueeze(2)
        .expand([b, kv_heads, n_rep, t, head_dim], false)
        .reshape([b, kv_heads * n_rep, t, head_dim])
}

fn rotate_half(xs: &Tensor) -> Tensor {
    let half = xs.size().last().copied().unwrap_or_default() / 2;
    let first = xs.narrow(-1, 0, half);
    let second = xs.narrow(-1, half, half);
    Tensor::cat(&[&second.neg(), &first], -1)
}

#[derive(Debug)]
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(vs: nn::Path, size: usize, eps: f64) -> Self {
        Self {
            weight: vs.ones("weight", &[size as i64]),
            eps,
        }
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let kind = xs.kind();
        let xs = xs.to_kind(Kind::Float);
        let variance = xs.pow_tensor_scalar(2).mean_dim(-1, true, Kind::Float);
        &self.weight * (xs * (variance + self.eps).rsqrt()).to_kind(kind)
    }
}

fn linear_no_bias(vs: nn::Path, in_dim: usize, out_dim: usize) -> nn::Linear {
    nn::linear(
        vs,
        in_dim as i64,
        out_dim as i64,
        nn::LinearConfig {
            bias: false,
            ..Default::default()
        },
    )
}

#[derive(Debug)]
struct Mlp {
    gate_proj: nn::Linear,
    up_proj: nn::Linear,
    down_proj: nn::Linear,
}

impl Mlp {
    fn new(vs: nn::Path, config: &Config) -> Self {
        let (hidden, intermediate) = (config.hidden_size, config.intermediate_size);
        Self {
            gate_proj: linear_no_bias(&vs / "gate_proj", hidden, intermediate),
            up_proj: linear_no_bias(&vs / "up_proj", hidden, intermediate),
            down_proj: linear_no_bias(&vs / "down_proj", intermediate, hidden),
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let gated = self.gate_proj.forward(xs).silu() * self.up_proj.forward(xs);
        self.down_proj.forward(&gated)
    }
}

#[derive(Debug)]
struct SelfAttention {
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    o_proj: nn::Linear,
    num_heads: i64,
    num_kv_heads: i64,
    head_dim: i64,
    use_sdpa: bool,
}

impl SelfAttention {
    fn new(vs: nn::Path, config: &Config) -> Self {
        let head_dim = config.head_dim();
        let q_size = head_dim * config.num_attention_heads;
        let kv_size = head_dim * config.num_key_value_heads;
        Self {
            q_proj: linear_no_bias(&vs / "q_proj", config.hidden_size, q_size),
            k_proj: linear_no_bias(&vs / "k_proj", config.hidden_size, kv_size),
            v_proj: linear_no_bias(&vs / "v_proj", config.hidden_size, kv_size),
            o_proj: linear_no_bias(&vs / "o_proj", q_size, config.hidden_size),
            num_heads: config.num_attention_heads as i64,
            num_kv_heads: config.num_key_value_heads as i64,
            head_dim: head_dim as i64,
            use_sdpa: config.use_sdpa,
        }
    }

    /// `(batch, seq, heads * head_dim)` -> `(batch, heads, seq, head_dim)`
    fn split_heads(&self, projected: Tensor, heads: i64) -> Tensor {
        let (b, t, _) = projected.size3().unwrap();
        projected
            .contiguous()
            .reshape([b, t, heads, self.head_dim])
            .transpose(1, 2)
    }

    fn forward(
        &self,
        x: &Tensor,
        position_ids: &Tensor,
        mask: Option<&Tensor>,
        cache: &Cache,
    ) -> Tensor {
        let (b, t, _) = x.size3().unwrap();
        let kind = x.kind();

        let q = self.split_heads(self.q_proj.forward(x), self.num_heads);
        let k = self.split_heads(self.k_proj.forward(x), self.num_kv_heads);
        let v = self.split_heads(self.v_proj.forward(x), self.num_kv_heads);

        let q = cache.rotate(&q, position_ids).to_kind(kind);
        let k = cache.rotate(&k, position_ids).to_kind(kind);
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(&k, n_rep);
        let v = repeat_kv(&v, n_rep);

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let y = match (self.use_sdpa, mask) {
            (true, Some(mask)) => {
                Tensor::scaled_dot_product_attention(&q, &k, &v, Some(mask), 0.0, false, Some(scale))
            }
            (true, None) => Tensor::scaled_dot_product_attention::<Tensor>(
                &q,
                &k,
                &v,
                None,
                0.0,
                t > 1,
                Some(scale),
            ),
            (false, mask) => {
                let allowed = match mask {
                    Some(mask) => mask.shallow_clone(),
                    None => causal_mask(t, x.device()),
                };
                (q.matmul(&k.transpose(-2, -1)) * scale)
                    .masked_fill(&allowed.logical_not(), f64::NEG_INFINITY)
                    .softmax(-1, kind)
                    .matmul(&v)
            }
        };

        let y = y
            .transpose(1, 2)
            .contiguous()
            .reshape([b, t, self.num_heads * self.head_dim]);
        self.o_proj.forward(&y)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: SelfAttention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn new(vs: nn::Path, config: &Config) -> Self {
        Self {
            input_layernorm: RmsNorm::new(
                &vs / "input_layernorm",
                config.hidden_size,
                config.rms_norm_eps,
            ),
            self_attn: SelfAttention::new(&vs / "self_attn", config),
            post_attention_layernorm: RmsNorm::new(
                &vs / "post_attention_layernorm",
                config.hidden_size,
                config.rms_norm_eps,
            ),
            mlp: Mlp::new(&vs / "mlp", config),
        }
    }

    fn forward(
        &self,
        x: &Tensor,
        position_ids: &Tensor,
        mask: Option<&Tensor>,
        cache: &Cache,
    ) -> Tensor {
        let attended = self.self_attn.forward(
            &self.input_layernorm.forward(x),
            position_ids,
            mask,
            cache,
        );
        let x = attended + x;
        self.mlp.forward(&self.post_attention_layernorm.forward(&x)) + x
    }
}

/// The Llama decoder stack without the LM head. Variable names follow the
/// Hugging Face checkpoint layout (`model.layers.N.self_attn.q_proj.weight`).
#[derive(Debug)]
pub struct Llama {
    embed_tokens: nn::Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
}

impl Llama {
    pub fn new(vs: nn::Path, config: &Config) -> Self {
        let model = &vs / "model";
        let embed_tokens = nn::embedding(
            &model / "embed_tokens",
            config.vocab_size as i64,
            config.hidden_size as i64,
            Default::default(),
        );
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(&model / "layers" / i, config))
            .collect();
        let norm = RmsNorm::new(&model / "norm", config.hidden_size, config.rms_norm_eps);
        Self {
            embed_tokens,
            layers,
            norm,
        }
    }

    /// Hidden states for `x`. Without an attention mask every token is real and
    /// positions count from 0.
    pub fn forward(&self, x: &Tensor, attention_mask: Option<&Tensor>, cache: &Cache) -> Tensor {
        let (b, t) = x.size2().unwrap();
        let device = x.device();
        let (position_ids, mask) = match attention_mask {
            Some(attention_mask) => (
                position_ids(attention_mask),
                Some(attention_bias(attention_mask, device)),
            ),
            None => (
                Tensor::arange(t, (Kind::Int64, device))
                    .unsqueeze(0)
                    .expand([b, t], false),
                None,
            ),
        };

        let mut hidden = self.embed_tokens.forward(x);
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &position_ids, mask.as_ref(), cache);
        }
        self.norm.forward(&hidden)
    }

    pub(crate) fn embedding_weight_mut(&mut self) -> &mut Tensor {
        &mut self.embed_tokens.ws
    }
}
