use anyhow::Result;
use rand::{distributions::Distribution, rngs::StdRng, SeedableRng};
use tch::{Device, Kind, Tensor};

#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    ArgMax,
    All { temperature: f64 },
    TopK { k: usize, temperature: f64 },
    TopP { p: f64, temperature: f64 },
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

/// Picks the next token from a 1-d logits tensor.
pub struct LogitsProcessor {
    rng: StdRng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            sampling,
        }
    }

    pub fn sampling(&self) -> &Sampling {
        &self.sampling
    }

    fn sample_argmax(&mut self, logits: &[f32]) -> u32 {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(index, _)| index as u32)
            .unwrap_or_default()
    }

    fn sample_multinomial(&mut self, prs: &[f32]) -> Result<u32> {
        let distr = rand::distributions::WeightedIndex::new(prs)?;
        Ok(distr.sample(&mut self.rng) as u32)
    }

    /// Zeroes everything outside the smallest set of tokens whose cumulative
    /// probability reaches `top_p`, then samples from what is left.
    fn sample_topp(&mut self, prs: &mut [f32], top_p: f32) -> Result<u32> {
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
        argsort_indices.sort_by(|&i, &j| prs[j].total_cmp(&prs[i]));

        let mut cumsum = 0.;
        for index in &argsort_indices {
            if cumsum >= top_p {
                prs[*index] = 0.0;
            } else {
                cumsum += prs[*index];
            }
        }
        self.sample_multinomial(prs)
    }

    fn sample_topk(&mut self, prs: &mut [f32], top_k: usize) -> Result<u32> {
        if top_k >= prs.len() {
            return self.sample_multinomial(prs);
        }
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
        argsort_indices.sort_by(|&i, &j| prs[j].total_cmp(&prs[i]));
        for index in &argsort_indices[top_k..] {
            prs[*index] = 0.0;
        }
        self.sample_multinomial(prs)
    }

    fn sample_topk_topp(&mut self, prs: &mut [f32], top_k: usize, top_p: f32) -> Result<u32> {
        if top_k < prs.len() {
            let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
            argsort_indices.sort_by(|&i, &j| prs[j].total_cmp(&prs[i]));
            for index in &argsort_indices[top_k..] {
                prs[*index] = 0.0;
            }
        }
        if top_p <= 0.0 || top_p >= 1.0 {
            self.sample_multinomial(prs)
        } else {
            self.sample_topp(prs, top_p)
        }
    }

    fn probabilities(logits: &Tensor, temperature: f64) -> Result<Vec<f32>> {
        let prs = (logits / temperature).softmax(-1, Kind::Float);
        Ok(Vec::<f32>::try_from(&prs)?)
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.to_kind(Kind::Float).to_device(Device::Cpu);
        let next_token = match self.sampling.clone() {
            Sampling::ArgMax => {
                let logits = Vec::<f32>::try_from(&logits)?;
                self.sample_argmax(&logits)
            }
            Sampling::All { temperature } => {
                let prs = Self::probabilities(&logits, temperature)?;
                self.sample_multinomial(&prs)?
            }
            Sampling::TopP { p, temperature } => {
                let mut prs = Self::probabilities(&logits, temperature)?;
                if p <= 0.0 || p >= 1.0 {
                    // simply sample from the predicted probability distribution
                    self.sample_multinomial(&prs)?
                } else {
                    self.sample_topp(&mut prs, p as f32)?
                }
            }
            Sampling::TopK { k, temperature } => {
                let mut prs = Self::probabilities(&logits, temperature)?;
                self.sample_topk(&mut prs, k)?
            }
            Sampling::TopKThenTopP { k, p, temperature } => {
                let mut prs = Self::probabilities(&logits, temperature)?;
                self.sample_topk_topp(&mut prs, k, p as f32)?
            }
        };
        Ok(next_token)
    }
}
