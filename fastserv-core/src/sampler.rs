//! Generation parameters and the sampling collaborator seam.
//!
//! The core drives the decode loop but does not interpret sampling
//! mechanics: temperature and top-p are forwarded opaquely to whatever
//! [`Sampler`] the caller supplies. [`BasicSampler`] is the provided default.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    /// Token sequences that end decoding once generated.
    #[serde(default)]
    pub stop_sequences: Vec<Vec<u32>>,
    #[serde(default)]
    pub eos_token: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            stop_sequences: Vec::new(),
            eos_token: None,
            temperature: None,
            top_p: None,
        }
    }
}

/// The sampling collaborator: picks the next token from raw logits.
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32]) -> Result<u32, CollaboratorError>;
}

/// Greedy argmax, or temperature softmax with optional top-p nucleus
/// truncation when a temperature is set.
pub struct BasicSampler {
    rng: StdRng,
    temperature: Option<f64>,
    top_p: Option<f64>,
}

impl BasicSampler {
    pub fn from_params(seed: u64, params: &GenerationParams) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            temperature: params.temperature.filter(|t| *t >= 1e-7),
            top_p: params.top_p,
        }
    }

    pub fn greedy() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0),
            temperature: None,
            top_p: None,
        }
    }
}

impl Sampler for BasicSampler {
    fn sample(&mut self, logits: &[f32]) -> Result<u32, CollaboratorError> {
        if logits.is_empty() {
            return Err(CollaboratorError::msg("backend produced empty logits"));
        }
        let Some(temperature) = self.temperature else {
            let argmax = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            return Ok(argmax as u32);
        };

        let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut probs: Vec<f64> = logits
            .iter()
            .map(|&l| (f64::from(l - max) / temperature).exp())
            .collect();

        if let Some(top_p) = self.top_p.filter(|p| *p > 0.0 && *p < 1.0) {
            let total: f64 = probs.iter().sum();
            let mut order: Vec<usize> = (0..probs.len()).collect();
            order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let mut cumulative = 0.0;
            let mut keep = vec![false; probs.len()];
            for idx in order {
                keep[idx] = true;
                cumulative += probs[idx] / total;
                if cumulative >= top_p {
                    break;
                }
            }
            for (p, kept) in probs.iter_mut().zip(keep) {
                if !kept {
                    *p = 0.0;
                }
            }
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| CollaboratorError(Box::new(e)))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}
