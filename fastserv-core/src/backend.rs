//! Per-layer key/value state and the model-execution collaborator seam.
//!
//! The core never does model math. It hands the collaborator tokens, positions
//! and a mask slice, and gets back per-layer K/V buffers shaped
//! `(num_kv_heads, seq_len, head_dim)` with the sequence on dim 1. The
//! collaborator must honor the supplied positions and mask rather than invent
//! its own, and must be deterministic given identical inputs; both are load
//! bearing for cache reuse.

use candle_core::{Result as CandleResult, Tensor};

use crate::error::CollaboratorError;
use crate::mask::MaskSlice;

/// Sequence dimension of every K/V buffer.
pub const SEQ_DIM: usize = 1;

/// One layer's key and value buffers for a span of tokens.
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub k: Tensor,
    pub v: Tensor,
}

impl LayerKv {
    pub fn seq_len(&self) -> usize {
        self.k.dims()[SEQ_DIM]
    }

    pub fn size_bytes(&self) -> usize {
        tensor_bytes(&self.k) + tensor_bytes(&self.v)
    }
}

fn tensor_bytes(t: &Tensor) -> usize {
    t.elem_count() * t.dtype().size_in_bytes()
}

/// Per-layer K/V buffers for a token span: the unit of caching and splicing.
#[derive(Debug, Clone, Default)]
pub struct KvState {
    layers: Vec<LayerKv>,
}

impl KvState {
    pub fn new(layers: Vec<LayerKv>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerKv::seq_len).unwrap_or(0)
    }

    pub fn size_bytes(&self) -> usize {
        self.layers.iter().map(LayerKv::size_bytes).sum()
    }

    /// Splice states into one contiguous buffer set, in order. Always copies;
    /// the sources are left untouched, so cached states can back any number of
    /// concurrent assemblies.
    pub fn concat(parts: &[&KvState]) -> CandleResult<KvState> {
        let mut parts = parts.iter().filter(|p| p.seq_len() > 0).peekable();
        let Some(first) = parts.peek() else {
            return Ok(KvState::default());
        };
        let num_layers = first.num_layers();
        let parts: Vec<_> = parts.collect();
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let ks: Vec<&Tensor> = parts.iter().map(|p| &p.layers[layer].k).collect();
            let vs: Vec<&Tensor> = parts.iter().map(|p| &p.layers[layer].v).collect();
            layers.push(LayerKv {
                k: Tensor::cat(&ks, SEQ_DIM)?.contiguous()?,
                v: Tensor::cat(&vs, SEQ_DIM)?.contiguous()?,
            });
        }
        Ok(KvState::new(layers))
    }

    /// Append one decode step's buffers in place.
    pub fn append(&mut self, step: &KvState) -> CandleResult<()> {
        if self.layers.is_empty() {
            self.layers = step.layers.clone();
            return Ok(());
        }
        for (layer, new) in self.layers.iter_mut().zip(&step.layers) {
            layer.k = Tensor::cat(&[&layer.k, &new.k], SEQ_DIM)?.contiguous()?;
            layer.v = Tensor::cat(&[&layer.v, &new.v], SEQ_DIM)?.contiguous()?;
        }
        Ok(())
    }

    /// A view of the first `len` positions. No copy.
    pub fn prefix(&self, len: usize) -> CandleResult<KvState> {
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            layers.push(LayerKv {
                k: layer.k.narrow(SEQ_DIM, 0, len)?,
                v: layer.v.narrow(SEQ_DIM, 0, len)?,
            });
        }
        Ok(KvState::new(layers))
    }
}

/// Output of one decode step: the new token's K/V plus logits for sampling
/// the token after it.
#[derive(Debug, Clone)]
pub struct DecodeStep {
    pub kv: KvState,
    pub logits: Vec<f32>,
}

/// The model-execution collaborator.
pub trait ModelBackend: Send + Sync {
    /// Stable identifier of the underlying weights; part of every cache key.
    fn model_id(&self) -> &str;

    fn num_layers(&self) -> usize;

    /// Compute K/V buffers for a token span under externally supplied
    /// positions and mask.
    fn compute(
        &self,
        tokens: &[u32],
        positions: &[u32],
        mask: &MaskSlice,
    ) -> Result<KvState, CollaboratorError>;

    /// Run one token at `position` against existing state. `state` must cover
    /// positions `0..position`; the returned buffers are for `token` alone.
    fn decode(
        &self,
        state: &KvState,
        token: u32,
        position: u32,
    ) -> Result<DecodeStep, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn state(values: &[f32]) -> KvState {
        let t = Tensor::from_vec(values.to_vec(), (1, values.len(), 1), &Device::Cpu).unwrap();
        KvState::new(vec![LayerKv {
            k: t.clone(),
            v: (t * 2.0).unwrap(),
        }])
    }

    #[test]
    fn concat_splices_in_order_without_touching_sources() {
        let a = state(&[1.0, 2.0]);
        let b = state(&[3.0]);
        let out = KvState::concat(&[&a, &b]).unwrap();
        assert_eq!(out.seq_len(), 3);
        let k: Vec<f32> = out.layers()[0].k.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(k, vec![1.0, 2.0, 3.0]);
        assert_eq!(a.seq_len(), 2);
        assert_eq!(b.seq_len(), 1);
    }

    #[test]
    fn concat_skips_empty_parts() {
        let a = state(&[1.0]);
        let empty = KvState::default();
        let out = KvState::concat(&[&empty, &a, &empty]).unwrap();
        assert_eq!(out.seq_len(), 1);
        assert!(KvState::concat(&[&empty]).unwrap().layers().is_empty());
    }

    #[test]
    fn append_and_prefix_roundtrip() {
        let mut s = state(&[1.0, 2.0]);
        s.append(&state(&[3.0])).unwrap();
        assert_eq!(s.seq_len(), 3);
        let k: Vec<f32> = s.layers()[0].k.flatten_all().unwrap().to_vec1().unwrap();
        let v: Vec<f32> = s.layers()[0].v.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(k, vec![1.0, 2.0, 3.0]);
        assert_eq!(v, vec![2.0, 4.0, 6.0]);
        let head = s.prefix(2).unwrap();
        assert_eq!(head.seq_len(), 2);
        assert_eq!(head.layers()[0].k.dtype(), DType::F32);
    }

    #[test]
    fn size_accounts_for_both_buffers() {
        let s = state(&[1.0, 2.0]);
        // 2 tokens * 4 bytes, for k and for v.
        assert_eq!(s.size_bytes(), 16);
    }
}
