//! Deterministic in-process stand-in for the model-execution collaborator,
//! shared by the unit tests.

use candle_core::{Device, Tensor};

use crate::backend::{DecodeStep, KvState, LayerKv, ModelBackend};
use crate::error::CollaboratorError;
use crate::mask::MaskSlice;

/// Buffers are a pure function of (token, position, layer), so any splice of
/// per-module outputs is bit-identical to recomputing the same spans.
pub(crate) struct StubBackend {
    pub layers: usize,
}

impl ModelBackend for StubBackend {
    fn model_id(&self) -> &str {
        "stub-model"
    }

    fn num_layers(&self) -> usize {
        self.layers
    }

    fn compute(
        &self,
        tokens: &[u32],
        positions: &[u32],
        _mask: &MaskSlice,
    ) -> Result<KvState, CollaboratorError> {
        let mut layers = Vec::with_capacity(self.layers);
        for layer in 0..self.layers {
            let data: Vec<f32> = tokens
                .iter()
                .zip(positions)
                .map(|(&t, &p)| t as f32 + p as f32 / 1024.0 + layer as f32 * 1e6)
                .collect();
            let k = Tensor::from_vec(data, (1, tokens.len(), 1), &Device::Cpu)
                .map_err(|e| CollaboratorError(Box::new(e)))?;
            let v = (&k + 0.5).map_err(|e| CollaboratorError(Box::new(e)))?;
            layers.push(LayerKv { k, v });
        }
        Ok(KvState::new(layers))
    }

    fn decode(
        &self,
        state: &KvState,
        token: u32,
        position: u32,
    ) -> Result<DecodeStep, CollaboratorError> {
        let kv = self.compute(&[token], &[position], &MaskSlice::causal(1))?;
        let mut logits = vec![0.0f32; 16];
        logits[((token as usize) + state.seq_len()) % 16] = 1.0;
        Ok(DecodeStep { kv, logits })
    }
}
