//! Assembly of a full-sequence attention state from cached and freshly
//! computed module states.
//!
//! Cached buffers are borrowed read-only and spliced by copy, so the same
//! entry can back any number of in-flight assemblies. Fresh module states are
//! computed in the module's isolation frame (local positions, intra-module
//! mask slice), which makes them geometrically identical to what a cache hit
//! would have returned; the spliced result is indistinguishable from a
//! fully-cold assembly of the same instance.

use std::sync::Arc;

use tracing::info;

use crate::backend::{KvState, ModelBackend};
use crate::cache::CacheEngine;
use crate::error::{CollaboratorError, Error, Result};
use crate::instance::PromptInstance;
use crate::mask::BlockMask;
use crate::request::CancelToken;
use crate::schema::NodePath;

/// The spliced per-layer state for one instance, ready for decoding.
pub struct AssembledState {
    pub kv: KvState,
    pub tokens: Vec<u32>,
    /// Global positions after rebasing, `0..tokens.len()`.
    pub positions: Vec<u32>,
    pub cached_modules: Vec<NodePath>,
    pub computed_modules: Vec<NodePath>,
}

impl AssembledState {
    /// Prompt tokens that were served from cache.
    pub fn cached_token_count(&self, instance: &PromptInstance) -> usize {
        instance
            .modules()
            .iter()
            .filter(|m| self.cached_modules.contains(&m.path))
            .map(|m| m.token_count())
            .sum()
    }
}

pub struct StateAssembler {
    cache: Arc<CacheEngine>,
    backend: Arc<dyn ModelBackend>,
}

enum ModuleState {
    Hit(Arc<KvState>),
    Fresh(KvState),
    Empty,
}

impl StateAssembler {
    pub fn new(cache: Arc<CacheEngine>, backend: Arc<dyn ModelBackend>) -> Self {
        Self { cache, backend }
    }

    pub fn assemble(
        &self,
        instance: &PromptInstance,
        mask: &BlockMask,
        cancel: &CancelToken,
    ) -> Result<AssembledState> {
        let model_id = self.backend.model_id();
        let mut parts = Vec::with_capacity(instance.modules().len());
        let mut cached_modules = Vec::new();
        let mut misses = Vec::new();

        for (idx, module) in instance.modules().iter().enumerate() {
            if module.token_count() == 0 {
                parts.push(ModuleState::Empty);
                continue;
            }
            let key = instance.cache_key(idx, model_id);
            match self.cache.lookup(&key).map_err(Error::InvalidKey)? {
                Some(hit) => {
                    cached_modules.push(module.path.clone());
                    parts.push(ModuleState::Hit(hit.state));
                }
                None => {
                    misses.push(idx);
                    parts.push(ModuleState::Empty);
                }
            }
        }

        let mut computed_modules = Vec::with_capacity(misses.len());
        for idx in misses {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let module = &instance.modules()[idx];
            let tokens = instance.module_tokens(idx);
            let positions = instance.local_positions(idx);
            let slice = mask.slice_for_module(instance, idx);
            let state = self.backend.compute(tokens, &positions, &slice)?;
            self.check_shape(&state, tokens.len(), &module.path)?;

            // Best effort: a rejected insert degrades to "not cached" without
            // affecting this request.
            let key = instance.cache_key(idx, model_id);
            self.cache
                .insert(key, state.clone())
                .map_err(Error::InvalidKey)?;
            computed_modules.push(module.path.clone());
            parts[idx] = ModuleState::Fresh(state);
        }

        let ordered: Vec<&KvState> = parts
            .iter()
            .filter_map(|p| match p {
                ModuleState::Hit(state) => Some(state.as_ref()),
                ModuleState::Fresh(state) => Some(state),
                ModuleState::Empty => None,
            })
            .collect();
        let kv = KvState::concat(&ordered)?;
        debug_assert_eq!(kv.seq_len(), instance.len());

        info!(
            hits = cached_modules.len(),
            misses = computed_modules.len(),
            tokens = instance.len(),
            "assembled instance state"
        );

        Ok(AssembledState {
            kv,
            tokens: instance.tokens().to_vec(),
            positions: instance.global_positions(),
            cached_modules,
            computed_modules,
        })
    }

    fn check_shape(&self, state: &KvState, tokens: usize, module: &NodePath) -> Result<()> {
        if state.num_layers() != self.backend.num_layers() {
            return Err(CollaboratorError::msg(format!(
                "backend returned {} layers for module `{module}`, expected {}",
                state.num_layers(),
                self.backend.num_layers()
            ))
            .into());
        }
        if state.seq_len() != tokens {
            return Err(CollaboratorError::msg(format!(
                "backend returned {} positions for module `{module}`, expected {tokens}",
                state.seq_len()
            ))
            .into());
        }
        Ok(())
    }
}
