//! The autoregressive generation driver.
//!
//! One request moves through `Assembling -> Decoding -> {Completed, Stopped,
//! Failed}`. The assembled state seeds the decode loop; each step runs one
//! token through the model-execution collaborator, appends its K/V, and asks
//! the sampling collaborator for the next token. A collaborator failure after
//! tokens have been produced surfaces the partial output instead of
//! discarding it.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::assembler::StateAssembler;
use crate::backend::{DecodeStep, ModelBackend};
use crate::cache::CacheEngine;
use crate::error::{CollaboratorError, Error, Result};
use crate::instance::{Bindings, PromptInstance};
use crate::mask::AttentionMaskBuilder;
use crate::request::CancelToken;
use crate::sampler::{GenerationParams, Sampler};
use crate::schema::{NodePath, SchemaTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationState {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Eos,
    MaxTokens,
    StopSequence,
    Cancelled,
}

impl StopReason {
    fn state(self) -> GenerationState {
        match self {
            Self::Eos => GenerationState::Completed,
            Self::MaxTokens | Self::StopSequence | Self::Cancelled => GenerationState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub tokens: Vec<u32>,
    pub state: GenerationState,
    pub reason: Option<StopReason>,
    /// Set when `state` is `Failed`; the tokens produced before the failure
    /// are retained above.
    pub error: Option<String>,
    pub cached_modules: Vec<NodePath>,
    pub computed_modules: Vec<NodePath>,
    pub prompt_tokens: usize,
    pub cached_tokens: usize,
}

pub struct GenerationEngine {
    backend: Arc<dyn ModelBackend>,
    assembler: StateAssembler,
}

impl GenerationEngine {
    pub fn new(cache: Arc<CacheEngine>, backend: Arc<dyn ModelBackend>) -> Self {
        let assembler = StateAssembler::new(cache, Arc::clone(&backend));
        Self { backend, assembler }
    }

    pub fn generate(
        &self,
        schema: &SchemaTree,
        selection: &[NodePath],
        bindings: &Bindings,
        params: &GenerationParams,
        sampler: &mut dyn Sampler,
        cancel: &CancelToken,
    ) -> Result<GenerationOutput> {
        // Bad request input is rejected before any cache or model work.
        let instance = PromptInstance::instantiate(schema, selection, bindings)?;
        let mask = AttentionMaskBuilder::build(&instance);

        let assembled = match self.assembler.assemble(&instance, &mask, cancel) {
            Ok(assembled) => assembled,
            Err(Error::Cancelled) => {
                return Ok(Self::finished(
                    Vec::new(),
                    StopReason::Cancelled,
                    Vec::new(),
                    Vec::new(),
                    instance.len(),
                    0,
                ));
            }
            Err(e) => return Err(e),
        };
        let cached_tokens = assembled.cached_token_count(&instance);
        debug!(prompt_tokens = instance.len(), cached_tokens, "decoding");

        let prompt_len = assembled.tokens.len();
        if prompt_len == 0 {
            // Nothing to decode from; no stop condition fired.
            return Ok(GenerationOutput {
                tokens: Vec::new(),
                state: GenerationState::Completed,
                reason: None,
                error: None,
                cached_modules: assembled.cached_modules,
                computed_modules: assembled.computed_modules,
                prompt_tokens: 0,
                cached_tokens: 0,
            });
        }

        let mut kv = assembled.kv;
        let mut generated: Vec<u32> = Vec::new();
        let finish = |generated: Vec<u32>, reason: StopReason| {
            Self::finished(
                generated,
                reason,
                assembled.cached_modules.clone(),
                assembled.computed_modules.clone(),
                prompt_len,
                cached_tokens,
            )
        };

        if cancel.is_cancelled() {
            return Ok(finish(generated, StopReason::Cancelled));
        }
        // Logits following the last prompt token: run it against the state of
        // everything before it (its own K/V is already assembled).
        let last = assembled.tokens[prompt_len - 1];
        let context = kv.prefix(prompt_len - 1)?;
        let mut step = self
            .backend
            .decode(&context, last, (prompt_len - 1) as u32)?;

        loop {
            let next = match sampler.sample(&step.logits) {
                Ok(next) => next,
                Err(e) => return self.fail(generated, e.into(), &finish),
            };
            generated.push(next);

            if params.eos_token == Some(next) {
                return Ok(finish(generated, StopReason::Eos));
            }
            if params
                .stop_sequences
                .iter()
                .any(|stop| !stop.is_empty() && generated.ends_with(stop))
            {
                return Ok(finish(generated, StopReason::StopSequence));
            }
            if generated.len() >= params.max_new_tokens {
                return Ok(finish(generated, StopReason::MaxTokens));
            }
            if cancel.is_cancelled() {
                return Ok(finish(generated, StopReason::Cancelled));
            }

            let position = (prompt_len + generated.len() - 1) as u32;
            match self.backend.decode(&kv, next, position) {
                Ok(next_step) => {
                    if let Err(e) = self.check_step(&next_step) {
                        return self.fail(generated, e, &finish);
                    }
                    kv.append(&next_step.kv)?;
                    step = next_step;
                }
                Err(e) => return self.fail(generated, e.into(), &finish),
            }
        }
    }

    /// Malformed decode output must never reach `append`, whose per-layer zip
    /// would silently drop the excess and corrupt the assembled state.
    fn check_step(&self, step: &DecodeStep) -> Result<()> {
        if step.kv.num_layers() != self.backend.num_layers() {
            return Err(CollaboratorError::msg(format!(
                "backend returned {} layers for a decode step, expected {}",
                step.kv.num_layers(),
                self.backend.num_layers()
            ))
            .into());
        }
        if step.kv.seq_len() != 1 {
            return Err(CollaboratorError::msg(format!(
                "backend returned {} positions for a decode step, expected 1",
                step.kv.seq_len()
            ))
            .into());
        }
        Ok(())
    }

    /// Collaborator failure during decoding: surface partial output when any
    /// tokens were produced, otherwise surface the error whole.
    fn fail(
        &self,
        generated: Vec<u32>,
        error: Error,
        finish: impl Fn(Vec<u32>, StopReason) -> GenerationOutput,
    ) -> Result<GenerationOutput> {
        if generated.is_empty() {
            return Err(error);
        }
        let mut output = finish(generated, StopReason::MaxTokens);
        output.state = GenerationState::Failed;
        output.reason = None;
        output.error = Some(error.to_string());
        Ok(output)
    }

    fn finished(
        tokens: Vec<u32>,
        reason: StopReason,
        cached_modules: Vec<NodePath>,
        computed_modules: Vec<NodePath>,
        prompt_tokens: usize,
        cached_tokens: usize,
    ) -> GenerationOutput {
        GenerationOutput {
            tokens,
            state: reason.state(),
            reason: Some(reason),
            error: None,
            cached_modules,
            computed_modules,
            prompt_tokens,
            cached_tokens,
        }
    }
}
