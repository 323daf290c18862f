use std::error::Error;

use serde::Serialize;

use crate::engine::{GenerationOutput, GenerationState, StopReason};
use crate::schema::NodePath;

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    /// Prompt tokens whose attention state was served from cache.
    pub cached_prompt_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub id: usize,
    pub tokens: Vec<u32>,
    pub state: GenerationState,
    pub reason: Option<StopReason>,
    pub error: Option<String>,
    pub cached_modules: Vec<NodePath>,
    pub computed_modules: Vec<NodePath>,
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn from_output(id: usize, output: GenerationOutput) -> Self {
        let usage = Usage {
            prompt_tokens: output.prompt_tokens,
            completion_tokens: output.tokens.len(),
            cached_prompt_tokens: output.cached_tokens,
        };
        Self {
            id,
            tokens: output.tokens,
            state: output.state,
            reason: output.reason,
            error: output.error,
            cached_modules: output.cached_modules,
            computed_modules: output.computed_modules,
            usage,
        }
    }
}

pub enum Response {
    Done(CompletionResponse),
    /// Bad request input (selection or bindings); nothing was computed.
    ValidationError(Box<dyn Error + Send + Sync>),
    /// Engine-side failure before any output existed.
    InternalError(Box<dyn Error + Send + Sync>),
}
