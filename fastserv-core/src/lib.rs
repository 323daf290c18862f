//! Schema-driven KV cache reuse for fast LLM serving.
//!
//! Prompts are described by a schema: a tree of named, optionally
//! parameterized modules that can be composed per request. The engine caches
//! the attention key/value state each module produces in isolation and, for a
//! new request, splices cached module states together with freshly computed
//! state, then drives autoregressive decoding from the assembled state.
//!
//! Model math, tokenization and sampling mechanics are collaborator seams
//! ([`ModelBackend`], [`Sampler`]); this crate owns the structure, caching and
//! assembly logic that makes their reuse correct.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::warn;

mod assembler;
mod backend;
mod cache;
mod engine;
mod error;
mod instance;
mod mask;
mod request;
mod response;
mod sampler;
mod schema;
#[cfg(test)]
mod testing;

pub use assembler::{AssembledState, StateAssembler};
pub use backend::{DecodeStep, KvState, LayerKv, ModelBackend, SEQ_DIM};
pub use cache::{CacheEngine, CacheHit, CacheKey, InsertOutcome};
pub use engine::{GenerationEngine, GenerationOutput, GenerationState, StopReason};
pub use error::{
    BindingError, CollaboratorError, Error, InvalidKeyError, Result, SchemaError, SelectionError,
};
pub use instance::{Bindings, ModuleInstance, PromptInstance, Segment};
pub use mask::{AttentionMaskBuilder, BlockMask, MaskSlice};
pub use request::{CancelToken, Request};
pub use response::{CompletionResponse, Response, Usage};
pub use sampler::{BasicSampler, GenerationParams, Sampler};
pub use schema::{NodeDef, NodeKind, NodePath, SchemaDef, SchemaNode, SchemaTree};

/// The serving handle. Requests go to the engine thread over an `mpsc`
/// channel; each request is served on its own worker so concurrent requests
/// read-share one [`CacheEngine`].
pub struct FastServ {
    sender: Sender<Request>,
    cache: Arc<CacheEngine>,
    next_request_id: Mutex<usize>,
}

pub struct FastServBuilder {
    backend: Arc<dyn ModelBackend>,
    cache_budget_bytes: usize,
    seed: u64,
}

impl FastServBuilder {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            // 1 GiB unless configured otherwise.
            cache_budget_bytes: 1 << 30,
            seed: 0,
        }
    }

    pub fn with_cache_budget_bytes(mut self, budget: usize) -> Self {
        self.cache_budget_bytes = budget;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> FastServ {
        let cache = Arc::new(CacheEngine::new(self.cache_budget_bytes));
        let engine = Arc::new(GenerationEngine::new(Arc::clone(&cache), self.backend));
        let (sender, receiver) = channel();
        let seed = self.seed;
        thread::spawn(move || engine_loop(receiver, engine, seed));
        FastServ {
            sender,
            cache,
            next_request_id: Mutex::new(0),
        }
    }
}

impl FastServ {
    pub fn builder(backend: Arc<dyn ModelBackend>) -> FastServBuilder {
        FastServBuilder::new(backend)
    }

    pub fn get_sender(&self) -> Sender<Request> {
        self.sender.clone()
    }

    pub fn next_request_id(&self) -> usize {
        let mut id = self.next_request_id.lock().expect("id lock poisoned");
        let next = *id;
        *id += 1;
        next
    }

    /// The shared cache, e.g. for invalidation after a schema reload or a
    /// model swap.
    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }
}

fn engine_loop(receiver: Receiver<Request>, engine: Arc<GenerationEngine>, seed: u64) {
    while let Ok(request) = receiver.recv() {
        let engine = Arc::clone(&engine);
        thread::spawn(move || serve_one(request, &engine, seed));
    }
}

fn serve_one(request: Request, engine: &GenerationEngine, seed: u64) {
    let Request {
        schema,
        selection,
        bindings,
        params,
        response,
        id,
        cancel,
    } = request;
    let mut sampler = BasicSampler::from_params(seed ^ id as u64, &params);
    let outcome = engine.generate(&schema, &selection, &bindings, &params, &mut sampler, &cancel);
    let reply = match outcome {
        Ok(output) => Response::Done(CompletionResponse::from_output(id, output)),
        Err(
            e @ (Error::Schema(_) | Error::Binding(_) | Error::Selection(_)),
        ) => Response::ValidationError(Box::new(e)),
        Err(e) => Response::InternalError(Box::new(e)),
    };
    if response.send(reply).is_err() {
        warn!(request = id, "response channel closed before completion");
    }
}
