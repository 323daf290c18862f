//! Public SDK for fastserv: schema-driven KV cache reuse for LLM serving.
//!
//! Re-exports the core engine and adds a small blocking request builder on
//! top of the channel-based [`FastServ`] handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fastserv::{CompletionRequestBuilder, FastServ, SchemaTree};
//! # fn backend() -> Arc<dyn fastserv::ModelBackend> { unimplemented!() }
//!
//! # fn main() -> anyhow::Result<()> {
//! let serv = FastServ::builder(backend()).build();
//! let schema = Arc::new(SchemaTree::parse(r#"{
//!     "name": "chat",
//!     "children": [
//!         {"module": {"name": "system", "children": [{"text": {"tokens": [1, 2]}}]}},
//!         {"module": {"name": "query", "children": [{"param": {"name": "q"}}]}}
//!     ]
//! }"#)?);
//! let response = CompletionRequestBuilder::new(schema)
//!     .select("chat/system")?
//!     .select("chat/query")?
//!     .bind("q", vec![7, 8, 9])
//!     .max_new_tokens(64)
//!     .send(&serv)?;
//! println!("{:?}", response.tokens);
//! # Ok(())
//! # }
//! ```

use std::sync::mpsc::channel;
use std::sync::Arc;

use anyhow::{anyhow, Context};

pub use fastserv_core::{
    AssembledState, AttentionMaskBuilder, BasicSampler, BindingError, Bindings, BlockMask,
    CacheEngine, CacheHit, CacheKey, CancelToken, CollaboratorError, CompletionResponse,
    DecodeStep, Error, FastServ, FastServBuilder, GenerationEngine, GenerationOutput,
    GenerationParams, GenerationState, InsertOutcome, InvalidKeyError, KvState, LayerKv,
    MaskSlice, ModelBackend, ModuleInstance, NodeDef, NodeKind, NodePath, PromptInstance, Request,
    Response, Sampler, SchemaDef, SchemaError, SchemaTree, Segment, SelectionError, StateAssembler,
    StopReason, Usage,
};

/// Builder for one blocking completion request.
pub struct CompletionRequestBuilder {
    schema: Arc<SchemaTree>,
    selection: Vec<NodePath>,
    bindings: Bindings,
    params: GenerationParams,
    cancel: CancelToken,
}

impl CompletionRequestBuilder {
    pub fn new(schema: Arc<SchemaTree>) -> Self {
        Self {
            schema,
            selection: Vec::new(),
            bindings: Bindings::new(),
            params: GenerationParams::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Append a module path to the selection; modules appear in the order
    /// they are selected.
    pub fn select(mut self, path: &str) -> anyhow::Result<Self> {
        self.selection
            .push(path.parse().with_context(|| format!("bad module path `{path}`"))?);
        Ok(self)
    }

    pub fn bind(mut self, slot: impl Into<String>, tokens: Vec<u32>) -> Self {
        self.bindings.set(slot, tokens);
        self
    }

    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.params.max_new_tokens = n;
        self
    }

    pub fn stop_sequence(mut self, tokens: Vec<u32>) -> Self {
        self.params.stop_sequences.push(tokens);
        self
    }

    pub fn eos_token(mut self, token: u32) -> Self {
        self.params.eos_token = Some(token);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.params.top_p = Some(top_p);
        self
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// A handle that cancels this request between collaborator calls.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Send the request and block until the engine replies.
    pub fn send(self, serv: &FastServ) -> anyhow::Result<CompletionResponse> {
        let (tx, rx) = channel();
        let request = Request {
            schema: self.schema,
            selection: self.selection,
            bindings: self.bindings,
            params: self.params,
            response: tx,
            id: serv.next_request_id(),
            cancel: self.cancel,
        };
        serv.get_sender()
            .send(request)
            .map_err(|_| anyhow!("engine thread is gone"))?;
        match rx.recv().context("engine dropped the response channel")? {
            Response::Done(response) => Ok(response),
            Response::ValidationError(e) => Err(anyhow!(e)),
            Response::InternalError(e) => Err(anyhow!(e)),
        }
    }
}
