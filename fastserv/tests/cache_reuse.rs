//! End-to-end cache reuse scenarios through the public API.

use std::sync::Arc;
use std::thread;

use candle_core::{Device, Tensor};
use fastserv::{
    AttentionMaskBuilder, Bindings, CacheEngine, CancelToken, CollaboratorError,
    CompletionRequestBuilder, DecodeStep, FastServ, KvState, LayerKv, MaskSlice, ModelBackend,
    NodePath, PromptInstance, SchemaTree, StateAssembler,
};

/// Deterministic model collaborator: K/V are a pure function of
/// (token, position, layer) and logits echo a function of the last token.
struct EchoBackend;

const LAYERS: usize = 2;

impl ModelBackend for EchoBackend {
    fn model_id(&self) -> &str {
        "echo-1b"
    }

    fn num_layers(&self) -> usize {
        LAYERS
    }

    fn compute(
        &self,
        tokens: &[u32],
        positions: &[u32],
        _mask: &MaskSlice,
    ) -> Result<KvState, CollaboratorError> {
        let mut layers = Vec::with_capacity(LAYERS);
        for layer in 0..LAYERS {
            let data: Vec<f32> = tokens
                .iter()
                .zip(positions)
                .map(|(&t, &p)| t as f32 * 8.0 + p as f32 + layer as f32 * 1e5)
                .collect();
            let k = Tensor::from_vec(data, (1, tokens.len(), 1), &Device::Cpu)
                .map_err(|e| CollaboratorError(Box::new(e)))?;
            let v = (&k * 3.0).map_err(|e| CollaboratorError(Box::new(e)))?;
            layers.push(LayerKv { k, v });
        }
        Ok(KvState::new(layers))
    }

    fn decode(
        &self,
        _state: &KvState,
        token: u32,
        position: u32,
    ) -> Result<DecodeStep, CollaboratorError> {
        let kv = self.compute(&[token], &[position], &MaskSlice::causal(1))?;
        let mut logits = vec![0.0f32; 32];
        logits[(token as usize * 7 + position as usize) % 32] = 1.0;
        Ok(DecodeStep { kv, logits })
    }
}

fn schema() -> SchemaTree {
    SchemaTree::parse(
        r#"{
            "name": "chat",
            "children": [
                {"module": {"name": "system", "children": [{"text": {"tokens": [1, 2, 3]}}]}},
                {"module": {"name": "doc", "children": [{"param": {"name": "body"}}]}},
                {"module": {"name": "query", "children": [{"param": {"name": "question"}}]}}
            ]
        }"#,
    )
    .unwrap()
}

fn paths(names: &[&str]) -> Vec<NodePath> {
    names.iter().map(|n| n.parse().unwrap()).collect()
}

fn flatten(state: &KvState) -> Vec<Vec<f32>> {
    state
        .layers()
        .iter()
        .flat_map(|l| [&l.k, &l.v])
        .map(|t| t.flatten_all().unwrap().to_vec1().unwrap())
        .collect()
}

/// Request 1 selects [system, doc], request 2 selects [system, query]:
/// request 2 hits on system, misses on query, and its mask keeps system
/// blind to everything after it.
#[test]
fn sibling_requests_share_only_common_modules() {
    let cache = Arc::new(CacheEngine::new(1 << 20));
    let assembler = StateAssembler::new(Arc::clone(&cache), Arc::new(EchoBackend));
    let schema = schema();
    let bindings = Bindings::new()
        .bind("body", vec![50, 51, 52, 53])
        .bind("question", vec![60, 61]);
    let cancel = CancelToken::new();

    let first =
        PromptInstance::instantiate(&schema, &paths(&["chat/system", "chat/doc"]), &bindings)
            .unwrap();
    let mask = AttentionMaskBuilder::build(&first);
    let out = assembler.assemble(&first, &mask, &cancel).unwrap();
    assert_eq!(out.computed_modules.len(), 2);
    // system tokens (0..3) see nothing of doc (3..7).
    for i in 0..3 {
        for j in 3..7 {
            assert!(!mask.allows(i, j));
        }
    }

    let second =
        PromptInstance::instantiate(&schema, &paths(&["chat/system", "chat/query"]), &bindings)
            .unwrap();
    let mask = AttentionMaskBuilder::build(&second);
    let out = assembler.assemble(&second, &mask, &cancel).unwrap();
    assert_eq!(out.cached_modules, paths(&["chat/system"]));
    assert_eq!(out.computed_modules, paths(&["chat/query"]));

    // The spliced result matches a fully-cold assembly of request 2.
    let cold = StateAssembler::new(Arc::new(CacheEngine::new(1 << 20)), Arc::new(EchoBackend));
    let cold_out = cold.assemble(&second, &mask, &cancel).unwrap();
    assert_eq!(flatten(&out.kv), flatten(&cold_out.kv));
}

/// Reloading a schema with an added module changes its identity, so prior
/// entries become unreachable; explicit invalidation then reclaims them.
#[test]
fn schema_reload_orphans_old_entries() {
    let cache = Arc::new(CacheEngine::new(1 << 20));
    let assembler = StateAssembler::new(Arc::clone(&cache), Arc::new(EchoBackend));
    let old = schema();
    let bindings = Bindings::new().bind("question", vec![60]);
    let cancel = CancelToken::new();

    let instance =
        PromptInstance::instantiate(&old, &paths(&["chat/system"]), &bindings).unwrap();
    let mask = AttentionMaskBuilder::build(&instance);
    assembler.assemble(&instance, &mask, &cancel).unwrap();
    assert_eq!(cache.len(), 1);

    let reloaded = SchemaTree::parse(
        r#"{
            "name": "chat",
            "children": [
                {"module": {"name": "system", "children": [{"text": {"tokens": [1, 2, 3]}}]}},
                {"module": {"name": "doc", "children": [{"param": {"name": "body"}}]}},
                {"module": {"name": "query", "children": [{"param": {"name": "question"}}]}},
                {"module": {"name": "footer", "children": [{"text": {"tokens": [9]}}]}}
            ]
        }"#,
    )
    .unwrap();
    assert_ne!(old.identity(), reloaded.identity());

    let instance =
        PromptInstance::instantiate(&reloaded, &paths(&["chat/system"]), &bindings).unwrap();
    let mask = AttentionMaskBuilder::build(&instance);
    let out = assembler.assemble(&instance, &mask, &cancel).unwrap();
    assert!(out.cached_modules.is_empty(), "old identity must not hit");
    assert_eq!(cache.len(), 2);

    assert_eq!(cache.invalidate_schema(old.identity()), 1);
    assert_eq!(cache.invalidate_schema(old.identity()), 0);
    assert_eq!(cache.len(), 1);
}

#[test]
fn blocking_requests_through_the_handle() {
    let serv = FastServ::builder(Arc::new(EchoBackend))
        .with_cache_budget_bytes(1 << 20)
        .build();
    let schema = Arc::new(schema());

    let first = CompletionRequestBuilder::new(Arc::clone(&schema))
        .select("chat/system")
        .unwrap()
        .select("chat/query")
        .unwrap()
        .bind("question", vec![60, 61])
        .max_new_tokens(4)
        .send(&serv)
        .unwrap();
    assert_eq!(first.tokens.len(), 4);
    assert_eq!(first.usage.prompt_tokens, 5);
    assert_eq!(first.usage.cached_prompt_tokens, 0);

    // Same modules again: the whole prompt is served from cache, and decoding
    // is deterministic either way.
    let second = CompletionRequestBuilder::new(Arc::clone(&schema))
        .select("chat/system")
        .unwrap()
        .select("chat/query")
        .unwrap()
        .bind("question", vec![60, 61])
        .max_new_tokens(4)
        .send(&serv)
        .unwrap();
    assert_eq!(second.usage.cached_prompt_tokens, 5);
    assert_eq!(second.tokens, first.tokens);
}

#[test]
fn unbound_parameter_is_a_validation_error() {
    let serv = FastServ::builder(Arc::new(EchoBackend)).build();
    let err = CompletionRequestBuilder::new(Arc::new(schema()))
        .select("chat/query")
        .unwrap()
        .send(&serv)
        .unwrap_err();
    assert!(err.to_string().contains("question"));
}

#[test]
fn concurrent_requests_share_one_cache() {
    let serv = Arc::new(
        FastServ::builder(Arc::new(EchoBackend))
            .with_cache_budget_bytes(1 << 20)
            .build(),
    );
    let schema = Arc::new(schema());

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let serv = Arc::clone(&serv);
        let schema = Arc::clone(&schema);
        handles.push(thread::spawn(move || {
            CompletionRequestBuilder::new(schema)
                .select("chat/system")
                .unwrap()
                .select("chat/query")
                .unwrap()
                .bind("question", vec![60 + i])
                .max_new_tokens(2)
                .send(&serv)
                .unwrap()
        }));
    }
    let responses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(responses.len(), 8);
    for response in &responses {
        assert_eq!(response.tokens.len(), 2);
    }
    // Each distinct question binding is its own entry; system is shared.
    assert!(serv.cache().len() <= 9);
    assert!(serv.cache().used_bytes() <= serv.cache().budget_bytes());
}
