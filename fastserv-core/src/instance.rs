//! Prompt instances: a schema bound to concrete parameter values and a
//! caller-ordered module selection, materialized as a linear token sequence.
//!
//! Positions are kept in two frames. Globally, tokens occupy the running
//! offsets `0..n` of the assembled sequence. For cache purposes every selected
//! module also carries zero-based local offsets, and the assembler rebases
//! those at splice time; this is what makes a cached module buffer portable
//! across reorderings of its siblings.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use indexmap::IndexMap;

use crate::cache::CacheKey;
use crate::error::{BindingError, Error, Result, SelectionError};
use crate::schema::{NodeKind, NodePath, SchemaTree};

/// Slot-name to token-value bindings supplied at request time.
#[derive(Debug, Clone, Default)]
pub struct Bindings(IndexMap<String, Vec<u32>>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, slot: impl Into<String>, tokens: Vec<u32>) -> Self {
        self.set(slot, tokens);
        self
    }

    pub fn set(&mut self, slot: impl Into<String>, tokens: Vec<u32>) {
        self.0.insert(slot.into(), tokens);
    }

    pub fn get(&self, slot: &str) -> Option<&[u32]> {
        self.0.get(slot).map(Vec::as_slice)
    }
}

/// A contiguous token run owned by one deepest module path.
#[derive(Debug, Clone)]
pub struct Segment {
    pub owner: NodePath,
    pub range: Range<usize>,
    /// Effective shared flag: set if any node on the owner's path allows
    /// sharing of its descendant tokens.
    pub allow_shared: bool,
}

/// One selected module as it appears in the instance.
#[derive(Debug, Clone)]
pub struct ModuleInstance {
    pub path: NodePath,
    /// Global token span of the whole module subtree.
    pub span: Range<usize>,
    /// Hash over the subtree's (slot path, bound tokens) pairs in traversal
    /// order; the parameter component of the module's cache key.
    pub param_hash: u64,
    pub allow_shared: bool,
    pub segments: Vec<Segment>,
}

impl ModuleInstance {
    pub fn token_count(&self) -> usize {
        self.span.len()
    }
}

/// The materialization of a schema for one request. Immutable once built.
#[derive(Debug)]
pub struct PromptInstance {
    schema_identity: u64,
    tokens: Vec<u32>,
    modules: Vec<ModuleInstance>,
}

impl PromptInstance {
    /// Materialize `schema` for the selected modules, in caller order; the
    /// engine performs no implicit reordering.
    pub fn instantiate(
        schema: &SchemaTree,
        selection: &[NodePath],
        bindings: &Bindings,
    ) -> Result<Self> {
        let selected = validate_selection(schema, selection)?;

        let mut tokens = Vec::new();
        let mut modules = Vec::with_capacity(selected.len());
        for (path, node_idx) in selection.iter().zip(selected) {
            let start = tokens.len();
            let mut emitter = ModuleEmitter {
                schema,
                bindings,
                module: path,
                tokens: &mut tokens,
                segments: Vec::new(),
                param_hasher: DefaultHasher::new(),
            };
            let inherited = ancestors_allow_shared(schema, path);
            let root_shared = emitter.emit(node_idx, path, inherited)?;
            let segments = std::mem::take(&mut emitter.segments);
            let param_hash = emitter.param_hasher.finish();
            modules.push(ModuleInstance {
                path: path.clone(),
                span: start..tokens.len(),
                param_hash,
                allow_shared: root_shared,
                segments,
            });
        }

        Ok(Self {
            schema_identity: schema.identity(),
            tokens,
            modules,
        })
    }

    pub fn schema_identity(&self) -> u64 {
        self.schema_identity
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn modules(&self) -> &[ModuleInstance] {
        &self.modules
    }

    pub fn module_tokens(&self, module_idx: usize) -> &[u32] {
        &self.tokens[self.modules[module_idx].span.clone()]
    }

    /// Zero-based local positions for a module, the frame its cached state is
    /// computed in.
    pub fn local_positions(&self, module_idx: usize) -> Vec<u32> {
        (0..self.modules[module_idx].token_count() as u32).collect()
    }

    /// Global running positions for the full sequence.
    pub fn global_positions(&self) -> Vec<u32> {
        (0..self.tokens.len() as u32).collect()
    }

    pub fn cache_key(&self, module_idx: usize, model_id: &str) -> CacheKey {
        let module = &self.modules[module_idx];
        CacheKey {
            schema_identity: self.schema_identity,
            module_path: module.path.clone(),
            param_hash: module.param_hash,
            model_id: model_id.to_string(),
        }
    }
}

/// Whether any strict ancestor of `path` in the schema allows sharing.
fn ancestors_allow_shared(schema: &SchemaTree, path: &NodePath) -> bool {
    let segments = path.segments();
    (1..segments.len()).any(|end| {
        let prefix = NodePath::from_segments(segments[..end].to_vec());
        schema
            .find(&prefix)
            .is_some_and(|idx| schema.node(idx).allow_shared)
    })
}

fn validate_selection(schema: &SchemaTree, selection: &[NodePath]) -> Result<Vec<usize>> {
    let mut seen = HashSet::new();
    let mut indices = Vec::with_capacity(selection.len());
    for path in selection {
        let Some(idx) = schema.find(path) else {
            return Err(SelectionError::UnknownPath(path.to_string()).into());
        };
        if !schema.node(idx).is_module() {
            return Err(SelectionError::NotAModule(path.to_string()).into());
        }
        if !seen.insert(path.clone()) {
            return Err(SelectionError::Duplicate(path.to_string()).into());
        }
        indices.push(idx);
    }
    for parent in selection {
        for child in selection {
            if parent != child && parent.is_ancestor_or_self(child) {
                return Err(SelectionError::Nested {
                    child: child.to_string(),
                    parent: parent.to_string(),
                }
                .into());
            }
        }
    }
    Ok(indices)
}

struct ModuleEmitter<'a> {
    schema: &'a SchemaTree,
    bindings: &'a Bindings,
    module: &'a NodePath,
    tokens: &'a mut Vec<u32>,
    segments: Vec<Segment>,
    param_hasher: DefaultHasher,
}

impl ModuleEmitter<'_> {
    /// Depth-first emission of one node. Returns the effective shared flag of
    /// the node itself so the caller can record it for the subtree root.
    fn emit(
        &mut self,
        node_idx: usize,
        deepest_module: &NodePath,
        inherited_shared: bool,
    ) -> Result<bool> {
        let node = self.schema.node(node_idx);
        let shared = inherited_shared || node.allow_shared;
        match &node.kind {
            NodeKind::Module => {
                let owner = node.path.clone();
                for &child in node.children() {
                    self.emit(child, &owner, shared)?;
                }
            }
            NodeKind::Literal { tokens } => {
                self.push_run(deepest_module, shared, tokens.clone());
            }
            NodeKind::ParameterSlot => {
                let slot = node
                    .path
                    .segments()
                    .last()
                    .expect("schema nodes always have at least one path segment");
                let Some(value) = self.bindings.get(slot) else {
                    return Err(Error::Binding(BindingError {
                        slot: slot.clone(),
                        module: self.module.to_string(),
                    }));
                };
                node.path.segments().hash(&mut self.param_hasher);
                value.hash(&mut self.param_hasher);
                self.push_run(deepest_module, shared, value.to_vec());
            }
        }
        Ok(shared)
    }

    fn push_run(&mut self, owner: &NodePath, allow_shared: bool, run: Vec<u32>) {
        if run.is_empty() {
            return;
        }
        let start = self.tokens.len();
        self.tokens.extend(run);
        let end = self.tokens.len();
        // Merge with the previous segment when ownership is unchanged.
        if let Some(last) = self.segments.last_mut() {
            if last.owner == *owner && last.allow_shared == allow_shared && last.range.end == start
            {
                last.range.end = end;
                return;
            }
        }
        self.segments.push(Segment {
            owner: owner.clone(),
            range: start..end,
            allow_shared,
        });
    }
}
