//! Schema trees: modular prompt templates with stable structural identity.
//!
//! A schema is a tree of named nodes (modules, parameter slots, literal token
//! runs) owned in an arena and addressed by index or by [`NodePath`]. The
//! tree's [`identity`](SchemaTree::identity) is a content hash over structural
//! shape only, so two schemas loaded from different sources are
//! interchangeable for cache purposes whenever their shapes match.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Deserialize;

use crate::error::SchemaError;

/// Ordered path of node names from the schema root, e.g. `chat/system`.
/// Unique within a schema and stable across compatible schema versions; the
/// module-path component of every cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<String>);

impl NodePath {
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is an ancestor of `other`, or the same path.
    pub fn is_ancestor_or_self(&self, other: &NodePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl serde::Serialize for NodePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for NodePath {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(SchemaError::EmptyName);
        }
        Ok(Self(segments))
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Module,
    ParameterSlot,
    /// Fixed schema content, already tokenized (tokenization is a collaborator
    /// concern; the core never sees raw text).
    Literal { tokens: Vec<u32> },
}

impl NodeKind {
    fn tag(&self) -> u8 {
        match self {
            Self::Module => 0,
            Self::ParameterSlot => 1,
            Self::Literal { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub path: NodePath,
    pub kind: NodeKind,
    /// Whether this node's descendant tokens may be attended to by later,
    /// unrelated modules in the same request.
    pub allow_shared: bool,
    children: Vec<usize>,
}

impl SchemaNode {
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn is_module(&self) -> bool {
        matches!(self.kind, NodeKind::Module)
    }
}

/// One element of the JSON schema definition format.
///
/// Parameter slots and literals are leaves by construction, so malformed
/// nesting is rejected at deserialization time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum NodeDef {
    #[serde(rename = "module")]
    Module {
        name: String,
        #[serde(default)]
        shared: bool,
        #[serde(default)]
        children: Vec<NodeDef>,
    },
    #[serde(rename = "param")]
    Param { name: String },
    #[serde(rename = "text")]
    Text { tokens: Vec<u32> },
}

/// Top-level schema definition: a named root module and its children.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDef {
    pub name: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub children: Vec<NodeDef>,
}

/// A parsed prompt schema. Nodes are parent-owned in an arena; index 0 is the
/// root module.
#[derive(Debug)]
pub struct SchemaTree {
    nodes: Vec<SchemaNode>,
    by_path: HashMap<NodePath, usize>,
    identity: OnceLock<u64>,
}

impl SchemaTree {
    /// Parse a schema from its JSON definition text.
    pub fn parse(definition: &str) -> Result<Self, SchemaError> {
        let def: SchemaDef = serde_json::from_str(definition)?;
        Self::from_def(&def)
    }

    /// Build a schema from an already-deserialized definition.
    pub fn from_def(def: &SchemaDef) -> Result<Self, SchemaError> {
        let mut tree = Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
            identity: OnceLock::new(),
        };
        validate_name(&def.name)?;
        let root_path = NodePath::root(&def.name);
        tree.push_node(root_path.clone(), NodeKind::Module, def.shared)?;
        for (ordinal, child) in def.children.iter().enumerate() {
            tree.add_def(0, &root_path, child, ordinal)?;
        }
        Ok(tree)
    }

    fn add_def(
        &mut self,
        parent: usize,
        parent_path: &NodePath,
        def: &NodeDef,
        ordinal: usize,
    ) -> Result<usize, SchemaError> {
        let idx = match def {
            NodeDef::Module {
                name,
                shared,
                children,
            } => {
                validate_name(name)?;
                let path = parent_path.child(name);
                let idx = self.push_node(path.clone(), NodeKind::Module, *shared)?;
                for (ordinal, child) in children.iter().enumerate() {
                    self.add_def(idx, &path, child, ordinal)?;
                }
                idx
            }
            NodeDef::Param { name } => {
                validate_name(name)?;
                self.push_node(parent_path.child(name), NodeKind::ParameterSlot, false)?
            }
            NodeDef::Text { tokens } => {
                // Literals are anonymous in the definition; name them by
                // ordinal so every arena node has a unique path.
                let path = parent_path.child(format!("#{ordinal}"));
                self.push_node(
                    path,
                    NodeKind::Literal {
                        tokens: tokens.clone(),
                    },
                    false,
                )?
            }
        };
        self.nodes[parent].children.push(idx);
        Ok(idx)
    }

    fn push_node(
        &mut self,
        path: NodePath,
        kind: NodeKind,
        allow_shared: bool,
    ) -> Result<usize, SchemaError> {
        if self.by_path.contains_key(&path) {
            return Err(SchemaError::DuplicatePath(path.to_string()));
        }
        let idx = self.nodes.len();
        self.by_path.insert(path.clone(), idx);
        self.nodes.push(SchemaNode {
            path,
            kind,
            allow_shared,
            children: Vec::new(),
        });
        Ok(idx)
    }

    pub fn root(&self) -> &SchemaNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &SchemaNode {
        &self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, path: &NodePath) -> Option<usize> {
        self.by_path.get(path).copied()
    }

    /// Content hash of the structural shape: node kinds, paths, nesting,
    /// literal tokens and shared flags. Independent of any parameter values.
    /// Memoized after the first computation.
    pub fn identity(&self) -> u64 {
        *self.identity.get_or_init(|| {
            let mut hasher = DefaultHasher::new();
            for node in &self.nodes {
                node.kind.tag().hash(&mut hasher);
                node.path.segments().hash(&mut hasher);
                node.allow_shared.hash(&mut hasher);
                if let NodeKind::Literal { tokens } = &node.kind {
                    tokens.hash(&mut hasher);
                }
                node.children.hash(&mut hasher);
            }
            hasher.finish()
        })
    }
}

fn validate_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::EmptyName);
    }
    if name.contains('/') {
        return Err(SchemaError::SeparatorInName(name.to_string()));
    }
    Ok(())
}
