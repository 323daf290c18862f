//! Error taxonomy for the core engine.

use thiserror::Error;

/// A schema definition could not be parsed or violates a structural invariant.
/// Fatal to the parse call, never to the process.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to deserialize schema definition: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("node name may not be empty")]
    EmptyName,
    #[error("node name `{0}` may not contain `/`")]
    SeparatorInName(String),
    #[error("duplicate node path `{0}`")]
    DuplicatePath(String),
}

/// A request referenced a parameter slot with no bound value.
#[derive(Error, Debug)]
#[error("parameter slot `{slot}` under module `{module}` has no binding")]
pub struct BindingError {
    pub slot: String,
    pub module: String,
}

/// A request selected module paths the schema cannot satisfy.
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("selected path `{0}` does not exist in the schema")]
    UnknownPath(String),
    #[error("selected path `{0}` is not a module")]
    NotAModule(String),
    #[error("path `{0}` selected more than once")]
    Duplicate(String),
    #[error("selected path `{child}` is nested inside selected path `{parent}`")]
    Nested { child: String, parent: String },
}

/// A malformed cache key. This is a programming error in key construction,
/// not a recoverable request failure.
#[derive(Error, Debug)]
#[error("malformed cache key: {0}")]
pub struct InvalidKeyError(pub String);

/// The model-execution collaborator failed.
#[derive(Error, Debug)]
#[error("model execution failed: {0}")]
pub struct CollaboratorError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl CollaboratorError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
